use converse::agent::arbiter::{arbitrate, Candidate, Verdict};
use converse::agent::types::{AnalysisKind, CommandAnalysis};

fn candidate(handler_idx: usize, priority: i32, kind: AnalysisKind) -> Candidate {
    Candidate {
        handler_idx,
        priority,
        analysis: CommandAnalysis {
            kind,
            utterance: "test".to_string(),
            user_target: String::new(),
        },
    }
}

#[test]
fn stop_beats_everything() {
    let verdict = arbitrate(
        vec![
            candidate(0, 10, AnalysisKind::ConfidentInDomainCommand),
            candidate(1, 0, AnalysisKind::Stop),
        ],
        Some(0),
    );
    assert!(matches!(verdict, Verdict::Stop));
}

#[test]
fn debug_beats_commands_but_not_stop() {
    let verdict = arbitrate(
        vec![
            candidate(0, 10, AnalysisKind::ConfidentInDomainCommand),
            candidate(1, 0, AnalysisKind::Debug),
        ],
        None,
    );
    assert!(matches!(verdict, Verdict::Debug));

    let verdict = arbitrate(
        vec![candidate(0, 0, AnalysisKind::Debug), candidate(1, 0, AnalysisKind::Stop)],
        None,
    );
    assert!(matches!(verdict, Verdict::Stop));
}

#[test]
fn confident_beats_nonconfident() {
    let verdict = arbitrate(
        vec![
            candidate(0, 100, AnalysisKind::NonconfidentInDomainCommand),
            candidate(1, 0, AnalysisKind::ConfidentInDomainCommand),
        ],
        None,
    );
    match verdict {
        Verdict::Winner { handler_idx, .. } => assert_eq!(handler_idx, 1),
        other => panic!("expected winner, got {:?}", other),
    }
}

#[test]
fn followup_only_accepted_from_current_handler() {
    // The non-current followup drops out entirely, so the nonconfident
    // command wins.
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::ConfidentInDomainFollowup),
            candidate(1, 0, AnalysisKind::NonconfidentInDomainCommand),
        ],
        Some(1),
    );
    match verdict {
        Verdict::Winner { handler_idx, .. } => assert_eq!(handler_idx, 1),
        other => panic!("expected winner, got {:?}", other),
    }
}

#[test]
fn two_foreign_followups_apply_to_neither() {
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::ConfidentInDomainFollowup),
            candidate(1, 0, AnalysisKind::ConfidentInDomainFollowup),
        ],
        None,
    );
    assert!(matches!(verdict, Verdict::NotUnderstood));
}

#[test]
fn priority_breaks_confidence_ties() {
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::ConfidentInDomainCommand),
            candidate(1, 5, AnalysisKind::ConfidentInDomainCommand),
        ],
        None,
    );
    match verdict {
        Verdict::Winner { handler_idx, .. } => assert_eq!(handler_idx, 1),
        other => panic!("expected winner, got {:?}", other),
    }
}

#[test]
fn current_handler_breaks_priority_ties() {
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::ConfidentInDomainCommand),
            candidate(1, 0, AnalysisKind::ConfidentInDomainCommand),
        ],
        Some(1),
    );
    match verdict {
        Verdict::Winner { handler_idx, .. } => assert_eq!(handler_idx, 1),
        other => panic!("expected winner, got {:?}", other),
    }
}

#[test]
fn first_reporter_wins_full_ties() {
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::ConfidentInDomainCommand),
            candidate(1, 0, AnalysisKind::ConfidentInDomainCommand),
        ],
        None,
    );
    match verdict {
        Verdict::Winner { handler_idx, .. } => assert_eq!(handler_idx, 0),
        other => panic!("expected winner, got {:?}", other),
    }
}

#[test]
fn all_out_of_domain_is_not_understood() {
    let verdict = arbitrate(
        vec![
            candidate(0, 0, AnalysisKind::OutOfDomainCommand),
            candidate(1, 10, AnalysisKind::OutOfDomainCommand),
        ],
        None,
    );
    assert!(matches!(verdict, Verdict::NotUnderstood));
}

#[test]
fn empty_candidate_list_is_not_understood() {
    assert!(matches!(arbitrate(Vec::new(), None), Verdict::NotUnderstood));
}
