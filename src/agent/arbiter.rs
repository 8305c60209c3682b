use super::types::{AnalysisKind, CommandAnalysis};
use tracing::debug;

/// One handler's vote for the current turn.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub handler_idx: usize,
    pub priority: i32,
    pub analysis: CommandAnalysis,
}

/// What the loop should do with this turn.
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Cancel the session (STOP always wins).
    Stop,
    /// Dump loop and handler state (DEBUG always wins, after STOP).
    Debug,
    /// Route the turn to this handler.
    Winner { handler_idx: usize, analysis: CommandAnalysis },
    /// Nobody beat out-of-domain; emit the "didn't understand" reply.
    NotUnderstood,
}

/// Select the winning handler for one user turn.
///
/// Rules, cumulative and in order:
/// 1. STOP and DEBUG win regardless of confidence.
/// 2. Confidence tiers: confident command/followup > nonconfident pair >
///    out-of-domain.
/// 3. Followup analyses are only accepted from the current handler. Two
///    confident followups from non-current handlers both drop out; neither
///    applies.
/// 4. Equal confidence: higher priority wins, then the current handler,
///    then the first reporter.
/// 5. Nothing above out-of-domain: not understood.
pub fn arbitrate(candidates: Vec<Candidate>, current_handler_idx: Option<usize>) -> Verdict {
    if candidates.iter().any(|c| c.analysis.kind == AnalysisKind::Stop) {
        return Verdict::Stop;
    }
    if candidates.iter().any(|c| c.analysis.kind == AnalysisKind::Debug) {
        return Verdict::Debug;
    }

    let mut best: Option<Candidate> = None;
    for cand in candidates {
        if cand.analysis.kind.is_followup() && Some(cand.handler_idx) != current_handler_idx {
            debug!(
                handler = cand.handler_idx,
                "dropping followup analysis from non-current handler"
            );
            continue;
        }
        let replace = match &best {
            None => true,
            Some(b) => {
                let (bt, ct) = (b.analysis.kind.tier(), cand.analysis.kind.tier());
                if ct != bt {
                    ct > bt
                } else if cand.priority != b.priority {
                    cand.priority > b.priority
                } else {
                    // Priority tie: the current handler takes it from an
                    // earlier reporter, otherwise first reporter stands.
                    Some(cand.handler_idx) == current_handler_idx
                        && Some(b.handler_idx) != current_handler_idx
                }
            }
        };
        if replace {
            best = Some(cand);
        }
    }

    match best {
        Some(cand) if cand.analysis.kind.tier() > 0 => Verdict::Winner {
            handler_idx: cand.handler_idx,
            analysis: cand.analysis,
        },
        _ => Verdict::NotUnderstood,
    }
}
