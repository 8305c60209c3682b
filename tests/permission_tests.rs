//! The consent card, including the only-if filter round trip.

mod common;

use common::*;
use converse::agent::types::{AskSpecialKind, UserInput};
use converse::program::parse::{parse_command, ControlCommand};
use std::collections::HashMap;

fn eat_data_program() -> converse::program::ast::Program {
    match parse_command(&tok(&["now", "=>", "@com.bing.eat_data"]), &HashMap::new()).unwrap() {
        ControlCommand::Program(program) => program,
        other => panic!("expected program, got {:?}", other),
    }
}

#[tokio::test]
async fn only_if_loops_back_on_rejected_confirmation() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    let conversation = h.conversation.clone();
    let request = tokio::spawn(async move {
        conversation
            .ask_for_permission("mock-account:MOCK123", "Bob", eat_data_program())
            .await
    });

    // The card shows all five options.
    wait_for_text(&h.delegate, "Bob would like to consume data").await;
    let segment = h.delegate.all();
    assert!(segment.contains(&Sent::Choice(0, "Yes this time".to_string())));
    assert!(segment.contains(&Sent::Choice(4, "Only if...".to_string())));

    h.conversation.handle_command(special("special:maybe")).await.unwrap();
    assert!(h.delegate.contains_text("Add a condition on the data."));
    h.delegate.take();

    // First round: data contains "oo", then reject the confirmation.
    h.conversation
        .handle_command(UserInput::parsed(tok(&[
            "bookkeeping",
            "filter",
            "data",
            "=~",
            "\"oo\"",
        ])))
        .await
        .unwrap();
    assert!(h.delegate.contains_text("only if data contains oo. Is that right?"));
    h.conversation.handle_command(special("special:no")).await.unwrap();

    // Rejection loops back to the consent card.
    let segment = h.delegate.take();
    assert!(segment.iter().any(|m| matches!(
        m,
        Sent::Text(t) if t.contains("Bob would like to consume data")
    )));
    assert!(h.executor.permissions.lock().unwrap().is_empty());

    // Second round: same filter, confirm.
    h.conversation.handle_command(special("special:maybe")).await.unwrap();
    h.conversation
        .handle_command(UserInput::parsed(tok(&[
            "bookkeeping",
            "filter",
            "data",
            "=~",
            "\"oo\"",
        ])))
        .await
        .unwrap();
    h.conversation.handle_command(special("special:yes")).await.unwrap();

    let granted = request.await.unwrap();
    assert!(granted.is_some());
    assert_eq!(
        h.executor.permissions.lock().unwrap().clone(),
        vec!["source == \"mock-account:MOCK123\" : now => @com.bing.eat_data, data =~ \"oo\";"]
    );
    let segment = h.delegate.take();
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Null))));
}

#[tokio::test]
async fn refusal_returns_none_and_stores_nothing() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    let conversation = h.conversation.clone();
    let request = tokio::spawn(async move {
        conversation
            .ask_for_permission("mock-account:MOCK123", "Bob", eat_data_program())
            .await
    });

    wait_for_text(&h.delegate, "Bob would like to consume data").await;
    h.conversation.handle_command(special("special:no")).await.unwrap();
    assert_eq!(request.await.unwrap(), None);
    assert!(h.executor.permissions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn always_from_anybody_installs_an_open_rule() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    let conversation = h.conversation.clone();
    let request = tokio::spawn(async move {
        conversation
            .ask_for_permission("mock-account:MOCK123", "Bob", eat_data_program())
            .await
    });

    wait_for_text(&h.delegate, "Bob would like to consume data").await;
    h.conversation.handle_command(choice(1)).await.unwrap();
    assert!(request.await.unwrap().is_some());
    assert_eq!(
        h.executor.permissions.lock().unwrap().clone(),
        vec!["true : now => @com.bing.eat_data;"]
    );
}

#[tokio::test]
async fn nevermind_during_consent_reports_refusal() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    let conversation = h.conversation.clone();
    let request = tokio::spawn(async move {
        conversation
            .ask_for_permission("mock-account:MOCK123", "Bob", eat_data_program())
            .await
    });

    wait_for_text(&h.delegate, "Bob would like to consume data").await;
    h.conversation.handle_command(special("special:nevermind")).await.unwrap();
    assert_eq!(request.await.unwrap(), None);
    assert!(h.delegate.contains_text("Sorry I couldn't help on that."));
}
