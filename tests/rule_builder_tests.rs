//! The guided makerule flow: category walk, filter, run.

mod common;

use common::*;
use converse::agent::types::AskSpecialKind;

#[tokio::test]
async fn filter_builder_walks_to_a_monitor_rule() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.handle_command(special("special:makerule")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Pick one of the following categories.".to_string())));
    assert!(segment.contains(&Sent::Choice(0, "Media".to_string())));
    assert!(segment.contains(&Sent::Choice(1, "Back".to_string())));

    // Category -> skill -> example command.
    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "XKCD".to_string())));

    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "notify me when there is a new xkcd".to_string())));

    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "Add a filter".to_string())));
    assert!(segment.contains(&Sent::Choice(1, "Run it".to_string())));

    // Add a title-contains filter through the guided walk.
    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Pick the value to filter on.".to_string())));
    assert!(segment.contains(&Sent::Choice(0, "title".to_string())));

    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "contains".to_string())));

    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"lol\"")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.iter().any(|m| matches!(
        m,
        Sent::Text(t) if t.contains("(@com.xkcd.get_comic()), title =~ \"lol\" => notify;")
    )));

    // Run it: no extra confirmation, the rule goes straight to the
    // executor.
    h.conversation.handle_command(choice(1)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment
        .contains(&Sent::Text("Alright, I'll notify you when there is something new.".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Null))));

    assert_eq!(
        h.executor.executed_programs(),
        vec!["(@com.xkcd.get_comic()), title =~ \"lol\" => notify;"]
    );
}

#[tokio::test]
async fn back_and_more_paginate_without_emitting_a_program() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.handle_command(special("special:makerule")).await.unwrap();
    h.delegate.take();

    // More on a single page just redisplays it.
    h.conversation.handle_command(special("special:more")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "Media".to_string())));
    assert!(h.executor.executed_programs().is_empty());

    // Back at the top level leaves the builder.
    h.conversation.handle_command(special("special:back")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Okay, forget it.".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Null))));
    assert!(h.executor.executed_programs().is_empty());
}

#[tokio::test]
async fn back_from_skill_level_returns_to_categories() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.handle_command(special("special:makerule")).await.unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.delegate.take();

    h.conversation.handle_command(special("special:back")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Pick one of the following categories.".to_string())));
    assert!(h.executor.executed_programs().is_empty());
}

#[tokio::test]
async fn direct_filter_tokens_attach_at_the_menu() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.handle_command(special("special:makerule")).await.unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.delegate.take();

    // The UI sends the filter in one token stream instead of walking the
    // guided flow.
    h.conversation
        .handle_command(converse::UserInput::parsed(tok(&[
            "bookkeeping",
            "filter",
            "title",
            "=~",
            "\"lol\"",
        ])))
        .await
        .unwrap();
    h.conversation.handle_command(choice(1)).await.unwrap();

    assert_eq!(
        h.executor.executed_programs(),
        vec!["(@com.xkcd.get_comic()), title =~ \"lol\" => notify;"]
    );
}
