//! End-to-end slot filling and disambiguation, driven through the public
//! conversation handle with literal token I/O.

mod common;

use common::*;
use converse::agent::types::{AskSpecialKind, UserInput};

/// Every reply segment ends with exactly one ask-special frame.
fn assert_one_trailing_ask_special(segment: &[Sent]) {
    let ask_specials =
        segment.iter().filter(|m| matches!(m, Sent::AskSpecial(_))).count();
    assert_eq!(ask_specials, 1, "expected exactly one ask special in {:?}", segment);
    assert!(
        matches!(segment.last(), Some(Sent::AskSpecial(_))),
        "ask special must be the final message: {:?}",
        segment
    );
}

#[tokio::test]
async fn multi_device_disambiguation_fills_program() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    // Two-step program: xkcd comic into a tweeted picture.
    h.conversation
        .handle_command(UserInput::parsed(tok(&[
            "now",
            "=>",
            "@com.xkcd.get_comic",
            "=>",
            "@com.twitter.post_picture",
        ])))
        .await
        .unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "Twitter Account foo".to_string())));
    assert!(segment.contains(&Sent::Choice(1, "Twitter Account bar".to_string())));
    assert_one_trailing_ask_special(&segment);
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Choice))));

    // Device: twitter-foo.
    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "Use the picture url".to_string())));
    assert!(segment.contains(&Sent::Choice(1, "Use the link".to_string())));
    assert!(segment.contains(&Sent::Choice(2, "None of above".to_string())));
    assert_one_trailing_ask_special(&segment);

    // picture_url = picture_url.
    h.conversation.handle_command(choice(0)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Choice(0, "Use the title".to_string())));
    assert!(segment.contains(&Sent::Choice(2, "Use the link".to_string())));
    assert_one_trailing_ask_special(&segment);

    // caption = link, then confirm.
    h.conversation.handle_command(choice(2)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.iter().any(|m| matches!(
        m,
        Sent::Text(t) if t.contains("get an Xkcd comic and then tweet a picture")
    )));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::YesNo))));

    h.conversation.handle_command(special("special:yes")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Consider it done.".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Null))));

    assert_eq!(
        h.executor.executed_programs(),
        vec![
            "now => @com.xkcd.get_comic() => @com.twitter(id=\"twitter-foo\")\
             .post_picture(picture_url=picture_url, caption=link);"
        ]
    );
}

#[tokio::test]
async fn slot_filling_asks_for_missing_status() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    // Device choice first.
    h.conversation.handle_command(choice(1)).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("What do you want to tweet?".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::RawString))));

    h.conversation.handle_command(answer("\"lol\"")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment
        .iter()
        .any(|m| matches!(m, Sent::Text(t) if t.contains("tweet lol. Is that right?"))));

    h.conversation.handle_command(special("special:yes")).await.unwrap();
    assert_eq!(
        h.executor.executed_programs(),
        vec!["now => @com.twitter(id=\"twitter-bar\").post(status=\"lol\");"]
    );
}

#[tokio::test]
async fn confirmation_prose_matches_submitted_program() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"hello world\"")).await.unwrap();

    // The prose carries the literal status that ends up in the program.
    assert!(h.delegate.contains_text("tweet hello world"));
    h.conversation.handle_command(special("special:yes")).await.unwrap();
    assert!(h.executor.executed_programs()[0].contains("status=\"hello world\""));
}

#[tokio::test]
async fn rejected_confirmation_runs_nothing() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"nope\"")).await.unwrap();
    h.conversation.handle_command(special("special:no")).await.unwrap();

    assert!(h.delegate.contains_text("Okay, I won't do that."));
    assert!(h.executor.executed_programs().is_empty());
}

#[tokio::test]
async fn unrecognized_yes_no_answer_reprompts_with_yes_what() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"x\"")).await.unwrap();
    h.delegate.take();

    // Garbage while expecting yes/no.
    h.conversation.handle_command(UserInput::command("banana")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment.contains(&Sent::Text("Yes what?".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::YesNo))));

    // Still expecting yes/no; answering completes the turn.
    h.conversation.handle_command(special("special:yes")).await.unwrap();
    assert_eq!(h.executor.executed_programs().len(), 1);
}

#[tokio::test]
async fn unparsed_utterance_is_not_understood() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.handle_command(UserInput::command("flibbertigibbet")).await.unwrap();
    let segment = h.delegate.take();
    assert!(segment
        .contains(&Sent::Text("Sorry, I did not understand that. Can you rephrase it?".to_string())));
    assert!(matches!(segment.last(), Some(Sent::AskSpecial(AskSpecialKind::Null))));
}

#[tokio::test]
async fn nlu_backed_utterance_runs_like_tokens() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();
    h.nlu.script("tweet something", &["now", "=>", "@com.twitter.post"], 1.0);

    h.conversation.handle_command(UserInput::command("tweet something")).await.unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"from nlu\"")).await.unwrap();
    h.conversation.handle_command(special("special:yes")).await.unwrap();

    assert_eq!(
        h.executor.executed_programs(),
        vec!["now => @com.twitter(id=\"twitter-foo\").post(status=\"from nlu\");"]
    );
}

#[tokio::test]
async fn first_start_welcomes_then_greets_shorter() {
    let h = start_conversation(test_catalog()).await;
    assert!(h.delegate.contains_text("Hello! I'm your assistant"));

    // Same preference store, fresh session: the long welcome is not
    // repeated.
    let delegate2 = std::sync::Arc::new(CollectingDelegate::new());
    let conversation2 = converse::ConversationBuilder::new(
        delegate2.clone(),
        h.nlu.clone(),
        h.catalog.clone(),
        h.executor.clone(),
        h.prefs.clone(),
    )
    .start(true, None)
    .await;
    assert!(delegate2.contains_text("Welcome back!"));
    assert!(!delegate2.contains_text("Hello! I'm your assistant"));
    conversation2.stop().await.unwrap();
    h.conversation.stop().await.unwrap();
}
