//! Out-of-band notification rendering and its ordering against in-progress
//! sub-dialogues.

mod common;

use common::*;
use converse::agent::types::{AskSpecialKind, UserInput};
use converse::format::FormatRule;
use converse::program::executor::ExecOutput;
use serde_json::json;

fn xkcd_format_spec() -> Vec<FormatRule> {
    vec![
        FormatRule::Rdl {
            display_title: "${title}".to_string(),
            display_text: None,
            web_callback: "${link}".to_string(),
        },
        FormatRule::Picture { url: "${picture_url}".to_string() },
        FormatRule::Text { text: "${title}".to_string() },
    ]
}

fn comic_value() -> serde_json::Value {
    json!({
        "title": "Garden",
        "picture_url": "https://imgs.xkcd.com/comics/garden.png",
        "link": "https://xkcd.com/2128",
    })
}

#[tokio::test]
async fn notification_renders_rdl_picture_text_then_ask_null() {
    let catalog = test_catalog();
    catalog.add_format_spec("com.xkcd:get_comic", xkcd_format_spec());
    let h = start_conversation(catalog).await;
    h.delegate.take();

    h.conversation.dispatch_notify("app-1", "Xkcd", Some("com.xkcd:get_comic".to_string()), comic_value());
    wait_for_text(&h.delegate, "Garden").await;

    let messages = h.delegate.all();
    let rdl = messages.iter().position(|m| matches!(m, Sent::Rdl(t) if t == "Garden")).unwrap();
    let picture = messages
        .iter()
        .position(|m| matches!(m, Sent::Picture(u) if u.contains("garden.png")))
        .unwrap();
    let text =
        messages.iter().position(|m| matches!(m, Sent::Text(t) if t == "Garden")).unwrap();
    let ask = messages
        .iter()
        .position(|m| matches!(m, Sent::AskSpecial(AskSpecialKind::Null)))
        .unwrap();
    assert!(rdl < picture && picture < text && text < ask);
}

#[tokio::test]
async fn notification_without_spec_falls_back_to_text() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.dispatch_notify("app-1", "Xkcd", None, json!({"x": 1}));
    wait_for_text(&h.delegate, "Notification from Xkcd").await;
}

#[tokio::test]
async fn notify_error_renders_apology() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();

    h.conversation.dispatch_notify_error("app-1", "Xkcd", "token expired");
    wait_for_text(&h.delegate, "Sorry, that did not work: token expired.").await;
}

#[tokio::test]
async fn notifications_never_interleave_with_a_sub_dialogue() {
    let catalog = test_catalog();
    catalog.add_format_spec("com.xkcd:get_comic", xkcd_format_spec());
    let h = start_conversation(catalog).await;
    h.delegate.take();

    // Open a sub-dialogue: the loop is now parked on the user-input queue.
    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();

    // A notification arrives mid-dialogue; it must wait.
    h.conversation.dispatch_notify("app-1", "Xkcd", Some("com.xkcd:get_comic".to_string()), comic_value());

    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"busy\"")).await.unwrap();
    assert!(
        !h.delegate.contains_text("Garden"),
        "notification leaked into the sub-dialogue"
    );

    h.conversation.handle_command(special("special:yes")).await.unwrap();
    wait_for_text(&h.delegate, "Garden").await;

    let messages = h.delegate.all();
    let done =
        messages.iter().position(|m| matches!(m, Sent::Text(t) if t == "Consider it done.")).unwrap();
    let comic = messages.iter().position(|m| matches!(m, Sent::Text(t) if t == "Garden")).unwrap();
    assert!(done < comic, "notification rendered before the turn finished");
}

#[tokio::test]
async fn executor_error_results_apologize_per_result() {
    let h = start_conversation(test_catalog()).await;
    h.delegate.take();
    h.executor.set_outputs(vec![
        ExecOutput::Error { message: "rate limited".to_string() },
    ]);

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    h.conversation.handle_command(choice(0)).await.unwrap();
    h.conversation.handle_command(answer("\"oops\"")).await.unwrap();
    h.conversation.handle_command(special("special:yes")).await.unwrap();

    assert!(h.delegate.contains_text("Sorry, that did not work: rate limited."));

    // The session survived: a follow-up command still works.
    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.twitter.post"])))
        .await
        .unwrap();
    assert!(h.delegate.contains_text("You have multiple twitter devices"));
}

#[tokio::test]
async fn executor_results_render_with_the_format_spec() {
    let catalog = test_catalog();
    catalog.add_format_spec("com.xkcd:get_comic", xkcd_format_spec());
    let h = start_conversation(catalog).await;
    h.delegate.take();
    h.executor.set_outputs(vec![ExecOutput::Result {
        output_type: "com.xkcd:get_comic".to_string(),
        output_value: comic_value(),
    }]);

    h.conversation
        .handle_command(UserInput::parsed(tok(&["now", "=>", "@com.xkcd.get_comic"])))
        .await
        .unwrap();
    h.conversation.handle_command(special("special:yes")).await.unwrap();

    let messages = h.delegate.all();
    assert!(messages.iter().any(|m| matches!(m, Sent::Rdl(t) if t == "Garden")));
    assert!(messages.iter().any(|m| matches!(m, Sent::Text(t) if t == "Garden")));
}
