use super::types::{AskSpecialKind, Rdl, ReplyMessage};
use async_trait::async_trait;

/// The outbound sink of the loop, implemented by the outer shell.
///
/// Serialization of each message must be idempotent and side-effect free;
/// the loop awaits every send so the messages of one reply reach the shell
/// in order, before the trailing ask-special frame.
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn send(&self, text: &str, icon: Option<&str>);
    async fn send_picture(&self, url: &str, icon: Option<&str>);
    async fn send_rdl(&self, rdl: &Rdl, icon: Option<&str>);
    async fn send_choice(&self, index: usize, title: &str);
    async fn send_link(&self, title: &str, url: &str);
    async fn send_button(&self, title: &str, json: &serde_json::Value);
    async fn send_ask_special(&self, kind: AskSpecialKind);

    /// Exhaustive render of the reply-message sum. Handlers build
    /// `ReplyMessage`s; only this method turns them into delegate calls.
    async fn send_reply_message(&self, message: &ReplyMessage, icon: Option<&str>) {
        match message {
            ReplyMessage::Text { text } => self.send(text, icon).await,
            ReplyMessage::Picture { url } => self.send_picture(url, icon).await,
            ReplyMessage::Rdl { rdl } => self.send_rdl(rdl, icon).await,
            ReplyMessage::Button { title, json } => self.send_button(title, json).await,
            ReplyMessage::Link { title, url } => self.send_link(title, url).await,
            ReplyMessage::Choice { index, title } => self.send_choice(*index, title).await,
            ReplyMessage::AskSpecial { kind } => self.send_ask_special(*kind).await,
        }
    }
}
