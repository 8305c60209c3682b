use super::context::SubDialogue;
use super::error::Result;
use super::types::{CommandAnalysis, ReplyResult, UserInput};
use async_trait::async_trait;

/// The uniform contract every dialogue handler implements.
///
/// `analyze` is pure classification: cheap, no emission, no state mutation
/// beyond caching. `get_reply` is the side-effectful routine; it may start
/// sub-dialogues through the `SubDialogue` capabilities object and therefore
/// suspend on the user-input queue. Handlers are stateful across turns and
/// reset only on session cancellation.
#[async_trait]
pub trait DialogueHandler: Send {
    /// Unique within the session. The registry keys dynamic handlers by it.
    fn unique_id(&self) -> &str;

    /// Higher wins confidence ties in the arbiter.
    fn priority(&self) -> i32;

    fn icon(&self) -> Option<String> {
        None
    }

    /// Produce an optional welcome. `prev_state` is the snapshot a previous
    /// session saved through `state()`.
    async fn initialize(
        &mut self,
        prev_state: Option<&serde_json::Value>,
        show_welcome: bool,
    ) -> Option<ReplyResult>;

    async fn analyze(&mut self, input: &UserInput) -> CommandAnalysis;

    async fn get_reply(
        &mut self,
        analysis: CommandAnalysis,
        dlg: &mut SubDialogue<'_>,
    ) -> Result<ReplyResult>;

    fn state(&self) -> serde_json::Value;

    fn reset(&mut self);
}

/// Ordered handler registry. Static handlers are registered first and keep
/// their position; dynamic skill handlers append and detach by id. Iteration
/// order doubles as the first-reporter tie-break in the arbiter.
#[derive(Default)]
pub struct HandlerSet {
    handlers: Vec<Box<dyn DialogueHandler>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handler: Box<dyn DialogueHandler>) {
        debug_assert!(
            self.index_of(handler.unique_id()).is_none(),
            "duplicate handler id {}",
            handler.unique_id()
        );
        self.handlers.push(handler);
    }

    pub fn remove(&mut self, unique_id: &str) -> Option<Box<dyn DialogueHandler>> {
        let idx = self.index_of(unique_id)?;
        Some(self.handlers.remove(idx))
    }

    pub fn index_of(&self, unique_id: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.unique_id() == unique_id)
    }

    pub fn get_mut(&mut self, idx: usize) -> Option<&mut Box<dyn DialogueHandler>> {
        self.handlers.get_mut(idx)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn DialogueHandler>> {
        self.handlers.iter_mut()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn DialogueHandler>> {
        self.handlers.iter()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
