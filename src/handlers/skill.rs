use crate::agent::context::SubDialogue;
use crate::agent::error::Result;
use crate::agent::handler::DialogueHandler;
use crate::agent::types::{
    AnalysisKind, CommandAnalysis, ReplyResult, UserInput, UserInputKind, ValueCategory,
};
use async_trait::async_trait;
use std::sync::Arc;

/// What a skill plugin thinks of one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillConfidence {
    OutOfDomain,
    Nonconfident,
    Confident,
    /// Follow-up to this skill's own previous turn. Only honored while the
    /// skill is the current handler.
    NonconfidentFollowup,
    ConfidentFollowup,
}

/// One conversational reply from a skill plugin.
#[derive(Debug, Clone, Default)]
pub struct SkillReply {
    pub messages: Vec<String>,
    /// Set when the skill expects a follow-up turn.
    pub expecting: Option<ValueCategory>,
    pub end: bool,
}

/// The behavior exported by a device of the dialogue-handler kind. Plugins
/// are conversation-stateful; the wrapper forwards reset.
#[async_trait]
pub trait SkillPlugin: Send + Sync {
    fn skill_id(&self) -> &str;

    fn priority(&self) -> i32 {
        0
    }

    fn icon(&self) -> Option<String> {
        None
    }

    async fn analyze(&self, utterance: &str) -> SkillConfidence;

    async fn reply(&self, utterance: &str) -> SkillReply;

    fn reset(&self);
}

/// Adapter from a dynamically-loaded skill plugin to the handler contract.
/// Attached when a dialogue-handler device appears in the device view and
/// detached on removal.
pub struct SkillHandler {
    unique_id: String,
    plugin: Arc<dyn SkillPlugin>,
}

impl SkillHandler {
    pub fn new(device_id: &str, plugin: Arc<dyn SkillPlugin>) -> Self {
        Self { unique_id: device_id.to_string(), plugin }
    }
}

#[async_trait]
impl DialogueHandler for SkillHandler {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn priority(&self) -> i32 {
        self.plugin.priority()
    }

    fn icon(&self) -> Option<String> {
        self.plugin.icon()
    }

    async fn initialize(
        &mut self,
        _prev_state: Option<&serde_json::Value>,
        _show_welcome: bool,
    ) -> Option<ReplyResult> {
        None
    }

    async fn analyze(&mut self, input: &UserInput) -> CommandAnalysis {
        let UserInputKind::Command { utterance } = &input.kind else {
            return CommandAnalysis::out_of_domain(input);
        };
        let kind = match self.plugin.analyze(utterance).await {
            SkillConfidence::OutOfDomain => AnalysisKind::OutOfDomainCommand,
            SkillConfidence::Nonconfident => AnalysisKind::NonconfidentInDomainCommand,
            SkillConfidence::Confident => AnalysisKind::ConfidentInDomainCommand,
            SkillConfidence::NonconfidentFollowup => AnalysisKind::NonconfidentInDomainFollowup,
            SkillConfidence::ConfidentFollowup => AnalysisKind::ConfidentInDomainFollowup,
        };
        CommandAnalysis {
            kind,
            utterance: utterance.clone(),
            user_target: format!("skill:{}", self.plugin.skill_id()),
        }
    }

    async fn get_reply(
        &mut self,
        analysis: CommandAnalysis,
        _dlg: &mut SubDialogue<'_>,
    ) -> Result<ReplyResult> {
        let reply = self.plugin.reply(&analysis.utterance).await;
        let mut result = ReplyResult::empty();
        for text in reply.messages {
            result.messages.push(crate::agent::types::ReplyMessage::Text { text });
        }
        result.expecting = reply.expecting;
        result.end = reply.end;
        result.agent_target = format!("skill:{}", self.plugin.skill_id());
        Ok(result)
    }

    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn reset(&mut self) {
        self.plugin.reset();
    }
}
