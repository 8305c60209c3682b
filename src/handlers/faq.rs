use crate::agent::context::SubDialogue;
use crate::agent::error::Result;
use crate::agent::handler::DialogueHandler;
use crate::agent::types::{
    AnalysisKind, CommandAnalysis, ReplyResult, UserInput, UserInputKind,
};
use async_trait::async_trait;

/// One canned question/answer pair. `keywords` must all appear in the
/// utterance for a confident match; any one of them makes a nonconfident
/// match.
#[derive(Debug, Clone, PartialEq)]
pub struct FaqEntry {
    pub keywords: Vec<String>,
    pub answer: String,
}

/// Text-in/text-out handler over a fixed FAQ list, keyed by skill id.
/// Purely stateless: `analyze` records the matched entry, `get_reply` emits
/// its answer.
pub struct FaqHandler {
    unique_id: String,
    priority: i32,
    entries: Vec<FaqEntry>,
    matched: Option<usize>,
}

impl FaqHandler {
    pub fn new(skill_id: impl Into<String>, entries: Vec<FaqEntry>) -> Self {
        Self { unique_id: format!("faq-{}", skill_id.into()), priority: 0, entries, matched: None }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn match_utterance(&self, utterance: &str) -> Option<(usize, bool)> {
        let utterance = utterance.to_lowercase();
        let mut partial: Option<usize> = None;
        for (idx, entry) in self.entries.iter().enumerate() {
            let hits =
                entry.keywords.iter().filter(|k| utterance.contains(&k.to_lowercase())).count();
            if hits == entry.keywords.len() && hits > 0 {
                return Some((idx, true));
            }
            if hits > 0 && partial.is_none() {
                partial = Some(idx);
            }
        }
        partial.map(|idx| (idx, false))
    }
}

#[async_trait]
impl DialogueHandler for FaqHandler {
    fn unique_id(&self) -> &str {
        &self.unique_id
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn initialize(
        &mut self,
        _prev_state: Option<&serde_json::Value>,
        _show_welcome: bool,
    ) -> Option<ReplyResult> {
        None
    }

    async fn analyze(&mut self, input: &UserInput) -> CommandAnalysis {
        self.matched = None;
        let UserInputKind::Command { utterance } = &input.kind else {
            return CommandAnalysis::out_of_domain(input);
        };
        match self.match_utterance(utterance) {
            Some((idx, confident)) => {
                self.matched = Some(idx);
                CommandAnalysis {
                    kind: if confident {
                        AnalysisKind::ConfidentInDomainCommand
                    } else {
                        AnalysisKind::NonconfidentInDomainCommand
                    },
                    utterance: utterance.clone(),
                    user_target: format!("faq:{}", idx),
                }
            }
            None => CommandAnalysis::out_of_domain(input),
        }
    }

    async fn get_reply(
        &mut self,
        _analysis: CommandAnalysis,
        _dlg: &mut SubDialogue<'_>,
    ) -> Result<ReplyResult> {
        let answer = self
            .matched
            .take()
            .and_then(|idx| self.entries.get(idx))
            .map(|e| e.answer.clone())
            .unwrap_or_else(|| "Sorry, I did not understand that.".to_string());
        Ok(ReplyResult::text(answer))
    }

    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn reset(&mut self) {
        self.matched = None;
    }
}
