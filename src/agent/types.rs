use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller-supplied context attached to every user input: contacts known to
/// the platform, the speaker's locale, and an optional speaker identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformData {
    pub contacts: Vec<ContactEntry>,
    pub locale: Option<String>,
    pub speaker_id: Option<String>,
}

/// One address-book entry shared by the shell for principal resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactEntry {
    pub value: String,
    pub principal: String,
    pub display: String,
    pub category: crate::program::ast::ContactCategory,
}

/// A single user turn, as delivered by the shell.
///
/// `Command` is a free-form utterance that must go through NLU. `Parsed` is a
/// pre-tokenized sequence from the UI (button clicks, choices) with its
/// entity table. `Program` skips parsing entirely.
#[derive(Debug, Clone, PartialEq)]
pub enum UserInputKind {
    Command { utterance: String },
    Parsed { code: Vec<String>, entities: HashMap<String, serde_json::Value> },
    Program { program: crate::program::ast::Program },
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserInput {
    pub kind: UserInputKind,
    pub platform_data: PlatformData,
}

impl UserInput {
    pub fn command(utterance: impl Into<String>) -> Self {
        Self {
            kind: UserInputKind::Command { utterance: utterance.into() },
            platform_data: PlatformData::default(),
        }
    }

    pub fn parsed(code: Vec<String>) -> Self {
        Self {
            kind: UserInputKind::Parsed { code, entities: HashMap::new() },
            platform_data: PlatformData::default(),
        }
    }

    pub fn parsed_with_entities(
        code: Vec<String>,
        entities: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self { kind: UserInputKind::Parsed { code, entities }, platform_data: PlatformData::default() }
    }

    pub fn program(program: crate::program::ast::Program) -> Self {
        Self { kind: UserInputKind::Program { program }, platform_data: PlatformData::default() }
    }

    pub fn with_platform_data(mut self, data: PlatformData) -> Self {
        self.platform_data = data;
        self
    }

    /// The raw utterance, when there is one. Used for transcripts and FAQ
    /// matching; parsed inputs yield their joined token form.
    pub fn utterance(&self) -> String {
        match &self.kind {
            UserInputKind::Command { utterance } => utterance.clone(),
            UserInputKind::Parsed { code, .. } => code.join(" "),
            UserInputKind::Program { program } => program.to_code(),
        }
    }
}

/// The closed set of answer shapes a sub-dialogue may constrain the next
/// input to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueCategory {
    YesNo,
    Choice,
    Command,
    Number,
    Location,
    Time,
    Date,
    RawString,
    Password,
    PhoneNumber,
    EmailAddress,
    Contact,
    Generic,
}

impl ValueCategory {
    /// Categories whose answers are taken verbatim, bypassing NLU.
    pub fn is_raw(self) -> bool {
        matches!(self, ValueCategory::RawString | ValueCategory::Password)
    }

    pub fn ask_special(self) -> AskSpecialKind {
        match self {
            ValueCategory::YesNo => AskSpecialKind::YesNo,
            ValueCategory::Choice => AskSpecialKind::Choice,
            ValueCategory::Command => AskSpecialKind::Command,
            ValueCategory::Number => AskSpecialKind::Number,
            ValueCategory::Location => AskSpecialKind::Location,
            ValueCategory::Time => AskSpecialKind::Time,
            ValueCategory::Date => AskSpecialKind::Date,
            ValueCategory::RawString => AskSpecialKind::RawString,
            ValueCategory::Password => AskSpecialKind::Password,
            ValueCategory::PhoneNumber => AskSpecialKind::PhoneNumber,
            ValueCategory::EmailAddress => AskSpecialKind::EmailAddress,
            ValueCategory::Contact => AskSpecialKind::Contact,
            ValueCategory::Generic => AskSpecialKind::Generic,
        }
    }
}

/// The trailing marker of every agent reply: tells the UI what input shape
/// comes next. `Null` means "nothing expected, back to the default state".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskSpecialKind {
    YesNo,
    Choice,
    Command,
    Generic,
    RawString,
    Password,
    Number,
    Location,
    Time,
    Date,
    PhoneNumber,
    EmailAddress,
    Contact,
    Null,
}

/// One outgoing message. The delegate renders these exhaustively; there is no
/// runtime type probing anywhere downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyMessage {
    Text { text: String },
    Picture { url: String },
    Rdl { rdl: Rdl },
    Button { title: String, json: serde_json::Value },
    Link { title: String, url: String },
    Choice { index: usize, title: String },
    AskSpecial { kind: AskSpecialKind },
}

/// Rich Deep Link payload: a card with a title, optional body text and a
/// web callback the UI opens on tap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rdl {
    pub display_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_text: Option<String>,
    pub web_callback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
}

/// Classification of one user turn by one handler. `kind` carries the
/// confidence tier; `user_target` is the handler-internal target recorded in
/// conversation transcripts.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAnalysis {
    pub kind: AnalysisKind,
    pub utterance: String,
    pub user_target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisKind {
    Stop,
    Debug,
    ConfidentInDomainCommand,
    NonconfidentInDomainCommand,
    ConfidentInDomainFollowup,
    NonconfidentInDomainFollowup,
    OutOfDomainCommand,
}

impl AnalysisKind {
    /// Confidence tier for arbitration. CONFIDENT command and followup share
    /// a tier, as do the NONCONFIDENT pair; out-of-domain is the floor.
    pub fn tier(self) -> u8 {
        match self {
            AnalysisKind::Stop | AnalysisKind::Debug => 3,
            AnalysisKind::ConfidentInDomainCommand
            | AnalysisKind::ConfidentInDomainFollowup => 2,
            AnalysisKind::NonconfidentInDomainCommand
            | AnalysisKind::NonconfidentInDomainFollowup => 1,
            AnalysisKind::OutOfDomainCommand => 0,
        }
    }

    pub fn is_followup(self) -> bool {
        matches!(
            self,
            AnalysisKind::ConfidentInDomainFollowup | AnalysisKind::NonconfidentInDomainFollowup
        )
    }
}

impl CommandAnalysis {
    pub fn out_of_domain(input: &UserInput) -> Self {
        Self {
            kind: AnalysisKind::OutOfDomainCommand,
            utterance: input.utterance(),
            user_target: String::new(),
        }
    }
}

/// Everything a handler hands back for one turn. The loop emits `messages`
/// in order, then exactly one ask-special derived from `expecting`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyResult {
    pub messages: Vec<ReplyMessage>,
    pub expecting: Option<ValueCategory>,
    pub end: bool,
    /// Agent-side context string, recorded in transcripts only.
    pub context: String,
    /// Agent-side target, recorded in transcripts only.
    pub agent_target: String,
}

impl ReplyResult {
    pub fn empty() -> Self {
        Self {
            messages: Vec::new(),
            expecting: None,
            end: false,
            context: String::new(),
            agent_target: String::new(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut r = Self::empty();
        r.messages.push(ReplyMessage::Text { text: text.into() });
        r
    }

    pub fn with_expecting(mut self, expecting: ValueCategory) -> Self {
        self.expecting = Some(expecting);
        self
    }

    pub fn ended(mut self) -> Self {
        self.end = true;
        self
    }
}

/// One entry popped by the outer loop. User input envelopes and out-of-band
/// program events share the notify queue so they serialize against each
/// other.
#[derive(Debug)]
pub enum QueueItem {
    UserInput { command: UserInput },
    Notification {
        app_id: String,
        app_name: String,
        output_type: Option<String>,
        output_value: serde_json::Value,
    },
    Error { app_id: String, app_name: String, error: String },
    /// Consent request from another principal. The response channel
    /// receives the granted program, or `None` on refusal; delivery is
    /// best-effort (a dropped receiver is not an error).
    PermissionRequest {
        principal: String,
        identity: String,
        program: crate::program::ast::Program,
        response: tokio::sync::oneshot::Sender<Option<crate::program::ast::Program>>,
    },
}
