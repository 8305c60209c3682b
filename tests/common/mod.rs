//! Shared fixtures: a collecting delegate, a scripted NLU, a recording
//! executor, and the catalog used by the end-to-end scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use converse::agent::delegate::Delegate;
use converse::agent::types::{AskSpecialKind, PlatformData, Rdl, UserInput, ValueCategory};
use converse::program::ast::{ContactCategory, ParamType, PermissionRule, Program};
use converse::program::executor::{ExecOutput, Executor};
use converse::services::catalog::{
    ArgSchema, CategoryInfo, DeviceInfo, ExampleCommand, FunctionSchema, FunctionType,
    MemoryCatalog,
};
use converse::services::nlu::{NluCandidate, NluClient, NluResult};
use converse::services::prefs::MemoryPreferences;
use converse::{AgentConfig, Conversation, ConversationBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Everything the delegate saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Text(String),
    Picture(String),
    Rdl(String),
    Choice(usize, String),
    Link(String, String),
    Button(String, serde_json::Value),
    AskSpecial(AskSpecialKind),
}

#[derive(Default)]
pub struct CollectingDelegate {
    messages: Mutex<Vec<Sent>>,
}

impl CollectingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<Sent> {
        self.messages.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<Sent> {
        std::mem::take(&mut self.messages.lock().unwrap())
    }

    pub fn texts(&self) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|m| match m {
                Sent::Text(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn contains_text(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }
}

#[async_trait]
impl Delegate for CollectingDelegate {
    async fn send(&self, text: &str, _icon: Option<&str>) {
        self.messages.lock().unwrap().push(Sent::Text(text.to_string()));
    }

    async fn send_picture(&self, url: &str, _icon: Option<&str>) {
        self.messages.lock().unwrap().push(Sent::Picture(url.to_string()));
    }

    async fn send_rdl(&self, rdl: &Rdl, _icon: Option<&str>) {
        self.messages.lock().unwrap().push(Sent::Rdl(rdl.display_title.clone()));
    }

    async fn send_choice(&self, index: usize, title: &str) {
        self.messages.lock().unwrap().push(Sent::Choice(index, title.to_string()));
    }

    async fn send_link(&self, title: &str, url: &str) {
        self.messages.lock().unwrap().push(Sent::Link(title.to_string(), url.to_string()));
    }

    async fn send_button(&self, title: &str, json: &serde_json::Value) {
        self.messages.lock().unwrap().push(Sent::Button(title.to_string(), json.clone()));
    }

    async fn send_ask_special(&self, kind: AskSpecialKind) {
        self.messages.lock().unwrap().push(Sent::AskSpecial(kind));
    }
}

/// NLU stub keyed on the exact utterance. Unknown utterances parse to
/// nothing, which the handler reports as out-of-domain.
#[derive(Default)]
pub struct ScriptedNlu {
    responses: Mutex<HashMap<String, NluResult>>,
    fail: Mutex<bool>,
}

impl ScriptedNlu {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, utterance: &str, code: &[&str], score: f64) {
        self.script_with_entities(utterance, code, score, HashMap::new());
    }

    pub fn script_with_entities(
        &self,
        utterance: &str,
        code: &[&str],
        score: f64,
        entities: HashMap<String, serde_json::Value>,
    ) {
        self.responses.lock().unwrap().insert(
            utterance.to_string(),
            NluResult {
                candidates: vec![NluCandidate {
                    code: code.iter().map(|s| s.to_string()).collect(),
                    score,
                }],
                entities,
            },
        );
    }

    /// Make every parse fail, as if the server were down.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap() = failing;
    }
}

#[async_trait]
impl NluClient for ScriptedNlu {
    async fn parse(
        &self,
        utterance: &str,
        _expecting: Option<ValueCategory>,
    ) -> anyhow::Result<NluResult> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("connect ECONNREFUSED");
        }
        Ok(self.responses.lock().unwrap().get(utterance).cloned().unwrap_or_default())
    }
}

/// Records everything the loop hands to the runtime.
#[derive(Default)]
pub struct MockExecutor {
    pub executed: Mutex<Vec<String>>,
    pub remote_installs: Mutex<Vec<(String, String)>>,
    pub permissions: Mutex<Vec<String>>,
    pub next_outputs: Mutex<Vec<ExecOutput>>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executed_programs(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn set_outputs(&self, outputs: Vec<ExecOutput>) {
        *self.next_outputs.lock().unwrap() = outputs;
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn execute(&self, _unique_id: &str, program: &Program) -> anyhow::Result<Vec<ExecOutput>> {
        self.executed.lock().unwrap().push(program.to_code());
        Ok(std::mem::take(&mut self.next_outputs.lock().unwrap()))
    }

    async fn install_remote(
        &self,
        principal: &str,
        _identity: &str,
        program: &Program,
    ) -> anyhow::Result<()> {
        self.remote_installs.lock().unwrap().push((principal.to_string(), program.to_code()));
        Ok(())
    }

    async fn add_permission(&self, rule: &PermissionRule) -> anyhow::Result<()> {
        self.permissions.lock().unwrap().push(rule.to_code());
        Ok(())
    }
}

fn out_arg(name: &str, ptype: ParamType) -> ArgSchema {
    ArgSchema {
        name: name.to_string(),
        ptype,
        is_input: false,
        required: false,
        question: String::new(),
    }
}

fn in_arg(name: &str, ptype: ParamType, question: &str) -> ArgSchema {
    ArgSchema {
        name: name.to_string(),
        ptype,
        is_input: true,
        required: true,
        question: question.to_string(),
    }
}

/// The catalog behind the end-to-end scenarios: xkcd (query), two Twitter
/// accounts (actions), and a data sink for permission tests.
pub fn test_catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new();

    catalog.add_schema(FunctionSchema {
        kind: "com.xkcd".to_string(),
        channel: "get_comic".to_string(),
        ftype: FunctionType::Query,
        args: vec![
            out_arg("title", ParamType::String),
            out_arg("picture_url", ParamType::Picture),
            out_arg("link", ParamType::Url),
        ],
        confirmation: "get an Xkcd comic".to_string(),
        canonical: "get xkcd comic".to_string(),
        monitorable: true,
    });
    catalog.add_schema(FunctionSchema {
        kind: "com.twitter".to_string(),
        channel: "post".to_string(),
        ftype: FunctionType::Action,
        args: vec![in_arg("status", ParamType::String, "What do you want to tweet?")],
        confirmation: "tweet ${status}".to_string(),
        canonical: "post on twitter".to_string(),
        monitorable: false,
    });
    catalog.add_schema(FunctionSchema {
        kind: "com.twitter".to_string(),
        channel: "post_picture".to_string(),
        ftype: FunctionType::Action,
        args: vec![
            in_arg("picture_url", ParamType::Picture, "What picture do you want to tweet?"),
            in_arg("caption", ParamType::String, "What caption do you want?"),
        ],
        confirmation: "tweet a picture".to_string(),
        canonical: "post picture on twitter".to_string(),
        monitorable: false,
    });
    catalog.add_schema(FunctionSchema {
        kind: "com.bing".to_string(),
        channel: "eat_data".to_string(),
        ftype: FunctionType::Action,
        args: vec![out_arg("data", ParamType::String)],
        confirmation: "consume data".to_string(),
        canonical: "eat data".to_string(),
        monitorable: false,
    });

    catalog.add_device(DeviceInfo {
        id: "twitter-foo".to_string(),
        kind: "com.twitter".to_string(),
        name: "Twitter Account foo".to_string(),
    });
    catalog.add_device(DeviceInfo {
        id: "twitter-bar".to_string(),
        kind: "com.twitter".to_string(),
        name: "Twitter Account bar".to_string(),
    });

    catalog.add_category(
        CategoryInfo { id: "media".to_string(), name: "Media".to_string() },
        vec![DeviceInfo {
            id: "com.xkcd".to_string(),
            kind: "com.xkcd".to_string(),
            name: "XKCD".to_string(),
        }],
    );
    catalog.add_examples(
        "com.xkcd",
        vec![
            ExampleCommand {
                label: "notify me when there is a new xkcd".to_string(),
                code: tok(&["monitor", "@com.xkcd.get_comic"]),
            },
            ExampleCommand {
                label: "get an xkcd comic".to_string(),
                code: tok(&["now", "=>", "@com.xkcd.get_comic"]),
            },
        ],
    );

    Arc::new(catalog)
}

pub struct Harness {
    pub conversation: Arc<Conversation>,
    pub delegate: Arc<CollectingDelegate>,
    pub executor: Arc<MockExecutor>,
    pub prefs: Arc<MemoryPreferences>,
    pub nlu: Arc<ScriptedNlu>,
    pub catalog: Arc<MemoryCatalog>,
}

pub async fn start_conversation(catalog: Arc<MemoryCatalog>) -> Harness {
    start_conversation_with(catalog, true, None, Vec::new()).await
}

pub async fn start_conversation_with(
    catalog: Arc<MemoryCatalog>,
    show_welcome: bool,
    initial_state: Option<serde_json::Value>,
    extra_handlers: Vec<Box<dyn converse::agent::handler::DialogueHandler>>,
) -> Harness {
    let delegate = Arc::new(CollectingDelegate::new());
    let executor = Arc::new(MockExecutor::new());
    let prefs = Arc::new(MemoryPreferences::new());
    let nlu = Arc::new(ScriptedNlu::new());

    let mut builder = ConversationBuilder::new(
        delegate.clone(),
        nlu.clone(),
        catalog.clone(),
        executor.clone(),
        prefs.clone(),
    )
    .config(AgentConfig::default());
    for handler in extra_handlers {
        builder = builder.add_handler(handler);
    }
    let conversation = Arc::new(builder.start(show_welcome, initial_state).await);

    Harness { conversation, delegate, executor, prefs, nlu, catalog }
}

/// Poll until the delegate has seen `needle`. Out-of-band items reach the
/// loop without a handshake, so tests wait for their output explicitly.
pub async fn wait_for_text(delegate: &CollectingDelegate, needle: &str) {
    for _ in 0..400 {
        if delegate.contains_text(needle) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for text {:?}; saw {:?}", needle, delegate.texts());
}

pub fn tok(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

pub fn special(name: &str) -> UserInput {
    UserInput::parsed(tok(&["bookkeeping", "special", name]))
}

pub fn choice(index: usize) -> UserInput {
    UserInput::parsed(tok(&["bookkeeping", "choice", &index.to_string()]))
}

pub fn answer(token: &str) -> UserInput {
    UserInput::parsed(tok(&["bookkeeping", "answer", token]))
}

/// Platform data with one messaging contact, for remote-program tests.
pub fn alice_platform_data() -> PlatformData {
    PlatformData {
        contacts: vec![converse::agent::types::ContactEntry {
            value: "mock-account:MOCK123".to_string(),
            principal: "mock-account:MOCK123".to_string(),
            display: "Alice".to_string(),
            category: ContactCategory::Account,
        }],
        locale: Some("en-US".to_string()),
        speaker_id: None,
    }
}
