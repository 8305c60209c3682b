use anyhow::Result;
use async_trait::async_trait;
use converse::agent::delegate::Delegate;
use converse::agent::types::{AskSpecialKind, Rdl, UserInput};
use converse::program::ast::{ParamType, PermissionRule, Program};
use converse::program::executor::{ExecOutput, Executor};
use converse::services::catalog::{
    ArgSchema, CategoryInfo, DeviceInfo, ExampleCommand, FunctionSchema, FunctionType,
    MemoryCatalog,
};
use converse::services::nlu::HttpNluClient;
use converse::services::prefs::FilePreferences;
use converse::{AgentConfig, ConversationBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Minimal console shell: each reply message becomes one stdout line.
struct ConsoleDelegate;

#[async_trait]
impl Delegate for ConsoleDelegate {
    async fn send(&self, text: &str, _icon: Option<&str>) {
        println!(">> {}", text);
    }

    async fn send_picture(&self, url: &str, _icon: Option<&str>) {
        println!(">> picture: {}", url);
    }

    async fn send_rdl(&self, rdl: &Rdl, _icon: Option<&str>) {
        println!(">> rdl: {} ({})", rdl.display_title, rdl.web_callback);
    }

    async fn send_choice(&self, index: usize, title: &str) {
        println!(">> choice {}: {}", index, title);
    }

    async fn send_link(&self, title: &str, url: &str) {
        println!(">> link: {} ({})", title, url);
    }

    async fn send_button(&self, title: &str, json: &serde_json::Value) {
        println!(">> button: {} {}", title, json);
    }

    async fn send_ask_special(&self, kind: AskSpecialKind) {
        println!(">> ask special: {:?}", kind);
    }
}

/// Stand-in executor for the console shell: logs the program instead of
/// running it.
struct LogExecutor;

#[async_trait]
impl Executor for LogExecutor {
    async fn execute(&self, unique_id: &str, program: &Program) -> Result<Vec<ExecOutput>> {
        info!(app = unique_id, program = %program.to_code(), "executing program");
        Ok(Vec::new())
    }

    async fn install_remote(
        &self,
        principal: &str,
        _identity: &str,
        program: &Program,
    ) -> Result<()> {
        info!(principal, program = %program.to_code(), "installing remote program");
        Ok(())
    }

    async fn add_permission(&self, rule: &PermissionRule) -> Result<()> {
        info!(rule = %rule.to_code(), "installing permission rule");
        Ok(())
    }
}

/// A tiny built-in catalog so the shell is usable without a repository
/// server.
fn demo_catalog() -> Arc<MemoryCatalog> {
    let catalog = MemoryCatalog::new();
    catalog.add_schema(FunctionSchema {
        kind: "com.xkcd".to_string(),
        channel: "get_comic".to_string(),
        ftype: FunctionType::Query,
        args: vec![
            ArgSchema {
                name: "title".to_string(),
                ptype: ParamType::String,
                is_input: false,
                required: false,
                question: String::new(),
            },
            ArgSchema {
                name: "picture_url".to_string(),
                ptype: ParamType::Picture,
                is_input: false,
                required: false,
                question: String::new(),
            },
            ArgSchema {
                name: "link".to_string(),
                ptype: ParamType::Url,
                is_input: false,
                required: false,
                question: String::new(),
            },
        ],
        confirmation: "get an Xkcd comic".to_string(),
        canonical: "get xkcd comic".to_string(),
        monitorable: true,
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
        vec![ExampleCommand {
            label: "get an xkcd comic".to_string(),
            code: vec!["now".to_string(), "=>".to_string(), "@com.xkcd.get_comic".to_string()],
        }],
    );
    Arc::new(catalog)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    info!("converse agent booting");

    let prefs = Arc::new(FilePreferences::new(PathBuf::from("converse_prefs.json")));
    let conversation = ConversationBuilder::new(
        Arc::new(ConsoleDelegate),
        Arc::new(HttpNluClient::from_env()),
        demo_catalog(),
        Arc::new(LogExecutor),
        prefs,
    )
    .config(AgentConfig::from_env())
    .start(true, None)
    .await;

    info!("agent ready; \\q quits, \\d dumps state, \\t sends raw tokens");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "\\q" {
            break;
        }
        if line == "\\d" {
            println!("{}", serde_json::to_string_pretty(&conversation.get_state())?);
            continue;
        }
        let input = match line.strip_prefix("\\t ") {
            Some(tokens) => {
                UserInput::parsed(tokens.split_whitespace().map(String::from).collect())
            }
            None => UserInput::command(line),
        };
        if let Err(e) = conversation.handle_command(input).await {
            eprintln!("error: {}", e);
        }
    }

    conversation.stop().await.ok();
    Ok(())
}
