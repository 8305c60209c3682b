use super::ast::{Action, Program, Trigger, Value};
use super::executor::{ExecOutput, Executor};
use super::parse::{parse_command, ControlCommand, SpecialCommand};
use super::remote::{lower_return, returning_source};
use super::rule_builder::build_rule;
use super::slots::{prepare_program, Prepared};
use crate::agent::context::SubDialogue;
use crate::agent::delegate::Delegate;
use crate::agent::error::{AgentError, Result};
use crate::agent::handler::DialogueHandler;
use crate::agent::types::{
    AnalysisKind, CommandAnalysis, QueueItem, ReplyResult, UserInput, UserInputKind,
};
use crate::format::{interpolate, Formatter};
use crate::program::ast::ContactCategory;
use crate::services::catalog::SkillCatalog;
use crate::services::nlu::NluClient;
use crate::services::prefs::{keys, PreferenceStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const PROGRAM_HANDLER_ID: &str = "program";

/// The formal-program handler: parses user intent into a typed program,
/// fills its slots, confirms, executes, and formats the results. Owns the
/// rule builder, the permission flow, and remote-program composition.
///
/// `analyze` stashes the parsed payload; `get_reply` consumes it. The
/// handler keeps no other cross-turn state: its multi-turn flows run to
/// completion inside a single `get_reply` by suspending on the user-input
/// queue.
pub struct ProgramHandler {
    nlu: Arc<dyn NluClient>,
    catalog: Arc<dyn SkillCatalog>,
    executor: Arc<dyn Executor>,
    prefs: Arc<dyn PreferenceStore>,
    own_identity: String,
    pending: Option<Pending>,
}

#[derive(Debug)]
enum Pending {
    Control(ControlCommand),
    Program(Program),
    ParseError,
    ServiceFailure(String),
}

impl ProgramHandler {
    pub fn new(
        nlu: Arc<dyn NluClient>,
        catalog: Arc<dyn SkillCatalog>,
        executor: Arc<dyn Executor>,
        prefs: Arc<dyn PreferenceStore>,
        own_identity: String,
    ) -> Self {
        Self { nlu, catalog, executor, prefs, own_identity, pending: None }
    }

    fn stash(&mut self, pending: Pending, kind: AnalysisKind, input: &UserInput) -> CommandAnalysis {
        let user_target = match &pending {
            Pending::Program(p) => p.to_code(),
            Pending::Control(c) => format!("{:?}", c),
            Pending::ParseError => "$failed".to_string(),
            Pending::ServiceFailure(_) => "$failed".to_string(),
        };
        self.pending = Some(pending);
        CommandAnalysis { kind, utterance: input.utterance(), user_target }
    }

    async fn analyze_utterance(&mut self, input: &UserInput, utterance: &str) -> CommandAnalysis {
        match utterance.trim().to_lowercase().as_str() {
            "stop" => {
                return CommandAnalysis {
                    kind: AnalysisKind::Stop,
                    utterance: utterance.to_string(),
                    user_target: "$stop".to_string(),
                }
            }
            "debug" => {
                return CommandAnalysis {
                    kind: AnalysisKind::Debug,
                    utterance: utterance.to_string(),
                    user_target: "$debug".to_string(),
                }
            }
            _ => {}
        }

        let parsed = match self.nlu.parse(utterance, None).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("NLU parse failed: {}", e);
                return self.stash(
                    Pending::ServiceFailure(e.to_string()),
                    AnalysisKind::NonconfidentInDomainCommand,
                    input,
                );
            }
        };

        for candidate in &parsed.candidates {
            match parse_command(&candidate.code, &parsed.entities) {
                Ok(ControlCommand::Special(SpecialCommand::Stop)) => {
                    return CommandAnalysis {
                        kind: AnalysisKind::Stop,
                        utterance: utterance.to_string(),
                        user_target: "$stop".to_string(),
                    }
                }
                Ok(ControlCommand::Special(SpecialCommand::Debug)) => {
                    return CommandAnalysis {
                        kind: AnalysisKind::Debug,
                        utterance: utterance.to_string(),
                        user_target: "$debug".to_string(),
                    }
                }
                Ok(cmd) => {
                    let kind = if candidate.is_confident() {
                        AnalysisKind::ConfidentInDomainCommand
                    } else {
                        AnalysisKind::NonconfidentInDomainCommand
                    };
                    let pending = match cmd {
                        ControlCommand::Program(p) => Pending::Program(p),
                        other => Pending::Control(other),
                    };
                    return self.stash(pending, kind, input);
                }
                Err(_) => continue,
            }
        }
        CommandAnalysis::out_of_domain(input)
    }

    async fn reply_for_control(
        &mut self,
        cmd: ControlCommand,
        dlg: &mut SubDialogue<'_>,
    ) -> Result<ReplyResult> {
        match cmd {
            ControlCommand::Special(SpecialCommand::Nevermind) => {
                Err(dlg.cancel_with_apology().await)
            }
            ControlCommand::Special(SpecialCommand::Stop) => Err(AgentError::Cancelled),
            ControlCommand::Special(SpecialCommand::Yes) => {
                dlg.reply("Yes what?").await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::Special(SpecialCommand::No) => {
                dlg.reply("Okay, then I won't do anything.").await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::Special(SpecialCommand::Help) => {
                self.help_categories(dlg).await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::Special(SpecialCommand::Makerule) => {
                match build_rule(dlg).await? {
                    // Built step by step, so "Run it" is the confirmation.
                    Some(program) => self.run_program(dlg, program, false).await,
                    None => {
                        dlg.reply("Okay, forget it.").await;
                        Ok(ReplyResult::empty())
                    }
                }
            }
            // Wakeup outside a sub-dialogue is an empty reply, as is the
            // rest of the navigation vocabulary with nothing to navigate.
            ControlCommand::Special(
                SpecialCommand::Wakeup
                | SpecialCommand::Empty
                | SpecialCommand::Back
                | SpecialCommand::More
                | SpecialCommand::Maybe,
            ) => Ok(ReplyResult::empty()),
            ControlCommand::Special(SpecialCommand::Debug) => Ok(ReplyResult::empty()),
            ControlCommand::Category(category) => {
                self.help_commands_in_category(dlg, &category).await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::CommandList { device, .. } => {
                self.help_examples(dlg, &device).await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::Policy(rule) => {
                let described: Vec<String> = rule.filters.iter().map(|f| f.describe()).collect();
                let who = match &rule.principal {
                    super::ast::PrincipalSpec::Anyone => "anyone".to_string(),
                    super::ast::PrincipalSpec::Exact(p) => p.clone(),
                };
                let mut prompt = format!(
                    "Okay, so you allow {} to use {}.{}",
                    who, rule.kind, rule.channel
                );
                if !described.is_empty() {
                    prompt.push_str(&format!(" if {}", described.join(" and ")));
                }
                prompt.push_str(". Is that right?");
                if dlg.ask_yes_no(&prompt).await? {
                    self.executor
                        .add_permission(&rule)
                        .await
                        .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
                    dlg.reply("Consider it done.").await;
                } else {
                    dlg.reply("Okay, I won't do that.").await;
                }
                Ok(ReplyResult::empty())
            }
            ControlCommand::Choice(_) | ControlCommand::Answer(_) | ControlCommand::Filter(_) => {
                dlg.reply("Sorry, I did not understand that. Can you rephrase it?").await;
                Ok(ReplyResult::empty())
            }
            ControlCommand::Program(_) => {
                unreachable!("Program commands are routed to Pending::Program, not Pending::Control")
            }
        }
    }

    async fn help_categories(&self, dlg: &mut SubDialogue<'_>) {
        dlg.reply("Click on one of the following buttons to get started.").await;
        for category in self.catalog.categories() {
            dlg.reply_button(
                &category.name,
                &serde_json::json!({ "code": ["bookkeeping", "category", category.id] }),
            )
            .await;
        }
    }

    async fn help_commands_in_category(&self, dlg: &mut SubDialogue<'_>, category: &str) {
        let kinds = self.catalog.kinds_in_category(category).await;
        if kinds.is_empty() {
            dlg.reply("There is nothing in that category yet.").await;
            return;
        }
        dlg.reply("Pick a skill to see its commands.").await;
        for kind in kinds {
            dlg.reply_button(
                &kind.name,
                &serde_json::json!({
                    "code": ["bookkeeping", "commands", category, format!("device:{}", kind.kind)]
                }),
            )
            .await;
        }
    }

    async fn help_examples(&self, dlg: &mut SubDialogue<'_>, kind: &str) {
        let examples = self.catalog.examples_for(kind).await;
        if examples.is_empty() {
            dlg.reply("That skill has no commands yet.").await;
            return;
        }
        for example in examples {
            dlg.reply_button(&example.label, &serde_json::json!({ "code": example.code })).await;
        }
    }

    async fn run_program(
        &mut self,
        dlg: &mut SubDialogue<'_>,
        mut program: Program,
        confirm: bool,
    ) -> Result<ReplyResult> {
        if program.is_remote() {
            return self.run_remote_program(dlg, program).await;
        }

        let mut attempted_configure = false;
        loop {
            match prepare_program(dlg, &mut program).await? {
                Prepared::UnknownFunction { kind, .. } => {
                    dlg.reply(&format!(
                        "Sorry, I don't know how to use {} yet.",
                        pretty_kind(&kind)
                    ))
                    .await;
                    dlg.reply_link(
                        &format!("Configure {}", pretty_kind(&kind)),
                        &format!("/devices/create/{}", kind),
                    )
                    .await;
                    return Ok(ReplyResult::empty());
                }
                Prepared::Unconfigured { kind } => {
                    dlg.reply(&format!("You don't have a {} configured.", pretty_kind(&kind)))
                        .await;
                    if attempted_configure {
                        dlg.reply_link(
                            &format!("Configure {}", pretty_kind(&kind)),
                            &format!("/devices/create/{}", kind),
                        )
                        .await;
                        return Ok(ReplyResult::empty());
                    }
                    attempted_configure = true;
                    dlg.interactive_configure(Some(&kind)).await?;
                    if self.catalog.devices_of_kind(&kind).is_empty() {
                        // OAuth or external flow: the user finishes in the
                        // browser and retries the command afterwards.
                        return Ok(ReplyResult::empty());
                    }
                }
                Prepared::Ready => break,
            }
        }

        if confirm {
            let description = describe_program(&*self.catalog, &program).await;
            let confirmed = dlg
                .ask_yes_no(&format!("Okay, so you want me to {}. Is that right?", description))
                .await?;
            if !confirmed {
                dlg.reply("Okay, I won't do that.").await;
                return Ok(ReplyResult::empty());
            }
        }

        self.execute_and_render(dlg, &program).await?;
        Ok(ReplyResult::empty())
    }

    /// Remote flow: resolve the target principal through the contact book,
    /// confirm, then split into the local monitor and the remote half.
    async fn run_remote_program(
        &mut self,
        dlg: &mut SubDialogue<'_>,
        program: Program,
    ) -> Result<ReplyResult> {
        let executor_value = program.executor.clone().expect("remote program without executor");
        let (name, display) = match &executor_value {
            Value::Entity { value, display, .. } | Value::Contact { value, display, .. } => {
                (value.clone(), display.clone())
            }
            Value::String(s) => (s.clone(), None),
            other => {
                warn!("unsupported executor value {:?}", other);
                dlg.reply("Sorry, I don't know how to do that yet.").await;
                return Ok(ReplyResult::empty());
            }
        };

        // Already-resolved principals carry their messaging prefix.
        let (principal, principal_display) = if name.contains(':') {
            (name.clone(), display.unwrap_or(name))
        } else {
            match dlg.resolve_contact(ContactCategory::Account, &name, display).await? {
                Value::Contact { value, display, .. } => {
                    (value, display.unwrap_or_else(|| name.clone()))
                }
                _ => {
                    dlg.reply("Sorry, I can't find who you mean.").await;
                    return Ok(ReplyResult::empty());
                }
            }
        };

        let inner = Program { executor: None, rules: program.rules.clone() };
        let description = describe_program(&*self.catalog, &inner).await;
        let confirmed = dlg
            .ask_yes_no(&format!(
                "Okay, so you want me to tell {} to {}. Is that right?",
                principal_display, description
            ))
            .await?;
        if !confirmed {
            dlg.reply("Okay, I won't do that.").await;
            return Ok(ReplyResult::empty());
        }

        let result_schema = match returning_source(&inner) {
            Some((kind, channel)) => self.catalog.function_schema(&kind, &channel).await,
            None => None,
        };
        let program_id = Uuid::new_v4().to_string();
        let lowered = lower_return(
            &inner,
            &principal,
            &self.own_identity,
            &program_id,
            result_schema.as_ref(),
        );

        let app_id = Uuid::new_v4().to_string();
        self.executor
            .execute(&app_id, &lowered.local)
            .await
            .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
        self.executor
            .install_remote(&principal, &self.own_identity, &lowered.remote)
            .await
            .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
        info!(principal = %principal, program = %lowered.remote.to_code(), "remote program installed");
        dlg.reply("Consider it done.").await;
        Ok(ReplyResult::empty())
    }

    /// Hand the program to the executor and render every result. Executor
    /// errors become per-result apologies; they never cancel the session.
    async fn execute_and_render(&self, dlg: &mut SubDialogue<'_>, program: &Program) -> Result<()> {
        let app_id = Uuid::new_v4().to_string();
        let outputs = match self.executor.execute(&app_id, program).await {
            Ok(outputs) => outputs,
            Err(e) => {
                dlg.reply(&format!("Sorry, that did not work: {}.", e)).await;
                return Ok(());
            }
        };

        let mut delivered = false;
        for output in &outputs {
            match output {
                ExecOutput::Result { output_type, output_value } => {
                    delivered = true;
                    let messages = match self.catalog.format_spec(output_type).await {
                        Some(spec) => dlg.services.formatter.render(&spec, output_value),
                        None => dlg.services.formatter.render_fallback(&app_id, output_value),
                    };
                    for message in &messages {
                        dlg.io
                            .delegate
                            .send_reply_message(message, dlg.session.icon.as_deref())
                            .await;
                    }
                }
                ExecOutput::Error { message } => {
                    delivered = true;
                    dlg.reply(&format!("Sorry, that did not work: {}.", message)).await;
                }
            }
        }

        if !delivered {
            let closing = match program.rules.first().map(|r| &r.trigger) {
                Some(Trigger::Monitor(_)) => "Alright, I'll notify you when there is something new.",
                _ => "Consider it done.",
            };
            dlg.reply(closing).await;
        }
        Ok(())
    }

}

#[async_trait]
impl DialogueHandler for ProgramHandler {
    fn unique_id(&self) -> &str {
        PROGRAM_HANDLER_ID
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn initialize(
        &mut self,
        _prev_state: Option<&serde_json::Value>,
        show_welcome: bool,
    ) -> Option<ReplyResult> {
        if !show_welcome {
            return None;
        }
        let first_time = !self
            .prefs
            .get(keys::INITIALIZED)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if first_time {
            self.prefs.set(keys::INITIALIZED, serde_json::json!(true));
            Some(ReplyResult::text(
                "Hello! I'm your assistant. I can run commands and connect your skills together. Say \"help\" to find out what I can do.",
            ))
        } else {
            Some(ReplyResult::text("Welcome back!"))
        }
    }

    async fn analyze(&mut self, input: &UserInput) -> CommandAnalysis {
        self.pending = None;
        match &input.kind {
            UserInputKind::Program { program } => self.stash(
                Pending::Program(program.clone()),
                AnalysisKind::ConfidentInDomainCommand,
                input,
            ),
            UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                Ok(ControlCommand::Special(SpecialCommand::Stop)) => CommandAnalysis {
                    kind: AnalysisKind::Stop,
                    utterance: input.utterance(),
                    user_target: "$stop".to_string(),
                },
                Ok(ControlCommand::Special(SpecialCommand::Debug)) => CommandAnalysis {
                    kind: AnalysisKind::Debug,
                    utterance: input.utterance(),
                    user_target: "$debug".to_string(),
                },
                Ok(ControlCommand::Program(program)) => self.stash(
                    Pending::Program(program),
                    AnalysisKind::ConfidentInDomainCommand,
                    input,
                ),
                Ok(cmd) => {
                    self.stash(Pending::Control(cmd), AnalysisKind::ConfidentInDomainCommand, input)
                }
                Err(e) => {
                    warn!("failed to parse token stream: {}", e);
                    self.stash(Pending::ParseError, AnalysisKind::ConfidentInDomainCommand, input)
                }
            },
            UserInputKind::Command { utterance } => {
                let utterance = utterance.clone();
                self.analyze_utterance(input, &utterance).await
            }
        }
    }

    async fn get_reply(
        &mut self,
        analysis: CommandAnalysis,
        dlg: &mut SubDialogue<'_>,
    ) -> Result<ReplyResult> {
        let _ = analysis;
        match self.pending.take() {
            Some(Pending::Program(program)) => self.run_program(dlg, program, true).await,
            Some(Pending::Control(cmd)) => self.reply_for_control(cmd, dlg).await,
            Some(Pending::ParseError) => {
                dlg.reply("Sorry, I don't know how to do that yet.").await;
                Ok(ReplyResult::empty())
            }
            Some(Pending::ServiceFailure(message)) => {
                Err(AgentError::ServiceUnavailable(message))
            }
            None => {
                dlg.reply("Sorry, I did not understand that. Can you rephrase it?").await;
                Ok(ReplyResult::empty())
            }
        }
    }

    fn state(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn reset(&mut self) {
        self.pending = None;
    }
}

/// Deterministic confirmation prose: each invocation renders its schema's
/// confirmation template with the filled parameter values, joined in rule
/// order.
pub async fn describe_program(catalog: &dyn SkillCatalog, program: &Program) -> String {
    let mut parts: Vec<String> = Vec::new();
    for rule in &program.rules {
        let mut rule_parts: Vec<String> = Vec::new();
        for inv in rule.invocations() {
            let confirmation =
                match catalog.function_schema(&inv.selector.kind, &inv.channel).await {
                    Some(schema) => schema.confirmation,
                    None => format!("use {}.{}", inv.selector.kind, inv.channel),
                };
            let mut args = serde_json::Map::new();
            for binding in &inv.params {
                let rendered = match &binding.value {
                    Value::VarRef(name) => format!("the {}", name.replace('_', " ")),
                    Value::Undefined => "____".to_string(),
                    other => other.display(),
                };
                args.insert(binding.name.clone(), serde_json::Value::String(rendered));
            }
            rule_parts.push(interpolate(&confirmation, &serde_json::Value::Object(args)));
        }
        let mut description = match &rule.trigger {
            Trigger::Monitor(_) => {
                let source = rule_parts.remove(0);
                if rule_parts.is_empty() {
                    format!("notify you when {} changes", source)
                } else {
                    format!("{} when {} changes", rule_parts.join(" and then "), source)
                }
            }
            Trigger::Now => rule_parts.join(" and then "),
        };
        if !rule.filters.is_empty() {
            let filters: Vec<String> = rule.filters.iter().map(|f| f.describe()).collect();
            description.push_str(&format!(" if {}", filters.join(" and ")));
        }
        if rule.action == Action::Return {
            description.push_str(" and then send me the result");
        }
        parts.push(description);
    }
    parts.join("; ")
}

/// Out-of-band rendering: notifications and errors from running programs,
/// routed here by the loop.
pub struct Notifier {
    catalog: Arc<dyn SkillCatalog>,
    formatter: Formatter,
}

impl Notifier {
    pub fn new(catalog: Arc<dyn SkillCatalog>, formatter: Formatter) -> Self {
        Self { catalog, formatter }
    }

    pub async fn dispatch(&self, delegate: &dyn Delegate, item: &QueueItem) {
        match item {
            QueueItem::Notification { app_name, output_type, output_value, .. } => {
                let spec = match output_type {
                    Some(output_type) => self.catalog.format_spec(output_type).await,
                    None => None,
                };
                let messages = match spec {
                    Some(spec) => self.formatter.render(&spec, output_value),
                    None => self.formatter.render_fallback(app_name, output_value),
                };
                for message in &messages {
                    delegate.send_reply_message(message, None).await;
                }
            }
            QueueItem::Error { error, .. } => {
                delegate.send(&format!("Sorry, that did not work: {}.", error), None).await;
            }
            QueueItem::UserInput { .. } | QueueItem::PermissionRequest { .. } => {
                unreachable!("routed by the loop, not the notifier")
            }
        }
    }
}

fn pretty_kind(kind: &str) -> String {
    kind.rsplit('.').next().unwrap_or(kind).to_string()
}
