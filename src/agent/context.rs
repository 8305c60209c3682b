use super::delegate::Delegate;
use super::error::{AgentError, Result};
use super::queue::{Handshake, IntentQueue};
use super::types::{
    AskSpecialKind, ContactEntry, PlatformData, QueueItem, Rdl, UserInput, UserInputKind,
    ValueCategory,
};
use crate::format::Formatter;
use crate::program::ast::{ContactCategory, Location, ParamType, Value};
use crate::program::executor::Executor;
use crate::program::parse::{parse_command, ControlCommand, SpecialCommand};
use crate::services::catalog::{DeviceFactory, SkillCatalog};
use crate::services::nlu::NluClient;
use crate::services::prefs::PreferenceStore;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Session-scope variables owned by the loop. `reset` clears exactly this
/// set; handler state is cleared by the handlers themselves.
#[derive(Debug, Default)]
pub struct SessionState {
    pub current_handler: Option<String>,
    pub expecting: Option<ValueCategory>,
    pub raw: bool,
    pub icon: Option<String>,
    pub platform_data: PlatformData,
    pub choices: Vec<String>,
}

impl SessionState {
    pub fn reset(&mut self) {
        self.current_handler = None;
        self.expecting = None;
        self.raw = false;
        self.icon = None;
        self.platform_data = PlatformData::default();
        self.choices.clear();
    }
}

/// The loop's queues, sink and rendezvous, shared with the conversation
/// handle.
pub struct LoopIo {
    pub user_queue: Arc<IntentQueue<UserInput>>,
    pub notify_queue: Arc<IntentQueue<QueueItem>>,
    pub delegate: Arc<dyn Delegate>,
    pub handshake: Handshake,
}

/// External collaborators, injected once at startup.
pub struct Services {
    pub nlu: Arc<dyn NluClient>,
    pub catalog: Arc<dyn SkillCatalog>,
    pub executor: Arc<dyn Executor>,
    pub prefs: Arc<dyn PreferenceStore>,
    pub formatter: Formatter,
}

/// Outcome of a choice prompt that admits navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChoiceOutcome {
    Index(usize),
    Back,
    More,
}

/// The narrow loop-capabilities object handed to `get_reply`.
///
/// Every `ask*` primitive suspends on the user-input queue and owns the
/// expecting/raw markers while parked, so the shell always knows what input
/// shape comes next. Cancellation (`special:nevermind`, `special:stop`,
/// `reset`) surfaces as `AgentError::Cancelled` from any primitive and must
/// be allowed to unwind.
pub struct SubDialogue<'a> {
    pub io: &'a LoopIo,
    pub services: &'a Services,
    pub session: &'a mut SessionState,
}

/// The apology attached to a user-initiated `nevermind`, at any depth.
pub const NEVERMIND_APOLOGY: &str = "Sorry I couldn't help on that.";

impl<'a> SubDialogue<'a> {
    pub fn new(io: &'a LoopIo, services: &'a Services, session: &'a mut SessionState) -> Self {
        Self { io, services, session }
    }

    /// Emit the nevermind apology and produce the cancellation signal. STOP
    /// cancels silently; nevermind goes through here.
    pub async fn cancel_with_apology(&mut self) -> AgentError {
        self.reply(NEVERMIND_APOLOGY).await;
        AgentError::Cancelled
    }

    // ---- outbound -------------------------------------------------------

    pub async fn reply(&self, text: &str) {
        self.io.delegate.send(text, self.session.icon.as_deref()).await;
    }

    pub async fn reply_picture(&self, url: &str) {
        self.io.delegate.send_picture(url, self.session.icon.as_deref()).await;
    }

    pub async fn reply_rdl(&self, rdl: &Rdl) {
        self.io.delegate.send_rdl(rdl, self.session.icon.as_deref()).await;
    }

    pub async fn reply_link(&self, title: &str, url: &str) {
        self.io.delegate.send_link(title, url).await;
    }

    pub async fn reply_button(&self, title: &str, json: &serde_json::Value) {
        self.io.delegate.send_button(title, json).await;
    }

    pub async fn reply_choice(&self, index: usize, title: &str) {
        self.io.delegate.send_choice(index, title).await;
    }

    pub async fn reply_ask_special(&self, kind: AskSpecialKind) {
        self.io.delegate.send_ask_special(kind).await;
    }

    /// Mark what we expect next and emit the trailing ask-special frame.
    async fn begin_expect(&mut self, category: ValueCategory) {
        self.session.expecting = Some(category);
        self.session.raw = category.is_raw();
        self.io.delegate.send_ask_special(category.ask_special()).await;
    }

    // ---- suspension -----------------------------------------------------

    /// Park on the user-input queue until the shell pushes the next turn.
    pub async fn next_command(&mut self) -> Result<UserInput> {
        self.io.handshake.enter_wait();
        let result = self.io.user_queue.pop().await;
        self.io.handshake.leave_wait();
        let input = result?;
        if input.platform_data != PlatformData::default() {
            self.session.platform_data = input.platform_data.clone();
        }
        Ok(input)
    }

    // ---- primitives -----------------------------------------------------

    /// Ask a question constrained to `category` and suspend until a matching
    /// answer arrives. Mismatching inputs are re-prompted; `nevermind`
    /// cancels.
    pub async fn ask(&mut self, category: ValueCategory, prompt: &str) -> Result<Value> {
        self.reply(prompt).await;
        self.begin_expect(category).await;
        loop {
            let input = self.next_command().await?;
            match self.classify_answer(&input, category).await? {
                Answer::Value(value) => {
                    self.session.expecting = None;
                    self.session.raw = false;
                    return Ok(value);
                }
                Answer::Mismatch(message) => {
                    self.reply(&message).await;
                    self.begin_expect(category).await;
                }
            }
        }
    }

    pub async fn ask_yes_no(&mut self, prompt: &str) -> Result<bool> {
        match self.ask(ValueCategory::YesNo, prompt).await? {
            Value::Bool(b) => Ok(b),
            _ => Ok(false),
        }
    }

    /// Present numbered choices and suspend until one is picked. Back/more
    /// are treated as mismatches here; rule-builder flows use
    /// `ask_choices_nav`.
    pub async fn ask_choices(&mut self, prompt: &str, choices: &[String]) -> Result<usize> {
        loop {
            match self.ask_choices_nav(prompt, choices).await? {
                ChoiceOutcome::Index(i) => return Ok(i),
                ChoiceOutcome::Back | ChoiceOutcome::More => {
                    self.reply("Please pick one of the choices.").await;
                }
            }
        }
    }

    /// Choice prompt where `special:back` and `special:more` are first-class
    /// transitions.
    pub async fn ask_choices_nav(
        &mut self,
        prompt: &str,
        choices: &[String],
    ) -> Result<ChoiceOutcome> {
        self.reply(prompt).await;
        for (index, title) in choices.iter().enumerate() {
            self.reply_choice(index, title).await;
        }
        self.session.choices = choices.to_vec();
        self.begin_expect(ValueCategory::Choice).await;

        loop {
            let input = self.next_command().await?;
            match &input.kind {
                UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                    Ok(ControlCommand::Choice(i)) if i < choices.len() => {
                        self.session.expecting = None;
                        self.session.choices.clear();
                        return Ok(ChoiceOutcome::Index(i));
                    }
                    Ok(ControlCommand::Special(SpecialCommand::Back)) => {
                        self.session.expecting = None;
                        return Ok(ChoiceOutcome::Back);
                    }
                    Ok(ControlCommand::Special(SpecialCommand::More)) => {
                        self.session.expecting = None;
                        return Ok(ChoiceOutcome::More);
                    }
                    Ok(ControlCommand::Special(SpecialCommand::Nevermind)) => {
                        return Err(self.cancel_with_apology().await)
                    }
                    Ok(ControlCommand::Special(SpecialCommand::Stop)) => {
                        return Err(AgentError::Cancelled)
                    }
                    _ => {}
                },
                UserInputKind::Command { utterance } => {
                    // Typing the choice title works as well as clicking it.
                    if let Some(i) = choices
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(utterance.trim()))
                    {
                        self.session.expecting = None;
                        self.session.choices.clear();
                        return Ok(ChoiceOutcome::Index(i));
                    }
                }
                UserInputKind::Program { .. } => {}
            }
            self.reply("Could you choose one of the following?").await;
            for (index, title) in choices.iter().enumerate() {
                self.reply_choice(index, title).await;
            }
            self.begin_expect(ValueCategory::Choice).await;
        }
    }

    /// Ask for a typed answer on behalf of a skill and coerce it: contacts
    /// go through the contact picker, locations through the geocoder,
    /// `$context` variables through the persisted user context.
    pub async fn ask_question(
        &mut self,
        skill: &str,
        ptype: &ParamType,
        prompt: &str,
    ) -> Result<Value> {
        let value = self.ask(ptype.ask_category(), prompt).await?;
        self.coerce_answer(skill, ptype, value).await
    }

    async fn coerce_answer(&mut self, skill: &str, ptype: &ParamType, value: Value) -> Result<Value> {
        match value {
            Value::Contact { value, category, display } => {
                self.resolve_contact(category, &value, display).await
            }
            Value::Location(Location::Relative(name)) => {
                let resolved =
                    self.resolve_user_context(&format!("$context.location.{}", name)).await?;
                Ok(resolved)
            }
            Value::Location(loc @ Location::Absolute { .. }) => Ok(Value::Location(loc)),
            Value::String(s) if matches!(ptype, ParamType::Location) => {
                let loc = self.lookup_location(&s, None).await?;
                Ok(Value::Location(loc))
            }
            Value::Number(n) => {
                if let ParamType::Measure(unit) = ptype {
                    Ok(Value::Measure { value: n, unit: unit.clone() })
                } else {
                    Ok(Value::Number(n))
                }
            }
            other => {
                let _ = skill;
                Ok(other)
            }
        }
    }

    /// Platform-contacts lookup. Pure API call, no suspension.
    pub fn lookup_contact(&self, category: ContactCategory, name: &str) -> Vec<ContactEntry> {
        let needle = name.to_lowercase();
        self.session
            .platform_data
            .contacts
            .iter()
            .filter(|c| c.category == category)
            .filter(|c| c.display.to_lowercase().contains(&needle) || c.value == name)
            .cloned()
            .collect()
    }

    /// Resolve a contact name to a concrete entry, disambiguating through a
    /// numbered picker when several match and asking for a value when none
    /// do.
    pub async fn resolve_contact(
        &mut self,
        category: ContactCategory,
        name: &str,
        display: Option<String>,
    ) -> Result<Value> {
        let matches = self.lookup_contact(category, name);
        match matches.len() {
            0 => {
                let prompt = match category {
                    ContactCategory::PhoneNumber => {
                        format!("What is the phone number of {}?", name)
                    }
                    ContactCategory::EmailAddress => {
                        format!("What is the email address of {}?", name)
                    }
                    ContactCategory::Account => format!("What is the username of {}?", name),
                };
                let answer_category = match category {
                    ContactCategory::PhoneNumber => ValueCategory::PhoneNumber,
                    ContactCategory::EmailAddress => ValueCategory::EmailAddress,
                    ContactCategory::Account => ValueCategory::RawString,
                };
                let value = self.ask(answer_category, &prompt).await?;
                Ok(match value {
                    Value::Contact { value, .. } | Value::String(value) => Value::Contact {
                        value,
                        category,
                        display: display.or_else(|| Some(name.to_string())),
                    },
                    other => other,
                })
            }
            1 => {
                let entry = &matches[0];
                Ok(Value::Contact {
                    value: entry.value.clone(),
                    category,
                    display: Some(entry.display.clone()),
                })
            }
            _ => {
                let titles: Vec<String> = matches
                    .iter()
                    .map(|c| format!("{} ({})", c.display, c.value))
                    .collect();
                let index = self
                    .ask_choices(&format!("Multiple contacts match \"{}\". Who did you mean?", name), &titles)
                    .await?;
                let entry = &matches[index];
                Ok(Value::Contact {
                    value: entry.value.clone(),
                    category,
                    display: Some(entry.display.clone()),
                })
            }
        }
    }

    /// Geocode a free-form location, recursing through `ask` until
    /// something resolves.
    pub async fn lookup_location(
        &mut self,
        query: &str,
        previous: Option<&str>,
    ) -> Result<Location> {
        match self.services.catalog.lookup_location(query).await {
            Ok(results) if !results.is_empty() => Ok(results.into_iter().next().unwrap()),
            Ok(_) | Err(_) => {
                if previous == Some(query) {
                    // Same failing answer twice: give the geocoder a rest.
                    self.reply("Sorry, I cannot find that location.").await;
                    return Err(AgentError::Cancelled);
                }
                self.reply(&format!("Sorry, I cannot find any location matching \"{}\".", query))
                    .await;
                let answer =
                    self.ask(ValueCategory::Location, "What location are you looking for?").await?;
                match answer {
                    Value::Location(loc @ Location::Absolute { .. }) => Ok(loc),
                    Value::Location(Location::Relative(name)) => {
                        let var = format!("$context.location.{}", name);
                        match Box::pin(self.resolve_user_context(&var)).await? {
                            Value::Location(loc) => Ok(loc),
                            _ => Err(AgentError::Cancelled),
                        }
                    }
                    Value::String(s) => Box::pin(self.lookup_location(&s, Some(query))).await,
                    _ => Err(AgentError::Cancelled),
                }
            }
        }
    }

    /// Resolve a `$context` variable from the preference store, asking the
    /// user and persisting the answer on a miss.
    pub async fn resolve_user_context(&mut self, var_name: &str) -> Result<Value> {
        let key = format!("context-{}", var_name);
        if let Some(stored) = self.services.prefs.get(&key) {
            if let Ok(value) = serde_json::from_value::<Value>(stored) {
                return Ok(value);
            }
            warn!("discarding corrupt user context for {}", key);
        }

        let (category, prompt, save) = match var_name {
            "$context.location.home" => {
                (ValueCategory::Location, "What is your home address?", true)
            }
            "$context.location.work" => {
                (ValueCategory::Location, "What is your work address?", true)
            }
            "$context.location.current_location" => {
                (ValueCategory::Location, "Where are you now?", false)
            }
            "$context.time.morning" => {
                (ValueCategory::Time, "What time do you usually get up?", true)
            }
            "$context.time.evening" => {
                (ValueCategory::Time, "What time do you usually go to bed?", true)
            }
            other => {
                return Err(AgentError::Unexpected(format!(
                    "unknown user context variable {}",
                    other
                )))
            }
        };

        let mut value = self.ask(category, prompt).await?;
        let location_query = match (&value, category) {
            (Value::String(q), ValueCategory::Location) => Some(q.clone()),
            _ => None,
        };
        if let Some(query) = location_query {
            value = Value::Location(Box::pin(self.lookup_location(&query, None)).await?);
        }
        if save {
            if let Ok(json) = serde_json::to_value(&value) {
                self.services.prefs.set(&key, json);
            }
        }
        Ok(value)
    }

    /// Drive the device-specific configuration flow for a skill kind. With
    /// no kind, ask which skill first.
    pub async fn interactive_configure(&mut self, kind: Option<&str>) -> Result<()> {
        let kind = match kind {
            Some(k) => k.to_string(),
            None => {
                match self.ask(ValueCategory::RawString, "Which skill do you want to configure?").await? {
                    Value::String(s) => s,
                    _ => return Err(AgentError::Cancelled),
                }
            }
        };

        match self.services.catalog.device_factory(&kind).await {
            Some(DeviceFactory::None) => {
                let device = self
                    .services
                    .catalog
                    .create_device(&kind, HashMap::new())
                    .await
                    .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
                self.reply(&format!("Okay, I configured {}.", device.name)).await;
                Ok(())
            }
            Some(DeviceFactory::OAuth { url }) => {
                self.reply_link(&format!("Configure {}", pretty_kind(&kind)), &url).await;
                Ok(())
            }
            Some(DeviceFactory::Form { fields }) => {
                let mut params = HashMap::new();
                for field in &fields {
                    let value =
                        self.ask(field.ptype.ask_category(), &format!("Please enter the {}.", field.label)).await?;
                    let text = match value {
                        Value::String(s) => s,
                        other => other.display(),
                    };
                    params.insert(field.name.clone(), text);
                }
                let device = self
                    .services
                    .catalog
                    .create_device(&kind, params)
                    .await
                    .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
                self.reply(&format!("Okay, I configured {}.", device.name)).await;
                Ok(())
            }
            None => {
                self.reply_link(
                    &format!("Configure {}", pretty_kind(&kind)),
                    &format!("/devices/create/{}", kind),
                )
                .await;
                Ok(())
            }
        }
    }

    // ---- answer classification -----------------------------------------

    async fn classify_answer(
        &mut self,
        input: &UserInput,
        category: ValueCategory,
    ) -> Result<Answer> {
        match &input.kind {
            UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                Ok(ControlCommand::Special(SpecialCommand::Nevermind)) => {
                    Err(self.cancel_with_apology().await)
                }
                Ok(ControlCommand::Special(SpecialCommand::Stop)) => Err(AgentError::Cancelled),
                Ok(ControlCommand::Special(SpecialCommand::Yes))
                    if category == ValueCategory::YesNo =>
                {
                    Ok(Answer::Value(Value::Bool(true)))
                }
                Ok(ControlCommand::Special(SpecialCommand::No))
                    if category == ValueCategory::YesNo =>
                {
                    Ok(Answer::Value(Value::Bool(false)))
                }
                Ok(ControlCommand::Answer(value)) if value_matches(&value, category) => {
                    Ok(Answer::Value(value))
                }
                Ok(ControlCommand::Choice(i)) if category == ValueCategory::Choice => {
                    Ok(Answer::Value(Value::Number(i as f64)))
                }
                _ => Ok(Answer::Mismatch(mismatch_message(category))),
            },
            UserInputKind::Command { utterance } => {
                self.classify_utterance(utterance, category).await
            }
            UserInputKind::Program { .. } => Ok(Answer::Mismatch(mismatch_message(category))),
        }
    }

    async fn classify_utterance(&mut self, utterance: &str, category: ValueCategory) -> Result<Answer> {
        let trimmed = utterance.trim();
        if category.is_raw() {
            return Ok(Answer::Value(Value::String(trimmed.to_string())));
        }
        match category {
            ValueCategory::YesNo => match yes_no(trimmed) {
                Some(b) => Ok(Answer::Value(Value::Bool(b))),
                None => {
                    if trimmed.eq_ignore_ascii_case("nevermind")
                        || trimmed.eq_ignore_ascii_case("never mind")
                    {
                        return Err(self.cancel_with_apology().await);
                    }
                    Ok(Answer::Mismatch("Yes what?".to_string()))
                }
            },
            ValueCategory::Number => match trimmed.parse::<f64>() {
                Ok(n) => Ok(Answer::Value(Value::Number(n))),
                Err(_) => self.nlu_answer(trimmed, category).await,
            },
            _ => self.nlu_answer(trimmed, category).await,
        }
    }

    /// Send a free-form answer through NLU with the expecting hint. A
    /// service outage becomes an apology followed by cancellation.
    async fn nlu_answer(&mut self, utterance: &str, category: ValueCategory) -> Result<Answer> {
        let parsed = match self.services.nlu.parse(utterance, Some(category)).await {
            Ok(result) => result,
            Err(e) => {
                warn!("NLU failure during sub-dialogue: {}", e);
                self.reply("Sorry, I had an error contacting the parsing service.").await;
                return Err(AgentError::Cancelled);
            }
        };
        for candidate in &parsed.candidates {
            if let Ok(cmd) = parse_command(&candidate.code, &parsed.entities) {
                match cmd {
                    ControlCommand::Special(SpecialCommand::Nevermind) => {
                        return Err(self.cancel_with_apology().await)
                    }
                    ControlCommand::Special(SpecialCommand::Stop) => {
                        return Err(AgentError::Cancelled)
                    }
                    ControlCommand::Answer(value) if value_matches(&value, category) => {
                        return Ok(Answer::Value(value))
                    }
                    _ => continue,
                }
            }
        }
        Ok(Answer::Mismatch(mismatch_message(category)))
    }
}

enum Answer {
    Value(Value),
    Mismatch(String),
}

fn yes_no(utterance: &str) -> Option<bool> {
    match utterance.to_lowercase().as_str() {
        "yes" | "yeah" | "yep" | "sure" | "ok" | "okay" => Some(true),
        "no" | "nope" | "nah" => Some(false),
        _ => None,
    }
}

fn value_matches(value: &Value, category: ValueCategory) -> bool {
    match category {
        ValueCategory::YesNo => matches!(value, Value::Bool(_)),
        ValueCategory::Number => matches!(value, Value::Number(_) | Value::Measure { .. }),
        ValueCategory::Location => {
            matches!(value, Value::Location(_) | Value::String(_))
        }
        ValueCategory::Time => matches!(value, Value::Time { .. }),
        ValueCategory::Date => matches!(value, Value::Date(_)),
        ValueCategory::PhoneNumber => matches!(
            value,
            Value::Contact { category: ContactCategory::PhoneNumber, .. } | Value::String(_)
        ),
        ValueCategory::EmailAddress => matches!(
            value,
            Value::Contact { category: ContactCategory::EmailAddress, .. } | Value::String(_)
        ),
        ValueCategory::Contact => matches!(value, Value::Contact { .. } | Value::Entity { .. }),
        ValueCategory::Choice => matches!(value, Value::Number(_)),
        ValueCategory::RawString | ValueCategory::Password => matches!(value, Value::String(_)),
        ValueCategory::Command | ValueCategory::Generic => true,
    }
}

fn mismatch_message(category: ValueCategory) -> String {
    match category {
        ValueCategory::YesNo => "Yes what?".to_string(),
        ValueCategory::Number => "Could you give me a number?".to_string(),
        ValueCategory::Choice => "Could you choose one of the following?".to_string(),
        ValueCategory::Location => "Could you give me a place?".to_string(),
        ValueCategory::Time => "Could you give me a time of day?".to_string(),
        ValueCategory::Date => "Could you give me a date?".to_string(),
        ValueCategory::PhoneNumber => "Could you give me a phone number?".to_string(),
        ValueCategory::EmailAddress => "Could you give me an email address?".to_string(),
        ValueCategory::Contact => "Who do you mean?".to_string(),
        _ => "Sorry, I did not understand that.".to_string(),
    }
}

fn pretty_kind(kind: &str) -> String {
    kind.rsplit('.').next().unwrap_or(kind).to_string()
}
