use super::ast::*;
use crate::agent::error::AgentError;
use std::collections::HashMap;

/// The control vocabulary shared between the UI and the loop. Everything a
/// parsed token stream can mean, after entity resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Special(SpecialCommand),
    Choice(usize),
    Answer(Value),
    /// One or more `and`-joined conditions, in the order supplied.
    Filter(Vec<Filter>),
    Category(String),
    CommandList { category: String, device: String },
    Program(Program),
    Policy(PermissionRule),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecialCommand {
    Yes,
    No,
    Maybe,
    Help,
    Back,
    More,
    Empty,
    Wakeup,
    Nevermind,
    Makerule,
    Stop,
    Debug,
}

impl SpecialCommand {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "special:yes" => Some(SpecialCommand::Yes),
            "special:no" => Some(SpecialCommand::No),
            "special:maybe" => Some(SpecialCommand::Maybe),
            "special:help" => Some(SpecialCommand::Help),
            "special:back" => Some(SpecialCommand::Back),
            "special:more" => Some(SpecialCommand::More),
            "special:empty" => Some(SpecialCommand::Empty),
            "special:wakeup" => Some(SpecialCommand::Wakeup),
            "special:nevermind" => Some(SpecialCommand::Nevermind),
            "special:makerule" => Some(SpecialCommand::Makerule),
            "special:stop" => Some(SpecialCommand::Stop),
            "special:debug" => Some(SpecialCommand::Debug),
            _ => None,
        }
    }
}

type Result<T> = std::result::Result<T, AgentError>;

/// Parse one UI token stream with its entity table.
pub fn parse_command(
    code: &[String],
    entities: &HashMap<String, serde_json::Value>,
) -> Result<ControlCommand> {
    let mut p = TokenParser { tokens: code, pos: 0, entities };
    let command = p.command()?;
    if p.pos != code.len() {
        return Err(AgentError::Parse(format!(
            "trailing tokens after command: {:?}",
            &code[p.pos..]
        )));
    }
    Ok(command)
}

struct TokenParser<'a> {
    tokens: &'a [String],
    pos: usize,
    entities: &'a HashMap<String, serde_json::Value>,
}

impl<'a> TokenParser<'a> {
    fn command(&mut self) -> Result<ControlCommand> {
        match self.peek() {
            Some("bookkeeping") => {
                self.advance();
                self.bookkeeping()
            }
            Some("policy") => {
                self.advance();
                Ok(ControlCommand::Policy(self.policy()?))
            }
            Some("now") | Some("monitor") | Some("executor") => {
                Ok(ControlCommand::Program(self.program()?))
            }
            other => Err(self.unexpected("program or bookkeeping command", other)),
        }
    }

    fn bookkeeping(&mut self) -> Result<ControlCommand> {
        match self.peek() {
            Some("special") => {
                self.advance();
                let token = self.next("special token")?;
                SpecialCommand::parse(token)
                    .map(ControlCommand::Special)
                    .ok_or_else(|| AgentError::Parse(format!("unknown special {}", token)))
            }
            Some("choice") => {
                self.advance();
                let token = self.next("choice index")?;
                let index = token
                    .parse::<usize>()
                    .map_err(|_| AgentError::Parse(format!("bad choice index {}", token)))?;
                Ok(ControlCommand::Choice(index))
            }
            Some("answer") => {
                self.advance();
                Ok(ControlCommand::Answer(self.value()?))
            }
            Some("filter") => {
                self.advance();
                let mut filters = vec![self.filter()?];
                while self.peek() == Some("and") {
                    self.advance();
                    filters.push(self.filter()?);
                }
                Ok(ControlCommand::Filter(filters))
            }
            Some("category") => {
                self.advance();
                Ok(ControlCommand::Category(self.next("category name")?.to_string()))
            }
            Some("commands") => {
                self.advance();
                let category = self.next("category name")?.to_string();
                let device = self.next("device")?.trim_start_matches("device:").to_string();
                Ok(ControlCommand::CommandList { category, device })
            }
            other => Err(self.unexpected("bookkeeping kind", other)),
        }
    }

    fn program(&mut self) -> Result<Program> {
        let mut executor = None;
        if self.peek() == Some("executor") {
            self.advance();
            self.expect("=")?;
            executor = Some(self.value()?);
            self.expect(":")?;
        }
        let rule = self.rule()?;
        Ok(Program { executor, rules: vec![rule] })
    }

    fn rule(&mut self) -> Result<Rule> {
        let mut filters = Vec::new();
        let trigger = match self.peek() {
            Some("now") => {
                self.advance();
                Trigger::Now
            }
            Some("monitor") => {
                self.advance();
                let inv = self.invocation()?;
                while self.peek() == Some(",") {
                    self.advance();
                    filters.push(self.filter()?);
                }
                Trigger::Monitor(inv)
            }
            other => return Err(self.unexpected("now or monitor", other)),
        };

        let mut queries = Vec::new();
        let mut action = Action::Notify;
        let mut chain: Vec<ChainElement> = Vec::new();

        while self.peek() == Some("=>") {
            self.advance();
            match self.peek() {
                Some("notify") => {
                    self.advance();
                    chain.push(ChainElement::Notify);
                }
                Some("return") => {
                    self.advance();
                    chain.push(ChainElement::Return);
                }
                Some(tok) if tok.starts_with('@') => {
                    chain.push(ChainElement::Invocation(self.invocation()?));
                }
                other => return Err(self.unexpected("invocation, notify or return", other)),
            }
            // Filters may trail any data source.
            while self.peek() == Some(",") {
                self.advance();
                filters.push(self.filter()?);
            }
        }

        // Everything but the final chain element is a query; the final one is
        // the action, defaulting to notify when the chain ends on a query.
        match chain.pop() {
            Some(ChainElement::Notify) | None => action = Action::Notify,
            Some(ChainElement::Return) => action = Action::Return,
            Some(ChainElement::Invocation(inv)) => {
                if matches!(trigger, Trigger::Now) && chain.is_empty() && self.looks_like_query(&inv)
                {
                    queries.push(inv);
                } else {
                    action = Action::Invoke(inv);
                }
            }
        }
        for elem in chain {
            match elem {
                ChainElement::Invocation(inv) => queries.push(inv),
                _ => return Err(AgentError::Parse("notify in query position".to_string())),
            }
        }

        Ok(Rule { trigger, queries, filters, action })
    }

    // A bare `now => @q` with no explicit action is a query-then-notify; the
    // heuristic only applies to single-element chains.
    fn looks_like_query(&self, inv: &Invocation) -> bool {
        inv.channel.starts_with("get") || inv.channel.starts_with("list")
    }

    fn invocation(&mut self) -> Result<Invocation> {
        let token = self.next("invocation")?;
        let body = token
            .strip_prefix('@')
            .ok_or_else(|| AgentError::Parse(format!("expected @function, got {}", token)))?;
        let (kind, channel) = body
            .rsplit_once('.')
            .ok_or_else(|| AgentError::Parse(format!("bad function name {}", body)))?;
        let mut inv = Invocation::new(kind, channel);

        while let Some(tok) = self.peek() {
            if let Some(name) = tok.strip_prefix("param:") {
                let name = name.to_string();
                self.advance();
                self.expect("=")?;
                let value = self.value()?;
                inv.params.push(ParamBinding { name, value });
            } else {
                break;
            }
        }
        Ok(inv)
    }

    fn filter(&mut self) -> Result<Filter> {
        let param = self.next("filter parameter")?.trim_start_matches("param:").to_string();
        let op_token = self.next("filter operator")?;
        let op = FilterOp::parse(op_token)
            .ok_or_else(|| AgentError::Parse(format!("unknown operator {}", op_token)))?;
        let value = self.value()?;
        Ok(Filter { param, op, value })
    }

    fn policy(&mut self) -> Result<PermissionRule> {
        let principal = match self.peek() {
            Some("true") => {
                self.advance();
                PrincipalSpec::Anyone
            }
            Some("source") => {
                self.advance();
                self.expect("==")?;
                match self.value()? {
                    Value::Entity { value, .. } | Value::String(value) => {
                        PrincipalSpec::Exact(value)
                    }
                    other => {
                        return Err(AgentError::Parse(format!(
                            "bad policy principal {:?}",
                            other
                        )))
                    }
                }
            }
            other => return Err(self.unexpected("true or source", other)),
        };
        self.expect(":")?;
        if self.peek() == Some("now") {
            self.advance();
            self.expect("=>")?;
        }
        let token = self.next("policy function")?;
        let body = token
            .strip_prefix('@')
            .ok_or_else(|| AgentError::Parse(format!("expected @function, got {}", token)))?;
        let (kind, channel) = body
            .rsplit_once('.')
            .ok_or_else(|| AgentError::Parse(format!("bad function name {}", body)))?;
        let mut filters = Vec::new();
        while self.peek() == Some(",") {
            self.advance();
            filters.push(self.filter()?);
        }
        Ok(PermissionRule {
            principal,
            kind: kind.to_string(),
            channel: channel.to_string(),
            filters,
        })
    }

    fn value(&mut self) -> Result<Value> {
        let token = self.next("value")?.to_string();
        // Quoted literal from the UI.
        if let Some(body) = token.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            return Ok(Value::String(body.to_string()));
        }
        if token == "true" || token == "false" {
            return Ok(Value::Bool(token == "true"));
        }
        if let Ok(n) = token.parse::<f64>() {
            return Ok(Value::Number(n));
        }
        if is_entity_placeholder(&token) {
            return self.resolve_entity(&token);
        }
        if let Some(name) = token.strip_prefix("$context.location.") {
            return Ok(Value::Location(Location::Relative(name.to_string())));
        }
        // Bare word: raw string answer.
        Ok(Value::String(token))
    }

    fn resolve_entity(&self, token: &str) -> Result<Value> {
        let raw = self
            .entities
            .get(token)
            .ok_or_else(|| AgentError::Parse(format!("unresolved entity {}", token)))?;
        let family = token.rsplit_once('_').map(|(f, _)| f).unwrap_or(token);
        let value = match family {
            "QUOTED_STRING" | "HASHTAG" | "URL" => {
                Value::String(raw.as_str().unwrap_or_default().to_string())
            }
            "NUMBER" => Value::Number(raw.as_f64().unwrap_or_default()),
            "USERNAME" => Value::Entity {
                value: raw.as_str().unwrap_or_default().to_string(),
                kind: "tt:username".to_string(),
                display: None,
            },
            "PHONE_NUMBER" => Value::Contact {
                value: raw.as_str().unwrap_or_default().to_string(),
                category: ContactCategory::PhoneNumber,
                display: None,
            },
            "EMAIL_ADDRESS" => Value::Contact {
                value: raw.as_str().unwrap_or_default().to_string(),
                category: ContactCategory::EmailAddress,
                display: None,
            },
            "LOCATION" => Value::Location(Location::Absolute {
                latitude: raw.get("latitude").and_then(|v| v.as_f64()).unwrap_or_default(),
                longitude: raw.get("longitude").and_then(|v| v.as_f64()).unwrap_or_default(),
                display: raw.get("display").and_then(|v| v.as_str()).map(String::from),
            }),
            "TIME" => Value::Time {
                hour: raw.get("hour").and_then(|v| v.as_u64()).unwrap_or_default() as u8,
                minute: raw.get("minute").and_then(|v| v.as_u64()).unwrap_or_default() as u8,
            },
            "DATE" => Value::Date(raw.as_str().unwrap_or_default().to_string()),
            "GENERIC_ENTITY" => Value::Entity {
                value: raw.get("value").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                kind: raw.get("type").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                display: raw.get("display").and_then(|v| v.as_str()).map(String::from),
            },
            other => {
                return Err(AgentError::Parse(format!("unknown entity family {}", other)))
            }
        };
        Ok(value)
    }

    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(|s| s.as_str())
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn next(&mut self, what: &str) -> Result<&'a str> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| AgentError::Parse(format!("expected {}, got end of input", what)))?;
        self.pos += 1;
        Ok(token.as_str())
    }

    fn expect(&mut self, token: &str) -> Result<()> {
        let got = self.next(token)?;
        if got == token {
            Ok(())
        } else {
            Err(AgentError::Parse(format!("expected {}, got {}", token, got)))
        }
    }

    fn unexpected(&self, what: &str, got: Option<&str>) -> AgentError {
        AgentError::Parse(format!(
            "expected {}, got {}",
            what,
            got.unwrap_or("end of input")
        ))
    }
}

enum ChainElement {
    Invocation(Invocation),
    Notify,
    Return,
}

/// `QUOTED_STRING_0`, `USERNAME_2`, `GENERIC_ENTITY_1`: an uppercase family
/// name with a numeric suffix.
fn is_entity_placeholder(token: &str) -> bool {
    match token.rsplit_once('_') {
        Some((family, index)) => {
            !family.is_empty()
                && !index.is_empty()
                && index.chars().all(|c| c.is_ascii_digit())
                && family.chars().all(|c| c.is_ascii_uppercase() || c == '_')
        }
        None => false,
    }
}

pub fn tokens(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}
