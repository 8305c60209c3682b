use serde::{Deserialize, Serialize};
use std::fmt;

use crate::agent::types::ValueCategory;

/// A typed parameter or answer value.
///
/// `VarRef` binds an input parameter to an output of the previous primitive
/// in the chain (`caption=link`). `Undefined` marks a slot still to be
/// filled; slot filling walks the program until none remain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Number(f64),
    Bool(bool),
    Measure { value: f64, unit: String },
    Location(Location),
    Time { hour: u8, minute: u8 },
    Date(String),
    Entity { value: String, kind: String, display: Option<String> },
    Contact { value: String, category: ContactCategory, display: Option<String> },
    VarRef(String),
    Undefined,
}

impl Value {
    /// Rendering used in generated code and in confirmation prose when the
    /// schema has no display template for the parameter.
    pub fn to_code(&self) -> String {
        match self {
            Value::String(s) => format!("\"{}\"", s),
            Value::Number(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            Value::Bool(b) => b.to_string(),
            Value::Measure { value, unit } => format!("{}{}", value, unit),
            Value::Location(loc) => loc.to_code(),
            Value::Time { hour, minute } => format!("makeTime({},{})", hour, minute),
            Value::Date(d) => format!("makeDate({})", d),
            Value::Entity { value, kind, .. } => format!("\"{}\"^^{}", value, kind),
            Value::Contact { value, .. } => format!("\"{}\"", value),
            Value::VarRef(name) => name.clone(),
            Value::Undefined => "$undefined".to_string(),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Value::String(s) => s.clone(),
            Value::Entity { display: Some(d), .. } | Value::Contact { display: Some(d), .. } => {
                d.clone()
            }
            Value::Entity { value, .. } | Value::Contact { value, .. } => value.clone(),
            Value::Location(loc) => loc.display(),
            Value::VarRef(name) => name.replace('_', " "),
            other => other.to_code(),
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Value::Undefined)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactCategory {
    PhoneNumber,
    EmailAddress,
    Account,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Location {
    Absolute { latitude: f64, longitude: f64, display: Option<String> },
    /// `home`, `work` or `current_location`, resolved against user context.
    Relative(String),
}

impl Location {
    pub fn to_code(&self) -> String {
        match self {
            Location::Absolute { latitude, longitude, .. } => {
                format!("makeLocation({},{})", latitude, longitude)
            }
            Location::Relative(name) => format!("$context.location.{}", name),
        }
    }

    pub fn display(&self) -> String {
        match self {
            Location::Absolute { display: Some(d), .. } => d.clone(),
            Location::Absolute { latitude, longitude, .. } => {
                format!("[{:.3}, {:.3}]", latitude, longitude)
            }
            Location::Relative(name) => name.replace('_', " "),
        }
    }
}

/// Parameter types as declared by skill schemas. Drives both type checking
/// of answers and the question category used during slot filling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Location,
    Date,
    Time,
    PhoneNumber,
    EmailAddress,
    Picture,
    Url,
    Username,
    Hashtag,
    Contact,
    Measure(String),
    Entity(String),
    Any,
}

impl ParamType {
    pub fn ask_category(&self) -> ValueCategory {
        match self {
            ParamType::String | ParamType::Picture | ParamType::Url | ParamType::Hashtag => {
                ValueCategory::RawString
            }
            ParamType::Number | ParamType::Measure(_) => ValueCategory::Number,
            ParamType::Boolean => ValueCategory::YesNo,
            ParamType::Location => ValueCategory::Location,
            ParamType::Date => ValueCategory::Date,
            ParamType::Time => ValueCategory::Time,
            ParamType::PhoneNumber => ValueCategory::PhoneNumber,
            ParamType::EmailAddress => ValueCategory::EmailAddress,
            ParamType::Username | ParamType::Contact => ValueCategory::Contact,
            ParamType::Entity(_) | ParamType::Any => ValueCategory::Generic,
        }
    }
}

/// Which concrete device of a kind an invocation runs on. `id` is filled by
/// disambiguation; `principal` appears on remote programs only.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceSelector {
    pub kind: String,
    pub id: Option<String>,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBinding {
    pub name: String,
    pub value: Value,
}

/// One primitive call: `@com.twitter(id="twitter-foo").post(status="lol")`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub selector: DeviceSelector,
    pub channel: String,
    pub params: Vec<ParamBinding>,
}

impl Invocation {
    pub fn new(kind: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            selector: DeviceSelector { kind: kind.into(), id: None, principal: None },
            channel: channel.into(),
            params: Vec::new(),
        }
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn set_param(&mut self, name: &str, value: Value) {
        if let Some(binding) = self.params.iter_mut().find(|p| p.name == name) {
            binding.value = value;
        } else {
            self.params.push(ParamBinding { name: name.to_string(), value });
        }
    }

    pub fn to_code(&self) -> String {
        let mut out = format!("@{}", self.selector.kind);
        if let Some(id) = &self.selector.id {
            out.push_str(&format!("(id=\"{}\")", id));
        }
        out.push('.');
        out.push_str(&self.channel);
        out.push('(');
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}={}", p.name, p.value.to_code()))
            .collect();
        out.push_str(&params.join(", "));
        out.push(')');
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Contains,
    GreaterEq,
    LessEq,
    Greater,
    Less,
}

impl FilterOp {
    pub fn symbol(self) -> &'static str {
        match self {
            FilterOp::Eq => "==",
            FilterOp::Contains => "=~",
            FilterOp::GreaterEq => ">=",
            FilterOp::LessEq => "<=",
            FilterOp::Greater => ">",
            FilterOp::Less => "<",
        }
    }

    pub fn parse(symbol: &str) -> Option<Self> {
        match symbol {
            "==" | "=" | "is" => Some(FilterOp::Eq),
            "=~" | "contains" => Some(FilterOp::Contains),
            ">=" => Some(FilterOp::GreaterEq),
            "<=" => Some(FilterOp::LessEq),
            ">" => Some(FilterOp::Greater),
            "<" => Some(FilterOp::Less),
            _ => None,
        }
    }
}

/// A predicate on an output parameter. Filters compose conjunctively, in the
/// order the user supplied them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub param: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn to_code(&self) -> String {
        format!("{} {} {}", self.param, self.op.symbol(), self.value.to_code())
    }

    pub fn describe(&self) -> String {
        let verb = match self.op {
            FilterOp::Eq => "is",
            FilterOp::Contains => "contains",
            FilterOp::GreaterEq => "is at least",
            FilterOp::LessEq => "is at most",
            FilterOp::Greater => "is greater than",
            FilterOp::Less => "is less than",
        };
        format!("{} {} {}", self.param.replace('_', " "), verb, self.value.display())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Trigger {
    /// Run once, immediately.
    Now,
    /// Re-run whenever the monitored query's output changes.
    Monitor(Invocation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Present results to the user.
    Notify,
    /// Ship results back to the originating principal of a remote program.
    Return,
    Invoke(Invocation),
}

/// One rule: trigger, query chain, filters on the last data source, action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub trigger: Trigger,
    pub queries: Vec<Invocation>,
    pub filters: Vec<Filter>,
    pub action: Action,
}

impl Rule {
    pub fn to_code(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        match &self.trigger {
            Trigger::Now => parts.push("now".to_string()),
            Trigger::Monitor(inv) => {
                let mut source = format!("({})", inv.to_code());
                for f in &self.filters {
                    source.push_str(&format!(", {}", f.to_code()));
                }
                parts.push(source);
            }
        }
        for (i, q) in self.queries.iter().enumerate() {
            let mut code = q.to_code();
            // Filters attach to the last query of a now-rule.
            if matches!(self.trigger, Trigger::Now)
                && i + 1 == self.queries.len()
                && !self.filters.is_empty()
            {
                for f in &self.filters {
                    code.push_str(&format!(", {}", f.to_code()));
                }
            }
            parts.push(code);
        }
        match &self.action {
            Action::Notify => parts.push("notify".to_string()),
            Action::Return => parts.push("return".to_string()),
            Action::Invoke(inv) => parts.push(inv.to_code()),
        }
        parts.join(" => ")
    }

    /// Every invocation of the rule, queries first, action last.
    pub fn invocations_mut(&mut self) -> Vec<&mut Invocation> {
        let mut out = Vec::new();
        if let Trigger::Monitor(inv) = &mut self.trigger {
            out.push(inv);
        }
        out.extend(self.queries.iter_mut());
        if let Action::Invoke(inv) = &mut self.action {
            out.push(inv);
        }
        out
    }

    pub fn invocations(&self) -> Vec<&Invocation> {
        let mut out = Vec::new();
        if let Trigger::Monitor(inv) = &self.trigger {
            out.push(inv);
        }
        out.extend(self.queries.iter());
        if let Action::Invoke(inv) = &self.action {
            out.push(inv);
        }
        out
    }
}

/// A complete program. `executor` is set when the program is meant to run on
/// another principal; the remote-program pass splits such programs into a
/// local monitor and a remote half.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub executor: Option<Value>,
    pub rules: Vec<Rule>,
}

impl Program {
    pub fn simple(rule: Rule) -> Self {
        Self { executor: None, rules: vec![rule] }
    }

    pub fn to_code(&self) -> String {
        let body: Vec<String> = self.rules.iter().map(|r| r.to_code()).collect();
        match &self.executor {
            Some(principal) => format!("executor = {} : {};", principal.to_code(), body.join("; ")),
            None => format!("{};", body.join("; ")),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.executor.is_some()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_code())
    }
}

/// A permission rule as produced by the consent flow:
/// `source == "principal" : now => @kind.channel, filters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRule {
    pub principal: PrincipalSpec,
    pub kind: String,
    pub channel: String,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrincipalSpec {
    Anyone,
    Exact(String),
}

impl PermissionRule {
    pub fn to_code(&self) -> String {
        let source = match &self.principal {
            PrincipalSpec::Anyone => "true".to_string(),
            PrincipalSpec::Exact(p) => format!("source == \"{}\"", p),
        };
        let mut body = format!("now => @{}.{}", self.kind, self.channel);
        for f in &self.filters {
            body.push_str(&format!(", {}", f.to_code()));
        }
        format!("{} : {};", source, body)
    }
}
