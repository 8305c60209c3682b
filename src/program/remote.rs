use super::ast::{
    Action, Invocation, ParamBinding, Program, Rule, Trigger, Value,
};
use crate::services::catalog::FunctionSchema;

/// The builtin pair that carries data between principals.
const REMOTE_KIND: &str = "org.thingpedia.builtin.thingengine.remote";

/// A return-program split into its two halves.
#[derive(Debug, Clone, PartialEq)]
pub struct LoweredProgram {
    /// Installed here: monitors the receive channel and notifies.
    pub local: Program,
    /// Shipped to the target principal: the original rule with its `return`
    /// replaced by a send back to us.
    pub remote: Program,
}

/// Lower `executor = p : ... => return` into a paired send/receive.
///
/// Deterministic given the program, principals and flow id: the remote half
/// keeps the original computation and ends in a `send` to `self_principal`;
/// the local half monitors the matching `receive` and notifies. The two
/// invocations share `program_id` and flow 0 so the runtime can match them
/// up.
pub fn lower_return(
    program: &Program,
    remote_principal: &str,
    self_principal: &str,
    program_id: &str,
    result_schema: Option<&FunctionSchema>,
) -> LoweredProgram {
    let mut shared_params = vec![
        ParamBinding {
            name: "__principal".to_string(),
            value: Value::Entity {
                value: self_principal.to_string(),
                kind: "tt:contact".to_string(),
                display: None,
            },
        },
        ParamBinding {
            name: "__program_id".to_string(),
            value: Value::Entity {
                value: program_id.to_string(),
                kind: "tt:program_id".to_string(),
                display: None,
            },
        },
        ParamBinding { name: "__flow".to_string(), value: Value::Number(0.0) },
    ];

    // The send forwards every output of the last data source by reference.
    let mut send = Invocation::new(REMOTE_KIND, "send");
    send.params = shared_params.clone();
    if let Some(schema) = result_schema {
        for out in schema.out_params() {
            send.params.push(ParamBinding {
                name: out.name.clone(),
                value: Value::VarRef(out.name.clone()),
            });
        }
    }

    let mut remote_rules = program.rules.clone();
    for rule in &mut remote_rules {
        if rule.action == Action::Return {
            rule.action = Action::Invoke(send.clone());
        }
    }
    let remote = Program {
        executor: Some(Value::Entity {
            value: remote_principal.to_string(),
            kind: "tt:contact".to_string(),
            display: None,
        }),
        rules: remote_rules,
    };

    // Local half: the receive is keyed on the *other* principal.
    shared_params[0].value = Value::Entity {
        value: remote_principal.to_string(),
        kind: "tt:contact".to_string(),
        display: None,
    };
    let mut receive = Invocation::new(REMOTE_KIND, "receive");
    receive.params = shared_params;
    let local = Program {
        executor: None,
        rules: vec![Rule {
            trigger: Trigger::Monitor(receive),
            queries: Vec::new(),
            filters: Vec::new(),
            action: Action::Notify,
        }],
    };

    LoweredProgram { local, remote }
}

/// The function whose outputs flow through the `return`, i.e. the last data
/// source of the first returning rule.
pub fn returning_source(program: &Program) -> Option<(String, String)> {
    for rule in &program.rules {
        if rule.action == Action::Return {
            if let Some(inv) = rule.queries.last() {
                return Some((inv.selector.kind.clone(), inv.channel.clone()));
            }
            if let Trigger::Monitor(inv) = &rule.trigger {
                return Some((inv.selector.kind.clone(), inv.channel.clone()));
            }
        }
    }
    None
}
