use super::ast::{ParamType, Program, Value};
use crate::agent::context::SubDialogue;
use crate::agent::error::Result;
use crate::services::catalog::{ArgSchema, FunctionSchema};
use std::collections::HashMap;
use tracing::debug;

/// What `prepare_program` found out about the program.
#[derive(Debug, Clone, PartialEq)]
pub enum Prepared {
    Ready,
    /// The skill repository does not know this function.
    UnknownFunction { kind: String, channel: String },
    /// The kind exists but the user has no configured device for it.
    Unconfigured { kind: String },
}

/// Fill every slot of the program: resolve devices, elicit undefined
/// required inputs in declared order, and bind action inputs to upstream
/// outputs where the types line up.
///
/// Device choices are remembered for the duration of the call, so two
/// invocations on the same kind use the same device without asking twice.
pub async fn prepare_program(dlg: &mut SubDialogue<'_>, program: &mut Program) -> Result<Prepared> {
    let mut device_memory: HashMap<String, String> = HashMap::new();

    for rule in &mut program.rules {
        // Outputs of the data source feeding the invocation currently being
        // filled. Queries see the previous query; the action sees the last.
        let mut upstream: Vec<ArgSchema> = Vec::new();

        for invocation in rule.invocations_mut() {
            let kind = invocation.selector.kind.clone();
            let channel = invocation.channel.clone();
            let schema = match dlg.services.catalog.function_schema(&kind, &channel).await {
                Some(schema) => schema,
                None => return Ok(Prepared::UnknownFunction { kind, channel }),
            };

            // Device resolution.
            if invocation.selector.id.is_none() && invocation.selector.principal.is_none() {
                if let Some(id) = device_memory.get(&kind) {
                    invocation.selector.id = Some(id.clone());
                } else {
                    match choose_device(dlg, &kind).await? {
                        DeviceOutcome::Chosen(id) => {
                            device_memory.insert(kind.clone(), id.clone());
                            invocation.selector.id = Some(id);
                        }
                        DeviceOutcome::NoDeviceNeeded => {}
                        DeviceOutcome::Unconfigured => {
                            return Ok(Prepared::Unconfigured { kind })
                        }
                    }
                }
            }

            // Slot elicitation, in the schema's declared order.
            for arg in schema.args.iter().filter(|a| a.is_input && a.required) {
                let defined = invocation.param(&arg.name).map(Value::is_defined).unwrap_or(false);
                if defined {
                    continue;
                }
                let value = fill_slot(dlg, &schema, arg, &upstream).await?;
                invocation.set_param(&arg.name, value);
            }

            if matches!(schema.ftype, crate::services::catalog::FunctionType::Query)
                || schema.monitorable
            {
                upstream = schema.out_params().cloned().collect();
            }
        }
    }
    Ok(Prepared::Ready)
}

enum DeviceOutcome {
    Chosen(String),
    NoDeviceNeeded,
    Unconfigured,
}

async fn choose_device(dlg: &mut SubDialogue<'_>, kind: &str) -> Result<DeviceOutcome> {
    let devices = dlg.services.catalog.devices_of_kind(kind);
    match devices.len() {
        0 => {
            // A kind with a factory needs configuration first; one without
            // is a pure service and runs deviceless.
            if dlg.services.catalog.device_factory(kind).await.is_some() {
                Ok(DeviceOutcome::Unconfigured)
            } else {
                Ok(DeviceOutcome::NoDeviceNeeded)
            }
        }
        1 => Ok(DeviceOutcome::Chosen(devices[0].id.clone())),
        _ => {
            let titles: Vec<String> = devices.iter().map(|d| d.name.clone()).collect();
            let prompt = format!(
                "You have multiple {} devices. Which one do you want to use?",
                pretty_kind(kind)
            );
            let index = dlg.ask_choices(&prompt, &titles).await?;
            debug!(kind, device = %devices[index].id, "device disambiguated");
            Ok(DeviceOutcome::Chosen(devices[index].id.clone()))
        }
    }
}

/// Elicit one input slot. When the invocation is fed by a query, upstream
/// outputs with a compatible type are offered first: a single candidate
/// binds silently, several become a numbered choice with a trailing
/// "None of above".
async fn fill_slot(
    dlg: &mut SubDialogue<'_>,
    schema: &FunctionSchema,
    arg: &ArgSchema,
    upstream: &[ArgSchema],
) -> Result<Value> {
    let compatible: Vec<&ArgSchema> =
        upstream.iter().filter(|out| type_compatible(&arg.ptype, &out.ptype)).collect();

    match compatible.len() {
        0 => dlg.ask_question(&schema.kind, &arg.ptype, &arg.question).await,
        1 => Ok(Value::VarRef(compatible[0].name.clone())),
        _ => {
            let mut titles: Vec<String> =
                compatible.iter().map(|out| format!("Use the {}", out.name.replace('_', " "))).collect();
            titles.push("None of above".to_string());
            let prompt = format!("What should I use as the {}?", arg.name.replace('_', " "));
            let index = dlg.ask_choices(&prompt, &titles).await?;
            if index < compatible.len() {
                Ok(Value::VarRef(compatible[index].name.clone()))
            } else {
                dlg.ask_question(&schema.kind, &arg.ptype, &arg.question).await
            }
        }
    }
}

/// Assignability between an input slot and an upstream output.
fn type_compatible(target: &ParamType, source: &ParamType) -> bool {
    use ParamType::*;
    match target {
        String => matches!(source, String | Url | Picture | Username | Hashtag),
        Picture => matches!(source, Picture | Url),
        Url => matches!(source, Url | Picture),
        Number => matches!(source, Number),
        Measure(unit) => matches!(source, Measure(u) if u == unit),
        Entity(kind) => matches!(source, Entity(k) if k == kind),
        Any => true,
        other => other == source,
    }
}

fn pretty_kind(kind: &str) -> String {
    kind.rsplit('.').next().unwrap_or(kind).to_string()
}
