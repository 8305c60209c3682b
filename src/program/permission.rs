use super::ast::{Filter, PermissionRule, PrincipalSpec, Program, Trigger};
use super::parse::{parse_command, ControlCommand, SpecialCommand};
use crate::agent::context::SubDialogue;
use crate::agent::error::{AgentError, Result};
use crate::agent::types::{UserInputKind, ValueCategory};
use crate::services::catalog::ArgSchema;
use tracing::info;

/// The five consent options, in card order.
const CONSENT_CHOICES: [&str; 5] = [
    "Yes this time",
    "Always from anybody",
    "Always from this person",
    "No",
    "Only if...",
];

/// Present the consent card for a program another principal wants to run
/// here.
///
/// Returns the granted program, or `None` on refusal. "Only if" routes into
/// the filter builder and a yes/no confirmation; a rejected confirmation
/// loops back to the consent card. Granted "always" decisions install a
/// permission rule through the executor before returning.
pub async fn ask_for_permission(
    dlg: &mut SubDialogue<'_>,
    principal: &str,
    identity: &str,
    program: &Program,
    description: &str,
) -> Result<Option<Program>> {
    let (kind, channel, outs) = permission_target(dlg, program).await?;

    loop {
        let prompt = format!("{} would like to {}.", identity, description);
        match consent_choice(dlg, &prompt).await? {
            Consent::YesOnce => {
                info!(principal, "permission granted once");
                return Ok(Some(program.clone()));
            }
            Consent::AlwaysFromAnybody => {
                let rule = PermissionRule {
                    principal: PrincipalSpec::Anyone,
                    kind: kind.clone(),
                    channel: channel.clone(),
                    filters: Vec::new(),
                };
                install(dlg, &rule).await?;
                return Ok(Some(program.clone()));
            }
            Consent::AlwaysFromPrincipal => {
                let rule = PermissionRule {
                    principal: PrincipalSpec::Exact(principal.to_string()),
                    kind: kind.clone(),
                    channel: channel.clone(),
                    filters: Vec::new(),
                };
                install(dlg, &rule).await?;
                return Ok(Some(program.clone()));
            }
            Consent::No => {
                info!(principal, "permission refused");
                return Ok(None);
            }
            Consent::OnlyIf => {
                if outs.is_empty() {
                    dlg.reply("There is nothing to restrict on.").await;
                    continue;
                }
                let filters = ask_filters(dlg, &outs).await?;
                let rule = PermissionRule {
                    principal: PrincipalSpec::Exact(principal.to_string()),
                    kind: kind.clone(),
                    channel: channel.clone(),
                    filters,
                };
                let described: Vec<String> =
                    rule.filters.iter().map(|f| f.describe()).collect();
                let confirmed = dlg
                    .ask_yes_no(&format!(
                        "Okay, so I will allow {} to do this only if {}. Is that right?",
                        identity,
                        described.join(" and ")
                    ))
                    .await?;
                if confirmed {
                    install(dlg, &rule).await?;
                    return Ok(Some(program.clone()));
                }
                // Rejected confirmation loops back to the consent card.
            }
        }
    }
}

enum Consent {
    YesOnce,
    AlwaysFromAnybody,
    AlwaysFromPrincipal,
    No,
    OnlyIf,
}

/// The card itself. Accepts the numbered choices plus the yes/no/maybe
/// specials: yes is yes-once, no is refusal, maybe is only-if.
async fn consent_choice(dlg: &mut SubDialogue<'_>, prompt: &str) -> Result<Consent> {
    dlg.reply(prompt).await;
    for (index, title) in CONSENT_CHOICES.iter().enumerate() {
        dlg.reply_choice(index, title).await;
    }
    dlg.session.choices = CONSENT_CHOICES.iter().map(|s| s.to_string()).collect();
    dlg.session.expecting = Some(ValueCategory::Choice);
    dlg.reply_ask_special(ValueCategory::Choice.ask_special()).await;

    loop {
        let input = dlg.next_command().await?;
        let consent = match &input.kind {
            UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                Ok(ControlCommand::Choice(0)) => Some(Consent::YesOnce),
                Ok(ControlCommand::Choice(1)) => Some(Consent::AlwaysFromAnybody),
                Ok(ControlCommand::Choice(2)) => Some(Consent::AlwaysFromPrincipal),
                Ok(ControlCommand::Choice(3)) => Some(Consent::No),
                Ok(ControlCommand::Choice(4)) => Some(Consent::OnlyIf),
                Ok(ControlCommand::Special(SpecialCommand::Yes)) => Some(Consent::YesOnce),
                Ok(ControlCommand::Special(SpecialCommand::No)) => Some(Consent::No),
                Ok(ControlCommand::Special(SpecialCommand::Maybe)) => Some(Consent::OnlyIf),
                Ok(ControlCommand::Special(SpecialCommand::Nevermind)) => {
                    return Err(dlg.cancel_with_apology().await)
                }
                Ok(ControlCommand::Special(SpecialCommand::Stop)) => {
                    return Err(AgentError::Cancelled)
                }
                _ => None,
            },
            UserInputKind::Command { utterance } => match utterance.trim().to_lowercase().as_str()
            {
                "yes" => Some(Consent::YesOnce),
                "no" => Some(Consent::No),
                "maybe" | "only if" => Some(Consent::OnlyIf),
                _ => None,
            },
            UserInputKind::Program { .. } => None,
        };
        match consent {
            Some(consent) => {
                dlg.session.expecting = None;
                dlg.session.choices.clear();
                return Ok(consent);
            }
            None => {
                dlg.reply("Could you choose one of the following?").await;
                for (index, title) in CONSENT_CHOICES.iter().enumerate() {
                    dlg.reply_choice(index, title).await;
                }
                dlg.reply_ask_special(ValueCategory::Choice.ask_special()).await;
            }
        }
    }
}

/// The function the permission applies to: the first primitive of the
/// program, with its output parameters for the filter builder.
async fn permission_target(
    dlg: &mut SubDialogue<'_>,
    program: &Program,
) -> Result<(String, String, Vec<ArgSchema>)> {
    let rule = program
        .rules
        .first()
        .ok_or_else(|| AgentError::Unexpected("empty program in permission request".to_string()))?;
    let inv = match &rule.trigger {
        Trigger::Monitor(inv) => inv,
        Trigger::Now => rule.invocations().into_iter().next().ok_or_else(|| {
            AgentError::Unexpected("permission request with no invocation".to_string())
        })?,
    };
    let outs = match dlg
        .services
        .catalog
        .function_schema(&inv.selector.kind, &inv.channel)
        .await
    {
        Some(schema) => schema.out_params().cloned().collect(),
        None => Vec::new(),
    };
    Ok((inv.selector.kind.clone(), inv.channel.clone(), outs))
}

/// One only-if condition input. Direct filter tokens may carry several
/// `and`-joined conditions; typed input goes through the guided
/// parameter/value walk. Order of composition is the order supplied.
async fn ask_filters(dlg: &mut SubDialogue<'_>, outs: &[ArgSchema]) -> Result<Vec<Filter>> {
    dlg.reply("Add a condition on the data.").await;
    dlg.session.expecting = Some(ValueCategory::Generic);
    dlg.reply_ask_special(ValueCategory::Generic.ask_special()).await;

    loop {
        let input = dlg.next_command().await?;
        match &input.kind {
            UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                Ok(ControlCommand::Filter(filters)) => {
                    dlg.session.expecting = None;
                    return Ok(filters);
                }
                Ok(ControlCommand::Special(SpecialCommand::Nevermind)) => {
                    return Err(dlg.cancel_with_apology().await)
                }
                Ok(ControlCommand::Special(SpecialCommand::Stop)) => {
                    return Err(AgentError::Cancelled)
                }
                _ => {}
            },
            _ => {
                dlg.session.expecting = None;
                let titles: Vec<String> = outs.iter().map(|o| o.name.replace('_', " ")).collect();
                let idx = dlg.ask_choices("Pick the value to restrict.", &titles).await?;
                let out = &outs[idx];
                let op = match out.ptype {
                    super::ast::ParamType::String => super::ast::FilterOp::Contains,
                    _ => super::ast::FilterOp::Eq,
                };
                let value = dlg
                    .ask_question(
                        "permission",
                        &out.ptype,
                        &format!("What should the {} be compared against?", out.name.replace('_', " ")),
                    )
                    .await?;
                return Ok(vec![Filter { param: out.name.clone(), op, value }]);
            }
        }
        dlg.reply("Add a condition on the data.").await;
        dlg.reply_ask_special(ValueCategory::Generic.ask_special()).await;
    }
}

async fn install(dlg: &mut SubDialogue<'_>, rule: &PermissionRule) -> Result<()> {
    dlg.services
        .executor
        .add_permission(rule)
        .await
        .map_err(|e| AgentError::ServiceUnavailable(e.to_string()))?;
    info!(rule = %rule.to_code(), "permission rule installed");
    Ok(())
}
