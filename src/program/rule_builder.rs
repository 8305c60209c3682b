use super::ast::{Filter, FilterOp, ParamType, Program, Trigger, Value};
use super::parse::{parse_command, ControlCommand, SpecialCommand};
use crate::agent::context::{ChoiceOutcome, SubDialogue};
use crate::agent::error::{AgentError, Result};
use crate::agent::types::{UserInputKind, ValueCategory};
use crate::services::catalog::{ArgSchema, FunctionSchema};
use std::collections::HashMap;
use tracing::warn;

/// Page size of every list in the builder. Kept small so the choice strip
/// stays readable on phone UIs.
const PAGE_SIZE: usize = 5;

/// The guided rule builder behind `special:makerule`.
///
/// Walks category -> skill -> example command, then loops on an
/// add-filter/run-it menu until the user runs or abandons the rule. Back and
/// more are first-class at every level; lists are fetched once per walk and
/// paged without re-querying. Returns `None` when the user backs all the way
/// out.
pub async fn build_rule(dlg: &mut SubDialogue<'_>) -> Result<Option<Program>> {
    let categories = dlg.services.catalog.categories();
    let category_titles: Vec<String> = categories.iter().map(|c| c.name.clone()).collect();
    let mut kinds_cache: HashMap<String, Vec<crate::services::catalog::DeviceInfo>> =
        HashMap::new();
    let mut examples_cache: HashMap<String, Vec<crate::services::catalog::ExampleCommand>> =
        HashMap::new();

    'source: loop {
        let category_idx = match paged_choice(
            dlg,
            "Pick one of the following categories.",
            &category_titles,
        )
        .await?
        {
            PagePick::Item(i) => i,
            PagePick::Back => return Ok(None),
        };
        let category_id = categories[category_idx].id.clone();

        'kind: loop {
            if !kinds_cache.contains_key(&category_id) {
                let kinds = dlg.services.catalog.kinds_in_category(&category_id).await;
                kinds_cache.insert(category_id.clone(), kinds);
            }
            let kinds = &kinds_cache[&category_id];
            if kinds.is_empty() {
                dlg.reply("There is nothing in that category yet.").await;
                continue 'source;
            }
            let kind_titles: Vec<String> = kinds.iter().map(|k| k.name.clone()).collect();
            let kind = match paged_choice(dlg, "Pick a skill.", &kind_titles).await? {
                PagePick::Item(i) => kinds[i].kind.clone(),
                PagePick::Back => continue 'source,
            };

            if !examples_cache.contains_key(&kind) {
                let examples = dlg.services.catalog.examples_for(&kind).await;
                examples_cache.insert(kind.clone(), examples);
            }
            let examples = &examples_cache[&kind];
            if examples.is_empty() {
                dlg.reply("That skill has no commands yet.").await;
                continue 'kind;
            }
            let example_titles: Vec<String> = examples.iter().map(|e| e.label.clone()).collect();
            let example = match paged_choice(dlg, "Pick a command.", &example_titles).await? {
                PagePick::Item(i) => &examples[i],
                PagePick::Back => continue 'kind,
            };

            let mut program = match parse_command(&example.code, &HashMap::new()) {
                Ok(ControlCommand::Program(program)) => program,
                other => {
                    warn!("unusable example command for {}: {:?}", kind, other);
                    dlg.reply("Sorry, that command is not available right now.").await;
                    continue 'kind;
                }
            };

            // The filter menu works on the rule's data source.
            let source = match source_function(&program) {
                Some((kind, channel)) => {
                    dlg.services.catalog.function_schema(&kind, &channel).await
                }
                None => None,
            };

            match filter_menu(dlg, &mut program, source.as_ref()).await? {
                MenuOutcome::Run => return Ok(Some(program)),
                MenuOutcome::Back => continue 'kind,
            }
        }
    }
}

fn source_function(program: &Program) -> Option<(String, String)> {
    let rule = program.rules.first()?;
    match &rule.trigger {
        Trigger::Monitor(inv) => Some((inv.selector.kind.clone(), inv.channel.clone())),
        Trigger::Now => rule
            .queries
            .first()
            .map(|inv| (inv.selector.kind.clone(), inv.channel.clone())),
    }
}

enum MenuOutcome {
    Run,
    Back,
}

/// The add-filter / run-it menu. Accepts the menu choices, direct
/// `bookkeeping filter` tokens from the UI, and back/more navigation.
async fn filter_menu(
    dlg: &mut SubDialogue<'_>,
    program: &mut Program,
    schema: Option<&FunctionSchema>,
) -> Result<MenuOutcome> {
    loop {
        dlg.reply(&format!("Okay, I have this so far: {}", program.to_code())).await;
        dlg.reply_choice(0, "Add a filter").await;
        dlg.reply_choice(1, "Run it").await;
        dlg.session.choices = vec!["Add a filter".to_string(), "Run it".to_string()];
        dlg.session.expecting = Some(ValueCategory::Choice);
        dlg.reply_ask_special(ValueCategory::Choice.ask_special()).await;

        loop {
            let input = dlg.next_command().await?;
            let action = match &input.kind {
                UserInputKind::Parsed { code, entities } => match parse_command(code, entities) {
                    Ok(ControlCommand::Choice(0)) => Some(MenuAction::AddFilter),
                    Ok(ControlCommand::Choice(1)) => Some(MenuAction::Run),
                    Ok(ControlCommand::Filter(filters)) => Some(MenuAction::Direct(filters)),
                    Ok(ControlCommand::Special(SpecialCommand::Back)) => {
                        Some(MenuAction::Back)
                    }
                    Ok(ControlCommand::Special(SpecialCommand::Nevermind)) => {
                        return Err(dlg.cancel_with_apology().await)
                    }
                    Ok(ControlCommand::Special(SpecialCommand::Stop)) => {
                        return Err(AgentError::Cancelled)
                    }
                    _ => None,
                },
                UserInputKind::Command { utterance } => {
                    let u = utterance.trim().to_lowercase();
                    if u == "add a filter" {
                        Some(MenuAction::AddFilter)
                    } else if u == "run it" {
                        Some(MenuAction::Run)
                    } else {
                        None
                    }
                }
                UserInputKind::Program { .. } => None,
            };

            match action {
                Some(MenuAction::Run) => {
                    dlg.session.expecting = None;
                    dlg.session.choices.clear();
                    return Ok(MenuOutcome::Run);
                }
                Some(MenuAction::Back) => {
                    dlg.session.expecting = None;
                    dlg.session.choices.clear();
                    return Ok(MenuOutcome::Back);
                }
                Some(MenuAction::AddFilter) => {
                    dlg.session.expecting = None;
                    if let Some(filter) = build_filter(dlg, schema).await? {
                        program.rules[0].filters.push(filter);
                    }
                    break;
                }
                Some(MenuAction::Direct(filters)) => {
                    dlg.session.expecting = None;
                    program.rules[0].filters.extend(filters);
                    break;
                }
                None => {
                    dlg.reply("Could you choose one of the following?").await;
                    dlg.reply_choice(0, "Add a filter").await;
                    dlg.reply_choice(1, "Run it").await;
                    dlg.reply_ask_special(ValueCategory::Choice.ask_special()).await;
                }
            }
        }
    }
}

enum MenuAction {
    AddFilter,
    Run,
    Back,
    Direct(Vec<Filter>),
}

/// Guided filter construction: output parameter, operator, value.
async fn build_filter(
    dlg: &mut SubDialogue<'_>,
    schema: Option<&FunctionSchema>,
) -> Result<Option<Filter>> {
    let Some(schema) = schema else {
        dlg.reply("There is nothing to filter on.").await;
        return Ok(None);
    };
    let outs: Vec<&ArgSchema> = schema.out_params().collect();
    if outs.is_empty() {
        dlg.reply("There is nothing to filter on.").await;
        return Ok(None);
    }

    let titles: Vec<String> = outs.iter().map(|o| o.name.replace('_', " ")).collect();
    let param_idx = dlg.ask_choices("Pick the value to filter on.", &titles).await?;
    let out = outs[param_idx];

    let ops: Vec<(FilterOp, &str)> = match out.ptype {
        ParamType::Number | ParamType::Measure(_) => vec![
            (FilterOp::Eq, "is equal to"),
            (FilterOp::GreaterEq, "is at least"),
            (FilterOp::LessEq, "is at most"),
        ],
        ParamType::String => vec![(FilterOp::Contains, "contains"), (FilterOp::Eq, "is exactly")],
        _ => vec![(FilterOp::Eq, "is")],
    };
    let op = if ops.len() == 1 {
        ops[0].0
    } else {
        let op_titles: Vec<String> = ops.iter().map(|(_, label)| label.to_string()).collect();
        let op_idx = dlg.ask_choices("How do you want to filter?", &op_titles).await?;
        ops[op_idx].0
    };

    let value = dlg
        .ask_question(&schema.kind, &out.ptype, &format!("What value should the {} be compared against?", out.name.replace('_', " ")))
        .await?;
    // Raw answers to non-string parameters arrive as strings; keep them as
    // typed values where the parse is obvious.
    let value = match (&out.ptype, value) {
        (ParamType::Number, Value::String(s)) => {
            s.parse::<f64>().map(Value::Number).unwrap_or(Value::String(s))
        }
        (_, v) => v,
    };

    Ok(Some(Filter { param: out.name.clone(), op, value }))
}

enum PagePick {
    Item(usize),
    Back,
}

/// Deterministic pagination: blocks of `PAGE_SIZE` data choices, then
/// "More..." while further pages exist, then "Back". Titles are fetched
/// once by the caller; paging never re-queries.
async fn paged_choice(
    dlg: &mut SubDialogue<'_>,
    prompt: &str,
    titles: &[String],
) -> Result<PagePick> {
    let mut page = 0usize;
    loop {
        let start = page * PAGE_SIZE;
        let end = (start + PAGE_SIZE).min(titles.len());
        let mut shown: Vec<String> = titles[start..end].to_vec();
        let data_len = shown.len();
        let has_more = end < titles.len();
        if has_more {
            shown.push("More\u{2026}".to_string());
        }
        shown.push("Back".to_string());

        match dlg.ask_choices_nav(prompt, &shown).await? {
            ChoiceOutcome::Index(i) if i < data_len => return Ok(PagePick::Item(start + i)),
            ChoiceOutcome::Index(i) if has_more && i == data_len => page += 1,
            ChoiceOutcome::Index(_) | ChoiceOutcome::Back => {
                if page > 0 {
                    page -= 1;
                } else {
                    return Ok(PagePick::Back);
                }
            }
            ChoiceOutcome::More => {
                if has_more {
                    page += 1;
                }
            }
        }
    }
}
