use serde_json::Value;

/// Substitute `${name}` placeholders in a template from a JSON object.
///
/// Selector forms:
///   `${count:plural:one=comic|other=comics}`  -- plural by numeric value
///   `${status:select:ok=done|err=failed|other=unknown}` -- choice on string
///   `${temp:temperature:C}` -- unit conversion from the stored Celsius value
///
/// Unknown placeholders render empty; the output is deterministic on
/// identical inputs.
pub fn interpolate(template: &str, args: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&render_placeholder(&after[..end], args));
                rest = &after[end + 1..];
            }
            None => {
                // Unterminated placeholder: emit verbatim.
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_placeholder(spec: &str, args: &Value) -> String {
    let mut parts = spec.splitn(3, ':');
    let name = parts.next().unwrap_or_default();
    let selector = parts.next();
    let detail = parts.next();

    let value = lookup(args, name);
    match selector {
        None => value.map(plain).unwrap_or_default(),
        Some("plural") => {
            let n = value.and_then(|v| v.as_f64()).unwrap_or(0.0);
            let table = parse_choices(detail.unwrap_or_default());
            let key = if (n - 1.0).abs() < f64::EPSILON { "one" } else { "other" };
            pick(&table, key).replace("#", &trim_number(n))
        }
        Some("select") => {
            let key = value.map(plain).unwrap_or_default();
            let table = parse_choices(detail.unwrap_or_default());
            pick(&table, &key)
        }
        Some("temperature") => {
            let celsius = value.and_then(|v| v.as_f64()).unwrap_or(0.0);
            match detail {
                Some("F") => format!("{} F", trim_number(celsius * 9.0 / 5.0 + 32.0)),
                _ => format!("{} C", trim_number(celsius)),
            }
        }
        Some(_) => value.map(plain).unwrap_or_default(),
    }
}

fn lookup<'a>(args: &'a Value, name: &str) -> Option<&'a Value> {
    match args {
        Value::Object(map) => map.get(name),
        _ => None,
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_f64()
            .map(trim_number)
            .unwrap_or_else(|| n.to_string()),
        Value::Bool(b) => b.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn trim_number(n: f64) -> String {
    if n.fract() == 0.0 {
        format!("{}", n as i64)
    } else {
        format!("{:.2}", n)
    }
}

fn parse_choices(detail: &str) -> Vec<(String, String)> {
    detail
        .split('|')
        .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

fn pick(table: &[(String, String)], key: &str) -> String {
    table
        .iter()
        .find(|(k, _)| k == key)
        .or_else(|| table.iter().find(|(k, _)| k == "other" || k == "default"))
        .map(|(_, v)| v.clone())
        .unwrap_or_default()
}
