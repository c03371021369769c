//! Variable substitution for planned step parameters.
//!
//! Deliberately not an expression language: a reference is either `{{name}}`
//! or `{{name + N}}` with an integer literal. Anything more belongs in the
//! state machine, not in step templates.

use std::sync::LazyLock;

use anyhow::{Result, bail};
use serde_json::{Map, Value};

static TOKEN_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)(?:\s*\+\s*(-?\d+))?\s*\}\}").unwrap()
});

/// Substitute `{{name}}` references in `input` against `vars`.
///
/// A string that is exactly one reference resolves to the variable's typed
/// value (`{{name + N}}` requires a number and yields a number). Strings with
/// surrounding text interpolate stringified values. Objects and arrays are
/// walked recursively. An unresolved name or non-numeric addition is an
/// error; callers record it and skip the step rather than crash.
pub fn substitute_value(input: &Value, vars: &Map<String, Value>) -> Result<Value> {
    match input {
        Value::String(s) => substitute_string(s, vars),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute_value(item, vars)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(obj) => {
            let mut out = Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.clone(), substitute_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute into a plain string, always yielding a string.
pub fn substitute_str(input: &str, vars: &Map<String, Value>) -> Result<String> {
    match substitute_string(input, vars)? {
        Value::String(s) => Ok(s),
        other => Ok(render_scalar(&other)),
    }
}

fn substitute_string(input: &str, vars: &Map<String, Value>) -> Result<Value> {
    // Whole-string single reference keeps the variable's JSON type.
    if let Some(caps) = TOKEN_RE.captures(input)
        && caps.get(0).map(|m| m.as_str()) == Some(input)
    {
        return resolve(&caps, vars);
    }

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in TOKEN_RE.captures_iter(input) {
        let m = caps.get(0).expect("capture 0 always present");
        out.push_str(&input[last..m.start()]);
        out.push_str(&render_scalar(&resolve(&caps, vars)?));
        last = m.end();
    }
    out.push_str(&input[last..]);
    Ok(Value::String(out))
}

fn resolve(caps: &regex::Captures<'_>, vars: &Map<String, Value>) -> Result<Value> {
    let name = &caps[1];
    let Some(value) = vars.get(name) else {
        bail!("unresolved variable reference: {name}");
    };
    let Some(addend) = caps.get(2) else {
        return Ok(value.clone());
    };
    let addend: i64 = addend
        .as_str()
        .parse()
        .map_err(|_| anyhow::anyhow!("bad integer literal in reference to {name}"))?;
    let Some(base) = value.as_i64() else {
        bail!("variable {name} is not an integer, cannot add {addend}");
    };
    Ok(Value::from(base + addend))
}

fn render_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
