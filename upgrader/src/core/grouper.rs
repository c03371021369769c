//! Deterministic bucketing of compiler diagnostics into fix units.
//!
//! Same message array in, same groups out, byte for byte. Ordering is the
//! contract: groups sort by count descending, ties keep first-seen order,
//! and the FSM processes them strictly in that order.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{Diagnostic, ErrorGroup, GroupStatus, Level, TestGroup};

/// Default cap on diagnostics retained per group.
pub const DEFAULT_MAX_PER_GROUP: usize = 10;

static BACKTICK_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"`([^`]+)`").unwrap());

/// Extract the grouping symbol from a diagnostic message.
///
/// Takes the first backtick-delimited token; fully qualified paths collapse
/// to their final `::` segment. Messages without backticks get `"unknown"`.
pub fn extract_symbol(message: &str) -> String {
    match BACKTICK_RE.captures(message) {
        Some(caps) => {
            let token = &caps[1];
            match token.rsplit("::").next() {
                Some(last) if !last.is_empty() => last.to_string(),
                _ => token.to_string(),
            }
        }
        None => "unknown".to_string(),
    }
}

/// Convert retained compiler-message objects into `Diagnostic`s, keeping
/// only error-level entries.
///
/// Accepts the inner `message` object of a cargo compiler-message record:
/// `code` may be an object with a `code` field, a bare string, or null;
/// location comes from the first primary span when present.
pub fn diagnostics_from_messages(messages: &[Value]) -> Vec<Diagnostic> {
    let mut out = Vec::new();
    for msg in messages {
        let raw_level = msg.get("level").and_then(Value::as_str).unwrap_or("");
        let Some(level) = Level::from_raw(raw_level) else {
            continue;
        };
        if level != Level::Error {
            continue;
        }
        let message = msg
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let code = match msg.get("code") {
            Some(Value::Object(obj)) => obj
                .get("code")
                .and_then(Value::as_str)
                .map(str::to_string),
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        let primary = msg
            .get("spans")
            .and_then(Value::as_array)
            .and_then(|spans| {
                spans
                    .iter()
                    .find(|s| s.get("is_primary").and_then(Value::as_bool) == Some(true))
                    .or_else(|| spans.first())
            });
        let file = primary
            .and_then(|s| s.get("file_name"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let line = primary
            .and_then(|s| s.get("line_start"))
            .and_then(Value::as_u64);
        let symbol = extract_symbol(&message);
        out.push(Diagnostic {
            message,
            code,
            level,
            file,
            line,
            symbol,
        });
    }
    out
}

/// Grouper output stored into `execution_context.variables` by the parse step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrouperOutput {
    pub total_errors: usize,
    pub total_groups: usize,
    pub error_groups: Vec<ErrorGroup>,
}

/// Bucket diagnostics by `(code, symbol)` and order the buckets.
///
/// Each bucket retains at most `max_per_group` diagnostics; `count` is the
/// retained number, so dropped extras resurface on the next check pass.
/// Group ids are assigned after sorting, so equal inputs yield equal ids.
pub fn group(diagnostics: &[Diagnostic], max_per_group: usize) -> GrouperOutput {
    struct Bucket {
        error_code: String,
        symbol: String,
        errors: Vec<Diagnostic>,
    }

    let mut order: Vec<(String, String)> = Vec::new();
    let mut buckets: Vec<Bucket> = Vec::new();

    for diag in diagnostics {
        let code = diag.code.clone().unwrap_or_else(|| "unknown".to_string());
        let key = (code.clone(), diag.symbol.clone());
        let idx = match order.iter().position(|k| *k == key) {
            Some(idx) => idx,
            None => {
                order.push(key);
                buckets.push(Bucket {
                    error_code: code,
                    symbol: diag.symbol.clone(),
                    errors: Vec::new(),
                });
                buckets.len() - 1
            }
        };
        if buckets[idx].errors.len() < max_per_group {
            buckets[idx].errors.push(diag.clone());
        }
    }

    let total_errors = diagnostics.len();

    // Stable sort preserves first-seen order among equal counts.
    buckets.sort_by(|a, b| b.errors.len().cmp(&a.errors.len()));

    let error_groups: Vec<ErrorGroup> = buckets
        .into_iter()
        .enumerate()
        .map(|(ordinal, bucket)| ErrorGroup {
            id: format!(
                "{}-{}-{}",
                bucket.error_code,
                sanitize_id(&bucket.symbol),
                ordinal + 1
            ),
            error_code: bucket.error_code,
            symbol: bucket.symbol,
            count: bucket.errors.len(),
            errors: bucket.errors,
            status: GroupStatus::Pending,
        })
        .collect();

    GrouperOutput {
        total_errors,
        total_groups: error_groups.len(),
        error_groups,
    }
}

/// Bucket failing test names by module path (everything before the last
/// `::`), in first-seen order. Tests without a module land under `"crate"`.
pub fn group_test_failures(failures: &[String]) -> Vec<TestGroup> {
    let mut groups: Vec<TestGroup> = Vec::new();
    for name in failures {
        let module = match name.rsplit_once("::") {
            Some((module, _)) if !module.is_empty() => module.to_string(),
            _ => "crate".to_string(),
        };
        match groups.iter_mut().find(|g| g.module == module) {
            Some(group) => group.tests.push(name.clone()),
            None => {
                let ordinal = groups.len() + 1;
                groups.push(TestGroup {
                    id: format!("test-{}-{}", sanitize_id(&module), ordinal),
                    module,
                    tests: vec![name.clone()],
                    status: GroupStatus::Pending,
                });
            }
        }
    }
    groups
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diag(code: &str, message: &str) -> Diagnostic {
        Diagnostic {
            message: message.to_string(),
            code: Some(code.to_string()),
            level: Level::Error,
            file: None,
            line: None,
            symbol: extract_symbol(message),
        }
    }

    #[test]
    fn symbol_takes_first_backtick_token() {
        assert_eq!(extract_symbol("cannot find type `Foo` in `bar`"), "Foo");
        assert_eq!(extract_symbol("no symbol here"), "unknown");
    }

    #[test]
    fn symbol_collapses_qualified_paths() {
        assert_eq!(
            extract_symbol("use of undeclared `std::collections::HashMap`"),
            "HashMap"
        );
    }

    #[test]
    fn warnings_are_dropped() {
        let messages = vec![
            json!({"level": "warning", "message": "unused variable `x`", "code": null}),
            json!({"level": "error", "message": "mismatched types", "code": {"code": "E0308"}}),
        ];
        let diags = diagnostics_from_messages(&messages);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code.as_deref(), Some("E0308"));
    }

    #[test]
    fn span_location_comes_from_primary_span() {
        let messages = vec![json!({
            "level": "error",
            "message": "mismatched types",
            "code": {"code": "E0308"},
            "spans": [
                {"is_primary": false, "file_name": "a.rs", "line_start": 1},
                {"is_primary": true, "file_name": "b.rs", "line_start": 42},
            ],
        })];
        let diags = diagnostics_from_messages(&messages);
        assert_eq!(diags[0].file.as_deref(), Some("b.rs"));
        assert_eq!(diags[0].line, Some(42));
    }

    #[test]
    fn groups_sort_by_count_descending() {
        // Two E0308/Bar diagnostics must outrank one E0502/x.
        let diags = vec![
            diag("E0502", "cannot borrow `x` as mutable"),
            diag("E0308", "mismatched types `Bar`"),
            diag("E0308", "mismatched types `Bar`"),
        ];
        let out = group(&diags, DEFAULT_MAX_PER_GROUP);
        assert_eq!(out.total_errors, 3);
        assert_eq!(out.total_groups, 2);
        assert_eq!(out.error_groups[0].error_code, "E0308");
        assert_eq!(out.error_groups[0].symbol, "Bar");
        assert_eq!(out.error_groups[0].count, 2);
        assert_eq!(out.error_groups[1].error_code, "E0502");
        assert_eq!(out.error_groups[1].symbol, "x");
        assert_eq!(out.error_groups[1].count, 1);
    }

    #[test]
    fn ties_keep_first_seen_order() {
        let diags = vec![
            diag("E0412", "cannot find type `First`"),
            diag("E0412", "cannot find type `Second`"),
        ];
        let out = group(&diags, DEFAULT_MAX_PER_GROUP);
        assert_eq!(out.error_groups[0].symbol, "First");
        assert_eq!(out.error_groups[1].symbol, "Second");
    }

    #[test]
    fn cap_limits_retained_errors() {
        let diags: Vec<Diagnostic> = (0..15)
            .map(|_| diag("E0308", "mismatched types `Bar`"))
            .collect();
        let out = group(&diags, 10);
        assert_eq!(out.total_errors, 15);
        assert_eq!(out.error_groups[0].count, 10);
        assert_eq!(out.error_groups[0].errors.len(), 10);
    }

    #[test]
    fn conservation_under_cap() {
        let diags = vec![
            diag("E0308", "mismatched types `Bar`"),
            diag("E0308", "mismatched types `Bar`"),
            diag("E0502", "cannot borrow `x` as mutable"),
            diag("E0412", "cannot find type `Foo`"),
        ];
        let out = group(&diags, DEFAULT_MAX_PER_GROUP);
        let grouped: usize = out.error_groups.iter().map(|g| g.count).sum();
        assert_eq!(grouped, diags.len());
        for g in &out.error_groups {
            assert_eq!(g.count, g.errors.len());
        }
    }

    #[test]
    fn grouping_is_deterministic() {
        let diags = vec![
            diag("E0308", "mismatched types `Bar`"),
            diag("E0502", "cannot borrow `x` as mutable"),
            diag("E0308", "mismatched types `Bar`"),
        ];
        let a = group(&diags, DEFAULT_MAX_PER_GROUP);
        let b = group(&diags, DEFAULT_MAX_PER_GROUP);
        assert_eq!(a, b);
        assert_eq!(a.error_groups[0].id, b.error_groups[0].id);
    }

    #[test]
    fn missing_code_buckets_as_unknown() {
        let mut d = diag("E0308", "some error");
        d.code = None;
        let out = group(&[d], DEFAULT_MAX_PER_GROUP);
        assert_eq!(out.error_groups[0].error_code, "unknown");
    }

    #[test]
    fn test_failures_group_by_module() {
        let failures = vec![
            "store::tests::atomic_write".to_string(),
            "fsm::tests::cap_fires".to_string(),
            "store::tests::round_trip".to_string(),
            "standalone".to_string(),
        ];
        let groups = group_test_failures(&failures);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].module, "store::tests");
        assert_eq!(groups[0].tests.len(), 2);
        assert_eq!(groups[1].module, "fsm::tests");
        assert_eq!(groups[2].module, "crate");
        assert!(groups.iter().all(|g| g.status == GroupStatus::Pending));
    }
}
