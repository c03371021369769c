//! Durable status persistence with schema validation and atomic writes.
//!
//! The status file is the single source of truth between ticks. A corrupt
//! file is fatal (`StoreCorruption`), never repaired by guessing; a missing
//! file just means "no prior run".

use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::types::UpgradeStatus;

static STATUS_SCHEMA: &str = include_str!("../../schemas/upgrade_status.schema.json");

/// The status file exists but cannot be trusted. Requires operator
/// intervention; detected via `err.downcast_ref::<StoreCorruption>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCorruption {
    pub path: String,
    pub detail: String,
}

impl fmt::Display for StoreCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status file {} is corrupt: {}", self.path, self.detail)
    }
}

impl std::error::Error for StoreCorruption {}

/// Load and validate the status document.
///
/// A missing file is an `Err` too; use [`load_optional`] where absence is a
/// normal condition.
pub fn load(path: &Path) -> Result<UpgradeStatus> {
    match load_optional(path)? {
        Some(status) => Ok(status),
        None => Err(anyhow!("status file not found: {}", path.display())),
    }
}

/// Load the status document, mapping a missing file to `None`.
pub fn load_optional(path: &Path) -> Result<Option<UpgradeStatus>> {
    debug!(path = %path.display(), "loading status");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read status {}", path.display()));
        }
    };
    let instance: Value = serde_json::from_str(&contents).map_err(|err| {
        anyhow!(StoreCorruption {
            path: path.display().to_string(),
            detail: format!("invalid JSON: {err}"),
        })
    })?;
    validate_schema(path, &instance)?;
    let status: UpgradeStatus = serde_json::from_value(instance).map_err(|err| {
        anyhow!(StoreCorruption {
            path: path.display().to_string(),
            detail: format!("schema-valid but undeserializable: {err}"),
        })
    })?;
    Ok(Some(status))
}

/// Atomically write the status document (temp file + rename).
pub fn save(path: &Path, status: &UpgradeStatus) -> Result<()> {
    debug!(path = %path.display(), state = status.current_state.as_str(), "writing status");
    let mut buf = serde_json::to_string_pretty(status)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Load, set one dotted field, and save. Other fields are untouched.
pub fn update(path: &Path, field: &str, value: Value) -> Result<()> {
    let mut status = load(path)?;
    set_field(&mut status, field, value)?;
    save(path, &status)
}

/// Set a dotted field path on an in-memory status.
///
/// Routes through the JSON representation so paths into
/// `execution_context.variables` and unknown top-level fields (which land in
/// the flattened extras) both work uniformly.
pub fn set_field(status: &mut UpgradeStatus, field: &str, value: Value) -> Result<()> {
    let mut doc = serde_json::to_value(&*status).context("serialize status")?;
    set_dotted(&mut doc, field, value)?;
    *status = serde_json::from_value(doc)
        .with_context(|| format!("status update to {field} produced an invalid document"))?;
    Ok(())
}

fn set_dotted(doc: &mut Value, field: &str, value: Value) -> Result<()> {
    let mut cursor = doc;
    let mut segments = field.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segment.is_empty() {
            return Err(anyhow!("empty segment in field path {field:?}"));
        }
        let obj = cursor
            .as_object_mut()
            .ok_or_else(|| anyhow!("field path {field:?} traverses a non-object"))?;
        if segments.peek().is_none() {
            obj.insert(segment.to_string(), value);
            return Ok(());
        }
        cursor = obj
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    Err(anyhow!("empty field path"))
}

fn validate_schema(path: &Path, instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(STATUS_SCHEMA).context("parse bundled schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    if !compiled.is_valid(instance) {
        let messages = compiled
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(StoreCorruption {
            path: path.display().to_string(),
            detail: format!("schema violations:\n- {}", messages.join("\n- ")),
        }));
    }
    Ok(())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("status path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp status {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace status {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::State;
    use serde_json::json;

    fn sample() -> UpgradeStatus {
        UpgradeStatus::new("polkadot-v1.14.0", "polkadot-v1.15.0", "2026-08-30T00:00:00Z".to_string())
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("output/status.json");

        let mut status = sample();
        status.current_state = State::CheckErrors;
        status.iteration = 7;
        save(&path, &status).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, status);
    }

    #[test]
    fn unknown_fields_survive_write_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");

        let mut status = sample();
        status
            .extra
            .insert("operator_note".to_string(), json!("keep me"));
        save(&path, &status).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.extra.get("operator_note"), Some(&json!("keep me")));
        save(&path, &loaded).expect("save again");
        let reloaded = load(&path).expect("reload");
        assert_eq!(reloaded, status);
    }

    #[test]
    fn missing_file_is_none_not_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("absent.json");
        assert!(load_optional(&path).expect("load_optional").is_none());
        assert!(load(&path).is_err());
    }

    #[test]
    fn invalid_json_is_store_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        fs::write(&path, "{ not json").expect("write");
        let err = load(&path).unwrap_err();
        assert!(err.downcast_ref::<StoreCorruption>().is_some());
    }

    #[test]
    fn schema_violation_is_store_corruption() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        fs::write(&path, "{\"current_state\": \"NOT_A_STATE\"}\n").expect("write");
        let err = load(&path).unwrap_err();
        assert!(err.downcast_ref::<StoreCorruption>().is_some());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        save(&path, &sample()).expect("save");
        assert!(!temp.path().join("status.json.tmp").exists());
    }

    #[test]
    fn update_merges_one_field() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("status.json");
        save(&path, &sample()).expect("save");
        update(&path, "iteration", json!(3)).expect("update");
        update(&path, "execution_context.variables.flag", json!(true)).expect("update nested");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.iteration, 3);
        assert_eq!(
            loaded.execution_context.variables.get("flag"),
            Some(&json!(true))
        );
        assert_eq!(loaded.old_tag, "polkadot-v1.14.0");
    }

    #[test]
    fn set_field_rejects_path_through_scalar() {
        let mut status = sample();
        assert!(set_field(&mut status, "iteration.deep", json!(1)).is_err());
    }
}
