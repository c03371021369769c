//! Orchestrator configuration stored at `<project>/upgrader.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Orchestrator configuration (TOML).
///
/// Edited by humans; missing fields default to values that match the stock
/// upgrade pipeline. `MAX_ITERATIONS` in the environment overrides the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpgraderConfig {
    /// Hard cap on verification passes before `ERROR_REPORT`.
    pub max_iterations: u32,

    /// Maximum diagnostics retained per error group.
    pub max_per_group: usize,

    /// Product name used for the scout release directory (`<product>-<tag>`).
    pub product: String,

    /// Build verification command (JSON message stream on stdout).
    pub build_command: Vec<String>,

    /// Test verification command.
    pub test_command: Vec<String>,

    /// Fixer worker command; the agent id is appended as the last argument.
    pub agent_command: Vec<String>,

    /// Wall-clock budget for generic bash steps, in seconds.
    pub bash_timeout_secs: u64,

    /// Wall-clock budget for one verification pass, in seconds.
    pub check_timeout_secs: u64,

    /// Wall-clock budget for one worker dispatch, in seconds.
    pub dispatch_timeout_secs: u64,

    /// Truncate captured child output beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Dispatch attempts per group on transport failure.
    pub dispatch_retries: u32,

    /// First retry delay; doubles per attempt.
    pub retry_base_delay_ms: u64,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            max_iterations: 40,
            max_per_group: 10,
            product: "polkadot-sdk".to_string(),
            build_command: vec![
                "cargo".to_string(),
                "check".to_string(),
                "--all-targets".to_string(),
                "--message-format=json".to_string(),
            ],
            test_command: vec![
                "cargo".to_string(),
                "test".to_string(),
                "--no-fail-fast".to_string(),
                "--message-format=json".to_string(),
            ],
            agent_command: vec!["upgrade-worker".to_string()],
            bash_timeout_secs: 10 * 60,
            check_timeout_secs: 60 * 60,
            dispatch_timeout_secs: 60 * 60,
            output_limit_bytes: 10_000_000,
            dispatch_retries: 3,
            retry_base_delay_ms: 2_000,
        }
    }
}

impl UpgraderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_per_group == 0 {
            return Err(anyhow!("max_per_group must be > 0"));
        }
        if self.product.trim().is_empty() {
            return Err(anyhow!("product must be non-empty"));
        }
        for (name, command) in [
            ("build_command", &self.build_command),
            ("test_command", &self.test_command),
            ("agent_command", &self.agent_command),
        ] {
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("{name} must be a non-empty array"));
            }
        }
        if self.check_timeout_secs == 0 || self.dispatch_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file, applying the `MAX_ITERATIONS` env override.
///
/// A missing file yields `UpgraderConfig::default()`.
pub fn load_config(path: &Path) -> Result<UpgraderConfig> {
    let mut cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?
    } else {
        UpgraderConfig::default()
    };
    if let Ok(raw) = std::env::var("MAX_ITERATIONS") {
        cfg.max_iterations = raw
            .trim()
            .parse()
            .with_context(|| format!("MAX_ITERATIONS is not an integer: {raw:?}"))?;
    }
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &UpgraderConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg.max_iterations, 40);
        assert_eq!(cfg.max_per_group, 10);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("upgrader.toml");
        let mut cfg = UpgraderConfig::default();
        cfg.max_iterations = 7;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn rejects_empty_commands() {
        let mut cfg = UpgraderConfig::default();
        cfg.agent_command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("upgrader.toml");
        fs::write(&path, "max_iterations = 5\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 5);
        assert_eq!(cfg.max_per_group, 10);
    }
}
