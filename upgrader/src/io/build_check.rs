//! Build/test verification behind the [`CheckRunner`] seam.
//!
//! The FSM never trusts a fixer's self-report; every success claim is
//! re-verified through this module. Tests use scripted runners that return
//! predetermined outcomes without spawning processes.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::grouper::diagnostics_from_messages;
use crate::core::types::Diagnostic;
use crate::io::process::run_command_with_timeout;

/// Which verification command to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckMode {
    Build,
    Test,
}

/// Result of one verification pass.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    /// The external command's exit code, verbatim. `None` if killed.
    pub exit_code: Option<i32>,
    /// Error-level diagnostics parsed from the message stream.
    pub diagnostics: Vec<Diagnostic>,
    /// Failing test names (test mode only).
    pub test_failures: Vec<String>,
    /// Where the retained raw message array was persisted.
    pub artifact_path: Option<PathBuf>,
}

/// Abstraction over the external build/test command.
pub trait CheckRunner {
    fn run(&self, mode: CheckMode) -> Result<CheckOutcome>;
}

/// `CheckRunner` that invokes the configured cargo commands and parses their
/// JSON message stream.
pub struct CargoCheckRunner {
    pub workdir: PathBuf,
    pub artifact_dir: PathBuf,
    pub build_command: Vec<String>,
    pub test_command: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl CheckRunner for CargoCheckRunner {
    #[instrument(skip_all, fields(mode = ?mode))]
    fn run(&self, mode: CheckMode) -> Result<CheckOutcome> {
        let argv = match mode {
            CheckMode::Build => &self.build_command,
            CheckMode::Test => &self.test_command,
        };
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("check command is empty"))?;
        info!(program, workdir = %self.workdir.display(), "running verification command");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.workdir);
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run verification command")?;
        if output.timed_out {
            return Err(anyhow!(
                "verification command timed out after {:?}",
                self.timeout
            ));
        }

        let stdout = output.stdout_lossy();
        let (messages, test_failures) = parse_message_stream(&stdout, mode);
        let artifact_path = write_artifact(&self.artifact_dir, &messages)?;
        let diagnostics = diagnostics_from_messages(&messages);

        if output.status.code() != Some(0) && diagnostics.is_empty() && test_failures.is_empty() {
            warn!(
                exit_code = ?output.status.code(),
                "non-zero exit with no parsed diagnostics"
            );
        }
        debug!(
            diagnostics = diagnostics.len(),
            test_failures = test_failures.len(),
            "verification parsed"
        );
        Ok(CheckOutcome {
            exit_code: output.status.code(),
            diagnostics,
            test_failures,
            artifact_path: Some(artifact_path),
        })
    }
}

/// Filter an NDJSON stream to the compiler-message payloads, collecting
/// libtest failure events in test mode. Non-JSON lines are ignored.
fn parse_message_stream(stdout: &str, mode: CheckMode) -> (Vec<Value>, Vec<String>) {
    let mut messages = Vec::new();
    let mut test_failures = Vec::new();
    for line in stdout.lines() {
        let Ok(record) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if record.get("reason").and_then(Value::as_str) == Some("compiler-message") {
            if let Some(message) = record.get("message") {
                messages.push(message.clone());
            }
            continue;
        }
        if mode == CheckMode::Test
            && record.get("type").and_then(Value::as_str) == Some("test")
            && record.get("event").and_then(Value::as_str) == Some("failed")
            && let Some(name) = record.get("name").and_then(Value::as_str)
        {
            test_failures.push(name.to_string());
        }
    }
    (messages, test_failures)
}

fn write_artifact(artifact_dir: &Path, messages: &[Value]) -> Result<PathBuf> {
    fs::create_dir_all(artifact_dir)
        .with_context(|| format!("create artifact dir {}", artifact_dir.display()))?;
    let name = format!("cargo_messages_{}.json", Utc::now().format("%Y%m%d_%H%M%S%3f"));
    let path = artifact_dir.join(name);
    let mut buf = serde_json::to_string_pretty(messages)?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write artifact {}", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(temp: &tempfile::TempDir, script: &str) -> CargoCheckRunner {
        CargoCheckRunner {
            workdir: temp.path().to_path_buf(),
            artifact_dir: temp.path().join("artifacts"),
            build_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            test_command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1 << 20,
        }
    }

    #[test]
    fn filters_compiler_messages_and_writes_artifact() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = concat!(
            "printf '%s\\n' ",
            "'{\"reason\":\"compiler-artifact\",\"target\":{}}' ",
            "'{\"reason\":\"compiler-message\",\"message\":{\"level\":\"error\",",
            "\"message\":\"mismatched types `Bar`\",\"code\":{\"code\":\"E0308\"}}}' ",
            "'not json'; exit 101",
        );
        let outcome = runner(&temp, script).run(CheckMode::Build).expect("run");
        assert_eq!(outcome.exit_code, Some(101));
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].symbol, "Bar");
        let artifact = outcome.artifact_path.expect("artifact");
        let contents = fs::read_to_string(artifact).expect("read artifact");
        let parsed: Vec<Value> = serde_json::from_str(&contents).expect("parse artifact");
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn collects_failed_tests_in_test_mode() {
        let temp = tempfile::tempdir().expect("tempdir");
        let script = concat!(
            "printf '%s\\n' ",
            "'{\"type\":\"test\",\"event\":\"failed\",\"name\":\"store::tests::round_trip\"}' ",
            "'{\"type\":\"test\",\"event\":\"ok\",\"name\":\"store::tests::atomic\"}'; exit 101",
        );
        let outcome = runner(&temp, script).run(CheckMode::Test).expect("run");
        assert_eq!(outcome.test_failures, vec!["store::tests::round_trip"]);
    }

    #[test]
    fn clean_run_has_no_diagnostics() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = runner(&temp, "exit 0").run(CheckMode::Build).expect("run");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.diagnostics.is_empty());
        assert!(outcome.test_failures.is_empty());
    }
}
