//! Test-only helpers: scripted backends and a throwaway project layout.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

use crate::core::types::{Diagnostic, DispatchReport, Level, UpgradeStatus};
use crate::io::build_check::{CheckMode, CheckOutcome, CheckRunner};
use crate::io::config::UpgraderConfig;
use crate::io::dispatch::{DispatchRequest, WorkerDispatcher};
use crate::io::init::{UpgradePaths, initialize};
use crate::io::status_store;

/// `CheckRunner` that replays queued outcomes and records requested modes.
pub struct ScriptedCheckRunner {
    outcomes: RefCell<VecDeque<CheckOutcome>>,
    modes: RefCell<Vec<CheckMode>>,
}

impl ScriptedCheckRunner {
    pub fn new(outcomes: Vec<CheckOutcome>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            modes: RefCell::new(Vec::new()),
        }
    }

    /// Modes requested so far, in order.
    pub fn modes(&self) -> Vec<CheckMode> {
        self.modes.borrow().clone()
    }
}

impl CheckRunner for ScriptedCheckRunner {
    fn run(&self, mode: CheckMode) -> Result<CheckOutcome> {
        self.modes.borrow_mut().push(mode);
        self.outcomes
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted check runner exhausted"))
    }
}

/// `WorkerDispatcher` that replays queued results and records requests.
pub struct ScriptedDispatcher {
    results: RefCell<VecDeque<Result<DispatchReport>>>,
    requests: RefCell<Vec<DispatchRequest>>,
}

impl ScriptedDispatcher {
    pub fn new(results: Vec<Result<DispatchReport>>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<DispatchRequest> {
        self.requests.borrow().clone()
    }
}

impl WorkerDispatcher for ScriptedDispatcher {
    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReport> {
        self.requests.borrow_mut().push(request.clone());
        self.results
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted dispatcher exhausted"))?
    }
}

/// Build a diagnostic with the symbol derived the same way the grouper does.
pub fn diag(code: &str, message: &str, level: Level) -> Diagnostic {
    Diagnostic {
        message: message.to_string(),
        code: Some(code.to_string()),
        level,
        file: None,
        line: None,
        symbol: crate::core::grouper::extract_symbol(message),
    }
}

/// A clean verification outcome (exit 0, nothing to report).
pub fn clean_outcome(artifact_dir: &Path) -> CheckOutcome {
    let artifact = artifact_dir.join("clean.json");
    if !artifact.exists() {
        std::fs::create_dir_all(artifact_dir).expect("create artifact dir");
        std::fs::write(&artifact, "[]\n").expect("write artifact");
    }
    CheckOutcome {
        exit_code: Some(0),
        diagnostics: Vec::new(),
        test_failures: Vec::new(),
        artifact_path: Some(artifact),
    }
}

/// A failing build outcome; writes the raw messages so parse steps can read
/// them back.
pub fn failing_outcome(artifact_dir: &Path, diagnostics: Vec<Diagnostic>) -> CheckOutcome {
    std::fs::create_dir_all(artifact_dir).expect("create artifact dir");
    let messages: Vec<serde_json::Value> = diagnostics
        .iter()
        .map(|d| {
            serde_json::json!({
                "level": "error",
                "message": d.message,
                "code": d.code.as_ref().map(|c| serde_json::json!({"code": c})),
            })
        })
        .collect();
    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let n = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let artifact = artifact_dir.join(format!("messages_{n}.json"));
    std::fs::write(&artifact, serde_json::to_string(&messages).expect("serialize"))
        .expect("write artifact");
    CheckOutcome {
        exit_code: Some(101),
        diagnostics,
        test_failures: Vec::new(),
        artifact_path: Some(artifact),
    }
}

/// Initialized scratch project with zero-delay retry configuration.
pub struct TestProject {
    pub temp: tempfile::TempDir,
    pub paths: UpgradePaths,
    pub config: UpgraderConfig,
}

impl TestProject {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        initialize(temp.path()).expect("initialize");
        let paths = UpgradePaths::new(temp.path());
        let mut config = UpgraderConfig::default();
        config.retry_base_delay_ms = 0;
        config.bash_timeout_secs = 5;
        config.check_timeout_secs = 5;
        config.dispatch_timeout_secs = 5;
        Self {
            temp,
            paths,
            config,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().to_path_buf()
    }

    pub fn write_status(&self, status: &UpgradeStatus) {
        status_store::save(&self.paths.status_path, status).expect("save status");
    }

    pub fn read_status(&self) -> UpgradeStatus {
        status_store::load(&self.paths.status_path).expect("load status")
    }
}

impl Default for TestProject {
    fn default() -> Self {
        Self::new()
    }
}
