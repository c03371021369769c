//! One plan-then-apply tick of the upgrade state machine.
//!
//! A tick loads the persisted status (or starts a fresh one), plans steps
//! for the current state, executes them, evaluates guards, and persists the
//! advanced status. Crashing mid-tick loses at most that tick's uncommitted
//! step results; the next tick re-plans from the last persisted state.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use crate::core::fsm::{self, FsmContext};
use crate::core::types::{State, UpgradeStatus};
use crate::io::build_check::CheckRunner;
use crate::io::config::UpgraderConfig;
use crate::io::dispatch::{RetryPolicy, WorkerDispatcher};
use crate::io::init::UpgradePaths;
use crate::io::report::write_final_report;
use crate::io::scout;
use crate::io::status_store;
use crate::steps::{StepEnv, run_steps};

/// Result of one tick.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub state_before: State,
    pub state_after: State,
    pub steps_executed: usize,
    /// Report artifact written this tick, if the state was a report state.
    pub report_path: Option<PathBuf>,
    pub last_error: Option<String>,
}

/// Run one tick against the project at `root`.
///
/// `old_tag`/`new_tag` seed a fresh status; when a status file already
/// exists its persisted tags are authoritative and the arguments are
/// ignored. The status file is only created once the machine moves past
/// `SCOUT_ARTIFACTS`, so `INIT`'s absent-file guard stays meaningful.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn run_tick<C: CheckRunner, D: WorkerDispatcher>(
    root: &Path,
    checker: &C,
    dispatcher: &D,
    cfg: &UpgraderConfig,
    old_tag: &str,
    new_tag: &str,
) -> Result<TickOutcome> {
    let paths = UpgradePaths::new(root);
    let persisted = status_store::load_optional(&paths.status_path)?;
    let file_existed = persisted.is_some();
    let mut status = persisted
        .unwrap_or_else(|| UpgradeStatus::new(old_tag, new_tag, Utc::now().to_rfc3339()));

    let state_before = status.current_state;
    if state_before.is_terminal() {
        return Ok(TickOutcome {
            state_before,
            state_after: state_before,
            steps_executed: 0,
            report_path: None,
            last_error: status.execution_context.last_error.clone(),
        });
    }

    let scout_release_dir = paths.scout_release_dir(&cfg.product, &status.new_tag);
    let fsm_ctx = FsmContext {
        max_iterations: cfg.max_iterations,
        status_file: paths.status_path.display().to_string(),
        scout_release_dir: scout_release_dir.display().to_string(),
    };

    seed_builtin_vars(&mut status, root);
    if state_before == State::ScoutArtifacts {
        record_scout_survey(&mut status, &scout_release_dir)?;
    }

    // Steps persisted by an interrupted tick are re-run before re-planning.
    if status.pending_steps.is_empty() {
        status.pending_steps = fsm::plan(&status, &fsm_ctx);
    }
    let env = step_env(&paths, cfg);
    let steps_executed = run_steps(&mut status, checker, dispatcher, &env)?;

    let report_path = if state_before.is_report() {
        Some(write_final_report(
            state_before,
            &status,
            &paths,
            cfg.max_iterations,
            &Utc::now().to_rfc3339(),
        )?)
    } else {
        None
    };

    let next = fsm::evaluate(&mut status, &fsm_ctx);
    status.current_state = next;
    status.next_state = None;

    // The status document comes into existence at UPDATE_DEPS.
    if file_existed || !matches!(next, State::Init | State::ScoutArtifacts) {
        status_store::save(&paths.status_path, &status)
            .with_context(|| format!("persist status for {}", next.as_str()))?;
    }

    info!(
        from = state_before.as_str(),
        to = next.as_str(),
        steps_executed,
        iteration = status.iteration,
        "tick complete"
    );
    Ok(TickOutcome {
        state_before,
        state_after: next,
        steps_executed,
        report_path,
        last_error: status.execution_context.last_error.clone(),
    })
}

fn step_env(paths: &UpgradePaths, cfg: &UpgraderConfig) -> StepEnv {
    StepEnv {
        workdir: paths.root.clone(),
        reports_dir: paths.artifacts_dir.clone(),
        logs_dir: paths.logs_dir.clone(),
        max_per_group: cfg.max_per_group,
        bash_timeout: Duration::from_secs(cfg.bash_timeout_secs),
        dispatch_timeout: Duration::from_secs(cfg.dispatch_timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
        retry_policy: RetryPolicy {
            attempts: cfg.dispatch_retries,
            base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
        },
    }
}

/// Refresh the variables planned steps may reference.
fn seed_builtin_vars(status: &mut UpgradeStatus, root: &Path) {
    let vars = [
        ("iteration", json!(status.iteration)),
        ("old_tag", json!(status.old_tag)),
        ("new_tag", json!(status.new_tag)),
        ("project_root", json!(root.display().to_string())),
        ("current_state", json!(status.current_state.as_str())),
    ];
    for (name, value) in vars {
        status
            .execution_context
            .variables
            .insert(name.to_string(), value);
    }
}

/// Store a survey of the harvested scout evidence for worker context.
fn record_scout_survey(status: &mut UpgradeStatus, release_dir: &Path) -> Result<()> {
    let survey = scout::survey(release_dir)?;
    status.execution_context.variables.insert(
        "scout_summary".to_string(),
        json!({
            "dir": survey.dir.display().to_string(),
            "has_release_notes": survey.has_release_notes,
            "pr_count": survey.prs.len(),
            "missing_prs": survey.missing_prs(),
        }),
    );
    Ok(())
}
