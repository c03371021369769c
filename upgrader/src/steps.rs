//! Execution of one tick's planned steps.
//!
//! Steps run strictly in array order, never concurrently. A failing step is
//! recorded in `execution_context.last_error` and execution continues; the
//! FSM evaluation afterwards decides what a partial tick means.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::fsm::{CHECK_BUILD_COMMAND, CHECK_TEST_BUILD_COMMAND, RUN_TESTS_COMMAND};
use crate::core::grouper;
use crate::core::subst::{substitute_str, substitute_value};
use crate::core::types::{Step, UpgradeStatus};
use crate::io::build_check::{CheckMode, CheckRunner};
use crate::io::dispatch::{
    DispatchRequest, RetryPolicy, WorkerDispatcher, dispatch_with_retry,
};
use crate::io::process::{run_command_with_timeout, shell_command};
use crate::io::status_store::set_field;

/// Static surroundings for step execution.
#[derive(Debug, Clone)]
pub struct StepEnv {
    /// Working directory for shell commands and workers.
    pub workdir: PathBuf,
    /// Where worker reports are written.
    pub reports_dir: PathBuf,
    /// Where worker logs are written.
    pub logs_dir: PathBuf,
    pub max_per_group: usize,
    pub bash_timeout: Duration,
    pub dispatch_timeout: Duration,
    pub output_limit_bytes: usize,
    pub retry_policy: RetryPolicy,
}

/// Run all pending steps in order, consuming them from the status.
///
/// Returns the number of steps executed. Individual step failures are
/// recorded, never propagated; only infrastructure faults (a status update
/// producing an invalid document) abort.
#[instrument(skip_all, fields(state = status.current_state.as_str()))]
pub fn run_steps<C: CheckRunner, D: WorkerDispatcher>(
    status: &mut UpgradeStatus,
    checker: &C,
    dispatcher: &D,
    env: &StepEnv,
) -> Result<usize> {
    let steps = std::mem::take(&mut status.pending_steps);
    let mut executed = 0usize;
    for step in &steps {
        debug!(?step, "executing step");
        if let Err(err) = run_one(status, checker, dispatcher, env, step) {
            warn!(err = format!("{err:#}"), "step failed");
            record_error(status, &format!("{err:#}"));
        }
        executed += 1;
    }
    Ok(executed)
}

fn run_one<C: CheckRunner, D: WorkerDispatcher>(
    status: &mut UpgradeStatus,
    checker: &C,
    dispatcher: &D,
    env: &StepEnv,
    step: &Step,
) -> Result<()> {
    match step {
        Step::Bash {
            command,
            output_var,
        } => run_bash(status, checker, env, command, output_var.as_deref()),
        Step::SpawnAgent {
            agent,
            context,
            output_var,
        } => run_spawn_agent(status, dispatcher, env, agent, context, output_var.as_deref()),
        Step::UpdateStatus { field, value } => {
            let resolved = substitute_value(value, &status.execution_context.variables)?;
            set_field(status, field, resolved)
        }
        Step::Parse {
            parser,
            input,
            output_var,
        } => run_parse(status, env, parser, input, output_var),
        Step::CheckFile { path, exists_var } => {
            let path = substitute_str(path, &status.execution_context.variables)?;
            let exists = std::path::Path::new(&path).exists();
            set_var(status, exists_var, json!(exists));
            Ok(())
        }
    }
}

fn run_bash<C: CheckRunner>(
    status: &mut UpgradeStatus,
    checker: &C,
    env: &StepEnv,
    command: &str,
    output_var: Option<&str>,
) -> Result<()> {
    let command = substitute_str(command, &status.execution_context.variables)?;
    match command.as_str() {
        CHECK_BUILD_COMMAND => run_check(status, checker, CheckMode::Build, output_var, false),
        CHECK_TEST_BUILD_COMMAND => run_check(status, checker, CheckMode::Test, output_var, false),
        RUN_TESTS_COMMAND => run_check(status, checker, CheckMode::Test, output_var, true),
        _ => run_shell(status, env, &command, output_var),
    }
}

/// Builtin verification commands route to the `CheckRunner` instead of a
/// shell. The output variable receives the artifact path for build checks
/// and the failing-test list for test runs.
fn run_check<C: CheckRunner>(
    status: &mut UpgradeStatus,
    checker: &C,
    mode: CheckMode,
    output_var: Option<&str>,
    want_failures: bool,
) -> Result<()> {
    // A failed run must not leave the previous cycle's result readable; the
    // FSM treats a missing result as "revisit this state", never as a pass.
    if let Some(var) = output_var {
        status.execution_context.variables.remove(var);
    }
    let outcome = checker.run(mode)?;
    if outcome.exit_code != Some(0)
        && outcome.diagnostics.is_empty()
        && outcome.test_failures.is_empty()
    {
        record_error(
            status,
            &format!(
                "verification exited with {:?} but produced no diagnostics",
                outcome.exit_code
            ),
        );
    }
    status.execution_context.last_command_output = format!(
        "exit={:?} diagnostics={} test_failures={}",
        outcome.exit_code,
        outcome.diagnostics.len(),
        outcome.test_failures.len()
    );
    if let Some(var) = output_var {
        if want_failures {
            set_var(status, var, json!(outcome.test_failures));
        } else {
            let artifact = outcome
                .artifact_path
                .as_ref()
                .ok_or_else(|| anyhow!("verification produced no artifact"))?;
            set_var(status, var, json!(artifact.display().to_string()));
        }
    }
    Ok(())
}

fn run_shell(
    status: &mut UpgradeStatus,
    env: &StepEnv,
    command: &str,
    output_var: Option<&str>,
) -> Result<()> {
    let cmd = shell_command(command, &env.workdir);
    let output = run_command_with_timeout(cmd, None, env.bash_timeout, env.output_limit_bytes)
        .with_context(|| format!("run command {command:?}"))?;
    if output.timed_out {
        return Err(anyhow!("command {command:?} timed out"));
    }
    let stdout = output.stdout_lossy();
    status.execution_context.last_command_output = stdout.clone();
    if !output.status.success() {
        record_error(
            status,
            &format!(
                "command {command:?} exited with {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ),
        );
    }
    if let Some(var) = output_var {
        set_var(status, var, json!(stdout.trim_end()));
    }
    Ok(())
}

fn run_spawn_agent<D: WorkerDispatcher>(
    status: &mut UpgradeStatus,
    dispatcher: &D,
    env: &StepEnv,
    agent: &str,
    context: &Value,
    output_var: Option<&str>,
) -> Result<()> {
    let context = substitute_value(context, &status.execution_context.variables)?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S%3f");
    let request = DispatchRequest {
        agent: agent.to_string(),
        context,
        workdir: env.workdir.clone(),
        output_path: env.reports_dir.join(format!("{agent}_{stamp}.json")),
        log_path: env.logs_dir.join(format!("{agent}_{stamp}.log")),
        timeout: env.dispatch_timeout,
        output_limit_bytes: env.output_limit_bytes,
    };
    let report = dispatch_with_retry(dispatcher, &request, &env.retry_policy)?;
    if let Some(var) = output_var {
        set_var(status, var, serde_json::to_value(&report)?);
    }
    Ok(())
}

fn run_parse(
    status: &mut UpgradeStatus,
    env: &StepEnv,
    parser: &str,
    input: &str,
    output_var: &str,
) -> Result<()> {
    if parser != "error_grouper" {
        return Err(anyhow!("unknown parser {parser:?}"));
    }
    let artifact = substitute_str(input, &status.execution_context.variables)?;
    let contents = fs::read_to_string(&artifact)
        .with_context(|| format!("read diagnostics artifact {artifact}"))?;
    let messages: Vec<Value> = serde_json::from_str(&contents)
        .with_context(|| format!("parse diagnostics artifact {artifact}"))?;
    let diagnostics = grouper::diagnostics_from_messages(&messages);
    let output = grouper::group(&diagnostics, env.max_per_group);
    debug!(
        total_errors = output.total_errors,
        total_groups = output.total_groups,
        "grouped diagnostics"
    );
    set_var(status, output_var, serde_json::to_value(output)?);
    Ok(())
}

fn set_var(status: &mut UpgradeStatus, name: &str, value: Value) {
    status
        .execution_context
        .variables
        .insert(name.to_string(), value);
}

fn record_error(status: &mut UpgradeStatus, message: &str) {
    status.execution_context.last_error = Some(message.to_string());
}
