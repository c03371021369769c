//! Fixer-worker invocation behind the [`WorkerDispatcher`] seam.
//!
//! `Err` from a dispatcher means the transport failed (the worker could not
//! be reached or produced no report). A worker that runs and reports
//! "could not fix" is a logical failure, returned as a `failure` report and
//! never retried.

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{DispatchReport, DispatchStatus};
use crate::io::process::{CommandOutput, run_command_with_timeout};

/// Parameters for one worker invocation.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Capability identifier, e.g. `bug-fixer` or `tests-fixer`.
    pub agent: String,
    /// Context object fed to the worker on stdin.
    pub context: Value,
    /// Working directory for the worker process.
    pub workdir: PathBuf,
    /// Path where the worker should write its report JSON.
    pub output_path: PathBuf,
    /// Path to write the worker's stdout/stderr log.
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over worker execution backends.
pub trait WorkerDispatcher {
    /// Run the worker to completion and return its report.
    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReport>;
}

/// Retry policy for transport-level dispatch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

/// Dispatch with bounded retry on transport failure.
///
/// Delays double per attempt. Exhaustion degrades to a `failure` report so
/// the pipeline marks the group `failed` and continues instead of aborting
/// the run.
#[instrument(skip_all, fields(agent = %request.agent))]
pub fn dispatch_with_retry<D: WorkerDispatcher>(
    dispatcher: &D,
    request: &DispatchRequest,
    policy: &RetryPolicy,
) -> Result<DispatchReport> {
    let attempts = policy.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match dispatcher.dispatch(request) {
            Ok(report) => {
                debug!(attempt, status = ?report.status, "worker reported");
                return Ok(report);
            }
            Err(err) => {
                warn!(attempt, err = format!("{err:#}"), "dispatch transport failure");
                last_err = Some(err);
                if attempt < attempts {
                    let delay = policy.base_delay * 2u32.pow(attempt - 1);
                    thread::sleep(delay);
                }
            }
        }
    }
    let detail = last_err.map_or_else(String::new, |err| format!("{err:#}"));
    Ok(DispatchReport {
        status: DispatchStatus::Failure,
        notes: format!(
            "dispatch of {} failed after {attempts} attempts: {detail}",
            request.agent
        ),
    })
}

/// Dispatcher that spawns a configured worker command.
///
/// The agent id is appended as the final argument; the context object is
/// fed on stdin; the report is read from `output_path`, falling back to the
/// worker's stdout when it writes the report there instead.
pub struct ProcessDispatcher {
    pub command: Vec<String>,
}

impl WorkerDispatcher for ProcessDispatcher {
    #[instrument(skip_all, fields(agent = %request.agent))]
    fn dispatch(&self, request: &DispatchRequest) -> Result<DispatchReport> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        info!(program, workdir = %request.workdir.display(), "spawning fixer worker");

        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        let mut cmd = std::process::Command::new(program);
        cmd.args(args)
            .arg(&request.agent)
            .arg("--output")
            .arg(&request.output_path)
            .current_dir(&request.workdir);

        let stdin = serde_json::to_vec(&request.context).context("serialize worker context")?;
        let output = run_command_with_timeout(
            cmd,
            Some(&stdin),
            request.timeout,
            request.output_limit_bytes,
        )
        .context("run fixer worker")?;

        write_worker_log(request, &output)?;

        if output.timed_out {
            return Err(anyhow!(
                "worker {} timed out after {:?}",
                request.agent,
                request.timeout
            ));
        }
        read_report(request, &output)
    }
}

fn read_report(request: &DispatchRequest, output: &CommandOutput) -> Result<DispatchReport> {
    if request.output_path.exists() {
        let contents = fs::read_to_string(&request.output_path)
            .with_context(|| format!("read worker report {}", request.output_path.display()))?;
        return serde_json::from_str(&contents)
            .with_context(|| format!("parse worker report {}", request.output_path.display()));
    }
    let stdout = output.stdout_lossy();
    serde_json::from_str(stdout.trim())
        .map_err(|err| anyhow!("worker {} produced no report: {err}", request.agent))
}

fn write_worker_log(request: &DispatchRequest, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = request.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_lossy());
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_lossy());
    buf.push_str(&output.truncation_notice());
    if output.timed_out {
        buf.push_str("\n[worker timed out]\n");
    }
    fs::write(&request.log_path, buf)
        .with_context(|| format!("write worker log {}", request.log_path.display()))
}
