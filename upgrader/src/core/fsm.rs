//! The upgrade state machine as two pure functions.
//!
//! `plan` turns the current status into the step list for its state;
//! `evaluate` inspects the post-execution status, applies state mutations,
//! and returns the next state. Neither touches the filesystem, so every
//! transition is unit-testable with a plain `UpgradeStatus` value.
//!
//! Guard evaluation order is part of the contract: the iteration cap is
//! checked before anything else, and a missing step result never aborts a
//! tick. It is recorded in `last_error` and the state is revisited.

use serde_json::{Value, json};

use crate::core::grouper::{self, GrouperOutput};
use crate::core::types::{
    DispatchReport, DispatchStatus, ErrorGroup, GroupStatus, State, Step, TestGroup, TestPhase,
    UpgradeStatus,
};

/// Commands routed to the `CheckRunner` instead of a shell.
pub const CHECK_BUILD_COMMAND: &str = "check_build";
pub const CHECK_TEST_BUILD_COMMAND: &str = "check_test_build";
pub const RUN_TESTS_COMMAND: &str = "run_tests";

/// Variable names the engine reads back after step execution.
const VAR_STATUS_EXISTS: &str = "status_exists";
const VAR_SCOUT_READY: &str = "scout_ready";
const VAR_ERROR_GROUPS: &str = "error_groups";
const VAR_REVERIFY_GROUPS: &str = "reverify_groups";
const VAR_SELECTED_GROUP: &str = "selected_group";
const VAR_DISPATCH_REPORT: &str = "dispatch_report";
const VAR_TEST_FAILURES: &str = "test_failures";
const VAR_SELECTED_TEST_GROUP: &str = "selected_test_group";
const VAR_TEST_DISPATCH_REPORT: &str = "test_dispatch_report";

/// Static inputs the engine needs beyond the status document itself.
#[derive(Debug, Clone)]
pub struct FsmContext {
    pub max_iterations: u32,
    /// Path checked by `INIT` to distinguish a fresh run from a resume.
    pub status_file: String,
    /// Scout release directory checked by `SCOUT_ARTIFACTS`.
    pub scout_release_dir: String,
}

/// Compute the steps for the current state. Pure.
pub fn plan(status: &UpgradeStatus, ctx: &FsmContext) -> Vec<Step> {
    match status.current_state {
        State::Init => vec![Step::CheckFile {
            path: ctx.status_file.clone(),
            exists_var: VAR_STATUS_EXISTS.to_string(),
        }],
        State::ScoutArtifacts => vec![Step::CheckFile {
            path: ctx.scout_release_dir.clone(),
            exists_var: VAR_SCOUT_READY.to_string(),
        }],
        State::UpdateDeps => vec![Step::SpawnAgent {
            agent: "deps-updater".to_string(),
            context: json!({
                "old_tag": status.old_tag,
                "new_tag": status.new_tag,
            }),
            output_var: Some("deps_report".to_string()),
        }],
        State::CheckErrors => {
            let mut steps = vec![Step::UpdateStatus {
                field: "iteration".to_string(),
                value: json!("{{iteration + 1}}"),
            }];
            // Past the cap, evaluation fires before any further check would
            // be useful; skip the build to keep the final tick cheap.
            if status.iteration < ctx.max_iterations {
                steps.push(Step::Bash {
                    command: CHECK_BUILD_COMMAND.to_string(),
                    output_var: Some("check_artifact".to_string()),
                });
                steps.push(Step::Parse {
                    parser: "error_grouper".to_string(),
                    input: "{{check_artifact}}".to_string(),
                    output_var: VAR_ERROR_GROUPS.to_string(),
                });
            }
            steps
        }
        State::Execute => match status.first_pending_group() {
            Some(group) => vec![Step::UpdateStatus {
                field: format!("execution_context.variables.{VAR_SELECTED_GROUP}"),
                value: Value::String(group.id.clone()),
            }],
            None => reverify_steps(),
        },
        State::Spawn => match selected_group(status) {
            Some(group) => vec![Step::SpawnAgent {
                agent: "bug-fixer".to_string(),
                context: json!({
                    "group": group,
                    "old_tag": status.old_tag,
                    "new_tag": status.new_tag,
                }),
                output_var: Some(VAR_DISPATCH_REPORT.to_string()),
            }],
            None => Vec::new(),
        },
        State::Update => reverify_steps(),
        State::TestWorkspace => vec![
            Step::UpdateStatus {
                field: "iteration".to_string(),
                value: json!("{{iteration + 1}}"),
            },
            Step::UpdateStatus {
                field: "test_phase".to_string(),
                value: json!("verifying"),
            },
            Step::Bash {
                command: RUN_TESTS_COMMAND.to_string(),
                output_var: Some(VAR_TEST_FAILURES.to_string()),
            },
        ],
        State::ExecuteTestFix => match status.first_pending_test_group() {
            Some(group) => vec![Step::UpdateStatus {
                field: format!("execution_context.variables.{VAR_SELECTED_TEST_GROUP}"),
                value: Value::String(group.id.clone()),
            }],
            None => Vec::new(),
        },
        State::SpawnTestFixer => match selected_test_group(status) {
            Some(group) => vec![Step::SpawnAgent {
                agent: "tests-fixer".to_string(),
                context: json!({
                    "module": group.module,
                    "tests": group.tests,
                    "old_tag": status.old_tag,
                    "new_tag": status.new_tag,
                }),
                output_var: Some(VAR_TEST_DISPATCH_REPORT.to_string()),
            }],
            None => Vec::new(),
        },
        State::CheckTests
        | State::Complete
        | State::ErrorReport
        | State::TestErrorReport
        | State::End => Vec::new(),
    }
}

fn reverify_steps() -> Vec<Step> {
    vec![
        Step::Bash {
            command: CHECK_BUILD_COMMAND.to_string(),
            output_var: Some("reverify_artifact".to_string()),
        },
        Step::Parse {
            parser: "error_grouper".to_string(),
            input: "{{reverify_artifact}}".to_string(),
            output_var: VAR_REVERIFY_GROUPS.to_string(),
        },
    ]
}

/// Evaluate guards over the post-execution status and return the next state.
///
/// Mutates the status (group archival, counters, variable cleanup) but never
/// performs I/O. The iteration cap overrides every other guard.
pub fn evaluate(status: &mut UpgradeStatus, ctx: &FsmContext) -> State {
    if status.iteration > ctx.max_iterations
        && !status.current_state.is_report()
        && !status.current_state.is_terminal()
    {
        status.execution_context.last_error = Some(format!(
            "iteration limit exceeded: {} > {}",
            status.iteration, ctx.max_iterations
        ));
        return State::ErrorReport;
    }

    match status.current_state {
        State::Init => {
            if var_bool(status, VAR_STATUS_EXISTS) {
                State::CheckErrors
            } else {
                State::ScoutArtifacts
            }
        }
        State::ScoutArtifacts => {
            if !var_bool(status, VAR_SCOUT_READY) {
                status.execution_context.last_error = Some(format!(
                    "scout artifacts not found at {}",
                    ctx.scout_release_dir
                ));
            }
            State::UpdateDeps
        }
        State::UpdateDeps => State::CheckErrors,
        State::CheckErrors => match take_grouper_output(status, VAR_ERROR_GROUPS) {
            Some(output) => {
                archive_groups(status);
                if output.total_groups > 0 {
                    status.error_groups = output.error_groups;
                    status.completed_groups = 0;
                    State::Execute
                } else {
                    State::TestWorkspace
                }
            }
            None => {
                record_missing(status, VAR_ERROR_GROUPS);
                State::CheckErrors
            }
        },
        State::Execute => {
            if selected_group(status).is_some() {
                return State::Spawn;
            }
            match take_grouper_output(status, VAR_REVERIFY_GROUPS) {
                Some(output) if output.total_groups == 0 => State::Update,
                Some(output) => {
                    absorb_reverification(status, output.error_groups);
                    State::CheckErrors
                }
                None => {
                    record_missing(status, VAR_REVERIFY_GROUPS);
                    State::Execute
                }
            }
        }
        State::Spawn => State::Update,
        State::Update => {
            mark_selected_group(status);
            match take_grouper_output(status, VAR_REVERIFY_GROUPS) {
                Some(output) if output.total_groups == 0 => State::TestWorkspace,
                Some(output) => {
                    absorb_reverification(status, output.error_groups);
                    State::CheckErrors
                }
                None => {
                    record_missing(status, VAR_REVERIFY_GROUPS);
                    State::Update
                }
            }
        }
        State::TestWorkspace => match var_failures(status) {
            Some(failures) if failures.is_empty() => State::Complete,
            Some(_) => State::CheckTests,
            None => {
                record_missing(status, VAR_TEST_FAILURES);
                State::TestWorkspace
            }
        },
        State::CheckTests => {
            let failures = var_failures(status).unwrap_or_default();
            if failures.is_empty() {
                return State::Complete;
            }
            // A previous fix cycle where every group already failed has no
            // remaining leverage; report instead of spinning.
            let exhausted = !status.test_groups.is_empty()
                && status
                    .test_groups
                    .iter()
                    .all(|g| g.status == GroupStatus::Failed);
            if exhausted {
                status.execution_context.last_error = Some(
                    "test failures persist after all fix groups failed".to_string(),
                );
                return State::TestErrorReport;
            }
            status.test_groups = grouper::group_test_failures(&failures);
            status.test_phase = Some(TestPhase::Fixing);
            State::ExecuteTestFix
        }
        State::ExecuteTestFix => {
            if selected_test_group(status).is_some() {
                State::SpawnTestFixer
            } else {
                status.test_phase = Some(TestPhase::Verifying);
                State::TestWorkspace
            }
        }
        State::SpawnTestFixer => {
            mark_selected_test_group(status);
            State::ExecuteTestFix
        }
        State::Complete | State::ErrorReport | State::TestErrorReport => State::End,
        State::End => State::End,
    }
}

fn var_bool(status: &UpgradeStatus, name: &str) -> bool {
    status
        .execution_context
        .variables
        .get(name)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn var_failures(status: &UpgradeStatus) -> Option<Vec<String>> {
    let value = status.execution_context.variables.get(VAR_TEST_FAILURES)?;
    let items = value.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

fn take_grouper_output(status: &mut UpgradeStatus, name: &str) -> Option<GrouperOutput> {
    let value = status.execution_context.variables.remove(name)?;
    match serde_json::from_value(value) {
        Ok(output) => Some(output),
        Err(err) => {
            status.execution_context.last_error =
                Some(format!("malformed {name} output: {err}"));
            None
        }
    }
}

fn record_missing(status: &mut UpgradeStatus, name: &str) {
    status.execution_context.last_error = Some(format!("step result {name} missing"));
}

fn selected_group(status: &UpgradeStatus) -> Option<&ErrorGroup> {
    let id = status
        .execution_context
        .variables
        .get(VAR_SELECTED_GROUP)?
        .as_str()?;
    status.error_groups.iter().find(|g| g.id == id)
}

fn selected_test_group(status: &UpgradeStatus) -> Option<&TestGroup> {
    let id = status
        .execution_context
        .variables
        .get(VAR_SELECTED_TEST_GROUP)?
        .as_str()?;
    status.test_groups.iter().find(|g| g.id == id)
}

/// Move the current groups into the archive. Called when a fresh detection
/// cycle begins; groups are never deleted.
fn archive_groups(status: &mut UpgradeStatus) {
    let groups = std::mem::take(&mut status.error_groups);
    status.completed_error_groups.extend(groups);
}

/// A re-verification found live errors: archive the processed groups, adopt
/// the freshly discovered ones, and restart the counting for this cycle.
fn absorb_reverification(status: &mut UpgradeStatus, fresh: Vec<ErrorGroup>) {
    archive_groups(status);
    status.error_groups = fresh;
    status.completed_groups = 0;
}

/// Apply the dispatch report to the selected group, then clear the
/// selection so the next `EXECUTE` pass picks the next pending group.
fn mark_selected_group(status: &mut UpgradeStatus) {
    let report = status
        .execution_context
        .variables
        .remove(VAR_DISPATCH_REPORT)
        .and_then(|v| serde_json::from_value::<DispatchReport>(v).ok());
    let selected = status
        .execution_context
        .variables
        .remove(VAR_SELECTED_GROUP)
        .and_then(|v| v.as_str().map(str::to_string));
    let (Some(report), Some(id)) = (report, selected) else {
        return;
    };
    if let Some(group) = status.error_groups.iter_mut().find(|g| g.id == id) {
        group.status = match report.status {
            DispatchStatus::Success => GroupStatus::Completed,
            DispatchStatus::Failure => GroupStatus::Failed,
        };
        if report.status == DispatchStatus::Failure && !report.notes.is_empty() {
            status.execution_context.last_error =
                Some(format!("fixer failed on {id}: {}", report.notes));
        }
        status.completed_groups += 1;
    }
}

fn mark_selected_test_group(status: &mut UpgradeStatus) {
    let report = status
        .execution_context
        .variables
        .remove(VAR_TEST_DISPATCH_REPORT)
        .and_then(|v| serde_json::from_value::<DispatchReport>(v).ok());
    let selected = status
        .execution_context
        .variables
        .remove(VAR_SELECTED_TEST_GROUP)
        .and_then(|v| v.as_str().map(str::to_string));
    let (Some(report), Some(id)) = (report, selected) else {
        return;
    };
    if let Some(group) = status.test_groups.iter_mut().find(|g| g.id == id) {
        group.status = match report.status {
            DispatchStatus::Success => GroupStatus::Completed,
            DispatchStatus::Failure => GroupStatus::Failed,
        };
        if report.status == DispatchStatus::Failure && !report.notes.is_empty() {
            status.execution_context.last_error =
                Some(format!("test fixer failed on {id}: {}", report.notes));
        }
    }
}
