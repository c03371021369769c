//! Loop-level tests for full upgrade lifecycle scenarios.
//!
//! These drive `run_upgrade_loop` with scripted check and dispatch backends
//! to verify end-to-end behavior: resume from a persisted status, failed
//! fixer handling, the test-fix cycle, and loop termination.

use upgrader::core::types::{DispatchReport, DispatchStatus, GroupStatus, Level, State, UpgradeStatus};
use upgrader::io::build_check::{CheckMode, CheckOutcome};
use upgrader::looping::{LoopStop, run_upgrade_loop};
use upgrader::test_support::{
    ScriptedCheckRunner, ScriptedDispatcher, TestProject, clean_outcome, diag, failing_outcome,
};

fn success() -> Result<DispatchReport, anyhow::Error> {
    Ok(DispatchReport {
        status: DispatchStatus::Success,
        notes: String::new(),
    })
}

fn failure(notes: &str) -> Result<DispatchReport, anyhow::Error> {
    Ok(DispatchReport {
        status: DispatchStatus::Failure,
        notes: notes.to_string(),
    })
}

/// A test run outcome carrying libtest failures. `run_tests` only consumes
/// the failure list, so no artifact is needed.
fn test_outcome(failures: &[&str]) -> CheckOutcome {
    CheckOutcome {
        exit_code: Some(if failures.is_empty() { 0 } else { 101 }),
        diagnostics: Vec::new(),
        test_failures: failures.iter().map(|s| s.to_string()).collect(),
        artifact_path: None,
    }
}

/// Interrupting a run loses nothing: a loop started against a persisted
/// mid-run status picks up at that state instead of from scratch.
#[test]
fn resume_from_persisted_status_continues_mid_run() {
    let project = TestProject::new();
    let mut status = UpgradeStatus::new("v1", "v2", "now".to_string());
    status.current_state = State::TestWorkspace;
    project.write_status(&status);

    let checker = ScriptedCheckRunner::new(vec![test_outcome(&[])]);
    let dispatcher = ScriptedDispatcher::new(vec![]);

    let outcome = run_upgrade_loop(
        &project.root(),
        &checker,
        &dispatcher,
        &project.config,
        "ignored",
        "ignored-too",
        |_| {},
    )
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.ticks, 2);
    // Only the test run executed; the build phase was already behind us.
    assert_eq!(checker.modes(), vec![CheckMode::Test]);
    let persisted = project.read_status();
    assert_eq!(persisted.current_state, State::End);
    assert_eq!(persisted.iteration, 1);
    assert!(project.paths.upgrade_report_path("v2").is_file());
}

/// Scenario: the fixer fails on the detected group, re-verification shows
/// the error persisting, a fresh cycle dispatches again and succeeds.
///
/// Execution sequence:
/// 1. CHECK_ERRORS finds 1 error -> 1 group
/// 2. EXECUTE/SPAWN dispatches it -> fixer reports failure
/// 3. UPDATE marks it failed; re-verification still sees the error -> restart
/// 4. CHECK_ERRORS re-detects the group; the second fixer succeeds
/// 5. UPDATE re-verifies clean; TEST_WORKSPACE is clean -> COMPLETE
#[test]
fn failed_fixer_is_archived_and_the_run_recovers() {
    let project = TestProject::new();
    let mut status = UpgradeStatus::new("v1", "v2", "now".to_string());
    status.current_state = State::CheckErrors;
    project.write_status(&status);

    let artifacts = &project.paths.artifacts_dir;
    let persisting = || {
        failing_outcome(
            artifacts,
            vec![diag("E0502", "cannot borrow `x`", Level::Error)],
        )
    };
    let checker = ScriptedCheckRunner::new(vec![
        persisting(),
        persisting(),
        persisting(),
        clean_outcome(artifacts),
        test_outcome(&[]),
    ]);
    let dispatcher = ScriptedDispatcher::new(vec![failure("no applicable fix"), success()]);

    let outcome = run_upgrade_loop(
        &project.root(),
        &checker,
        &dispatcher,
        &project.config,
        "v1",
        "v2",
        |_| {},
    )
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    let requests = dispatcher.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.agent == "bug-fixer"));

    let persisted = project.read_status();
    assert_eq!(persisted.current_state, State::End);
    // The failed group survives in the archive, never deleted.
    assert!(
        persisted
            .completed_error_groups
            .iter()
            .any(|g| g.status == GroupStatus::Failed)
    );
    // The successful cycle counted exactly one processed group.
    assert_eq!(persisted.completed_groups, 1);
    assert!(
        persisted
            .error_groups
            .iter()
            .all(|g| g.status == GroupStatus::Completed)
    );
    assert_eq!(
        checker.modes(),
        vec![
            CheckMode::Build,
            CheckMode::Build,
            CheckMode::Build,
            CheckMode::Build,
            CheckMode::Test,
        ]
    );
}

/// Scenario: the build is clean but tests fail; failures are grouped by
/// module, a tests-fixer runs, and the mandatory re-run verifies the fix.
#[test]
fn test_failures_cycle_through_fixers_and_reverify() {
    let project = TestProject::new();
    let mut status = UpgradeStatus::new("v1", "v2", "now".to_string());
    status.current_state = State::TestWorkspace;
    project.write_status(&status);

    let checker = ScriptedCheckRunner::new(vec![
        test_outcome(&["store::tests::round_trip", "store::tests::atomic"]),
        test_outcome(&[]),
    ]);
    let dispatcher = ScriptedDispatcher::new(vec![success()]);

    let outcome = run_upgrade_loop(
        &project.root(),
        &checker,
        &dispatcher,
        &project.config,
        "v1",
        "v2",
        |_| {},
    )
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::Complete);
    let requests = dispatcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].agent, "tests-fixer");
    assert_eq!(requests[0].context["module"], "store::tests");
    assert_eq!(
        requests[0].context["tests"],
        serde_json::json!(["store::tests::round_trip", "store::tests::atomic"])
    );

    let persisted = project.read_status();
    assert_eq!(persisted.test_groups.len(), 1);
    assert_eq!(persisted.test_groups[0].status, GroupStatus::Completed);
    // One verifying pass, one fixing cycle, one re-verifying pass.
    assert_eq!(persisted.iteration, 2);
}

/// Scenario: every test fixer fails and the failures persist, so the run
/// reports instead of spinning on groups with no remaining leverage.
#[test]
fn persistent_test_failures_end_in_a_test_report() {
    let project = TestProject::new();
    let mut status = UpgradeStatus::new("v1", "v2", "now".to_string());
    status.current_state = State::TestWorkspace;
    project.write_status(&status);

    let checker = ScriptedCheckRunner::new(vec![
        test_outcome(&["store::tests::round_trip"]),
        test_outcome(&["store::tests::round_trip"]),
    ]);
    let dispatcher = ScriptedDispatcher::new(vec![failure("still broken")]);

    let outcome = run_upgrade_loop(
        &project.root(),
        &checker,
        &dispatcher,
        &project.config,
        "v1",
        "v2",
        |_| {},
    )
    .expect("loop");

    assert_eq!(outcome.stop, LoopStop::TestErrorReport);
    assert!(project.paths.test_report_path("v2").is_file());
    let persisted = project.read_status();
    assert_eq!(persisted.current_state, State::End);
    assert!(
        persisted
            .execution_context
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("test failures persist"))
    );
}
