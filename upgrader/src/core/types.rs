//! Shared deterministic types for the upgrade state machine.
//!
//! These types define stable contracts between core components and the
//! persisted status document. They must not depend on external state or I/O
//! and must serialize identically across runs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// States of the upgrade state machine.
///
/// `End` is the only terminal state and is reached exclusively through
/// `Complete`, `ErrorReport`, or `TestErrorReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Init,
    ScoutArtifacts,
    UpdateDeps,
    CheckErrors,
    Execute,
    Spawn,
    Update,
    TestWorkspace,
    CheckTests,
    ExecuteTestFix,
    SpawnTestFixer,
    Complete,
    ErrorReport,
    TestErrorReport,
    End,
}

impl State {
    pub fn is_terminal(self) -> bool {
        self == State::End
    }

    /// States that emit a final report artifact before reaching `End`.
    pub fn is_report(self) -> bool {
        matches!(
            self,
            State::Complete | State::ErrorReport | State::TestErrorReport
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Init => "INIT",
            State::ScoutArtifacts => "SCOUT_ARTIFACTS",
            State::UpdateDeps => "UPDATE_DEPS",
            State::CheckErrors => "CHECK_ERRORS",
            State::Execute => "EXECUTE",
            State::Spawn => "SPAWN",
            State::Update => "UPDATE",
            State::TestWorkspace => "TEST_WORKSPACE",
            State::CheckTests => "CHECK_TESTS",
            State::ExecuteTestFix => "EXECUTE_TEST_FIX",
            State::SpawnTestFixer => "SPAWN_TEST_FIXER",
            State::Complete => "COMPLETE",
            State::ErrorReport => "ERROR_REPORT",
            State::TestErrorReport => "TEST_ERROR_REPORT",
            State::End => "END",
        }
    }
}

/// Severity of a single compiler/test message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Error,
    Warning,
    Note,
    Help,
}

impl Level {
    /// Classify a raw cargo `level` string. Cargo emits variants like
    /// `"error: internal compiler error"`, so this matches by substring.
    pub fn from_raw(raw: &str) -> Option<Level> {
        if raw.contains("error") {
            Some(Level::Error)
        } else if raw.contains("warning") {
            Some(Level::Warning)
        } else if raw.contains("note") {
            Some(Level::Note)
        } else if raw.contains("help") {
            Some(Level::Help)
        } else {
            None
        }
    }
}

/// One structured compiler or test message, reduced to the fields the
/// grouper needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub message: String,
    pub code: Option<String>,
    pub level: Level,
    pub file: Option<String>,
    pub line: Option<u64>,
    /// First backtick-delimited token of `message`, `"unknown"` if none.
    pub symbol: String,
}

/// Processing status of an error or test group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Pending,
    Completed,
    Failed,
}

/// A bucket of same-code/same-symbol diagnostics processed as one fix unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup {
    /// Stable id derived from (code, symbol, ordinal).
    pub id: String,
    pub error_code: String,
    pub symbol: String,
    /// Always equals `errors.len()`.
    pub count: usize,
    pub errors: Vec<Diagnostic>,
    pub status: GroupStatus,
}

/// One failing test, as reported by the test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestFailure {
    /// Full test path, e.g. `core::grouper::tests::sorts_by_count`.
    pub name: String,
}

/// Failing tests of one module, processed as one fix unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestGroup {
    pub id: String,
    pub module: String,
    pub tests: Vec<String>,
    pub status: GroupStatus,
}

/// Phase marker for the test-fix cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestPhase {
    Verifying,
    Fixing,
}

/// One primitive orchestration step, executed strictly in array order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Run a shell command, capturing stdout into `variables[output_var]`.
    /// Commands matching a builtin check name route to the `CheckRunner`.
    Bash {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_var: Option<String>,
    },
    /// Invoke the worker dispatcher with an agent id and context object.
    SpawnAgent {
        agent: String,
        context: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_var: Option<String>,
    },
    /// Set one dotted field path in the persisted status.
    UpdateStatus { field: String, value: Value },
    /// Run a named parser over an input, storing structured output.
    Parse {
        parser: String,
        input: String,
        output_var: String,
    },
    /// Test existence of a path, storing a boolean.
    CheckFile { path: String, exists_var: String },
}

/// Mutable scratch space shared by steps within and across ticks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub variables: Map<String, Value>,
    #[serde(default)]
    pub last_command_output: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// The persisted status document: the single source of truth between ticks.
///
/// Unknown fields present in a loaded file survive a write-back unchanged
/// (they are carried in `extra`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStatus {
    pub current_state: State,
    #[serde(default)]
    pub next_state: Option<State>,
    #[serde(default)]
    pub pending_steps: Vec<Step>,
    #[serde(default)]
    pub execution_context: ExecutionContext,
    pub strategy: String,
    pub created_at: String,
    pub old_tag: String,
    pub new_tag: String,
    pub iteration: u32,
    #[serde(default)]
    pub error_groups: Vec<ErrorGroup>,
    #[serde(default)]
    pub completed_error_groups: Vec<ErrorGroup>,
    pub completed_groups: u32,
    #[serde(default)]
    pub test_groups: Vec<TestGroup>,
    #[serde(default)]
    pub test_phase: Option<TestPhase>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UpgradeStatus {
    /// Fresh status for a new run, positioned at `INIT`.
    pub fn new(old_tag: &str, new_tag: &str, created_at: String) -> Self {
        Self {
            current_state: State::Init,
            next_state: None,
            pending_steps: Vec::new(),
            execution_context: ExecutionContext::default(),
            strategy: "error_based_sequential".to_string(),
            created_at,
            old_tag: old_tag.to_string(),
            new_tag: new_tag.to_string(),
            iteration: 0,
            error_groups: Vec::new(),
            completed_error_groups: Vec::new(),
            completed_groups: 0,
            test_groups: Vec::new(),
            test_phase: None,
            extra: Map::new(),
        }
    }

    /// First group still awaiting a fixer, in the grouper's stable order.
    pub fn first_pending_group(&self) -> Option<&ErrorGroup> {
        self.error_groups
            .iter()
            .find(|g| g.status == GroupStatus::Pending)
    }

    pub fn first_pending_test_group(&self) -> Option<&TestGroup> {
        self.test_groups
            .iter()
            .find(|g| g.status == GroupStatus::Pending)
    }
}

/// Outcome reported by a dispatched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Success,
    Failure,
}

/// Structured result of one worker dispatch.
///
/// A `success` here is never sufficient to mark a group complete; the
/// `UPDATE` state always re-verifies with a fresh build check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub status: DispatchStatus,
    #[serde(default)]
    pub notes: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&State::ScoutArtifacts).expect("serialize");
        assert_eq!(json, "\"SCOUT_ARTIFACTS\"");
        let back: State = serde_json::from_str("\"TEST_ERROR_REPORT\"").expect("parse");
        assert_eq!(back, State::TestErrorReport);
    }

    #[test]
    fn steps_round_trip_with_type_tag() {
        let step = Step::Parse {
            parser: "error_grouper".to_string(),
            input: "{{check_artifact}}".to_string(),
            output_var: "error_groups".to_string(),
        };
        let json = serde_json::to_value(&step).expect("serialize");
        assert_eq!(json["type"], "parse");
        let back: Step = serde_json::from_value(json).expect("parse");
        assert_eq!(back, step);
    }

    #[test]
    fn level_from_raw_matches_substrings() {
        assert_eq!(Level::from_raw("error"), Some(Level::Error));
        assert_eq!(
            Level::from_raw("error: internal compiler error"),
            Some(Level::Error)
        );
        assert_eq!(Level::from_raw("warning"), Some(Level::Warning));
        assert_eq!(Level::from_raw("ice"), None);
    }

    #[test]
    fn first_pending_group_respects_order() {
        let mut status = UpgradeStatus::new("v1", "v2", "now".to_string());
        status.error_groups = vec![
            ErrorGroup {
                id: "a".to_string(),
                error_code: "E1".to_string(),
                symbol: "x".to_string(),
                count: 1,
                errors: Vec::new(),
                status: GroupStatus::Completed,
            },
            ErrorGroup {
                id: "b".to_string(),
                error_code: "E2".to_string(),
                symbol: "y".to_string(),
                count: 1,
                errors: Vec::new(),
                status: GroupStatus::Pending,
            },
        ];
        assert_eq!(status.first_pending_group().expect("pending").id, "b");
    }
}
