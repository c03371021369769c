//! Persisted state machine that orchestrates dependency upgrades.
//!
//! An upgrade run walks a fixed set of states from `INIT` to `END`: update
//! the dependency tags, verify the build, group compiler diagnostics, hand
//! each group to a fixer worker, re-verify every claimed fix, then do the
//! same for test failures. Progress lives in `output/status.json`, so a run
//! can be interrupted and resumed at any point. The architecture enforces a
//! strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (transitions, step planning,
//!   diagnostic grouping, variable substitution). No I/O, fully testable in
//!   isolation.
//! - **[`io`]**: Side-effecting operations (status persistence, process
//!   execution, worker dispatch, report rendering). Behind trait seams to
//!   enable scripted backends in tests.
//!
//! Orchestration modules ([`steps`], [`tick`], [`looping`], [`upgrade`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod steps;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tick;
pub mod upgrade;
