//! Drive ticks until the state machine reaches `END`.

use std::path::Path;

use anyhow::{Result, bail};
use tracing::info;

use crate::core::types::State;
use crate::io::build_check::CheckRunner;
use crate::io::config::UpgraderConfig;
use crate::io::dispatch::WorkerDispatcher;
use crate::tick::{TickOutcome, run_tick};

/// Reason why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// Build and tests are clean; the upgrade landed.
    Complete,
    /// Build errors could not be resolved (iteration budget or exhausted
    /// fixers); see the upgrade report.
    ErrorReport { iteration_limit: bool },
    /// The workspace builds but test failures could not be resolved.
    TestErrorReport,
}

/// Result of a completed loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub ticks: usize,
    /// Iteration counter at the end of the run.
    pub iterations: u32,
    pub last_error: Option<String>,
}

/// Run ticks until `END`, invoking `on_tick` after each one.
///
/// The tick budget is a backstop against a planner bug; a healthy run is
/// bounded by the iteration cap long before it triggers.
pub fn run_upgrade_loop<C, D, F>(
    root: &Path,
    checker: &C,
    dispatcher: &D,
    cfg: &UpgraderConfig,
    old_tag: &str,
    new_tag: &str,
    mut on_tick: F,
) -> Result<LoopOutcome>
where
    C: CheckRunner,
    D: WorkerDispatcher,
    F: FnMut(&TickOutcome),
{
    let max_ticks = (cfg.max_iterations as usize + 2) * 64;
    let mut ticks = 0usize;
    loop {
        if ticks >= max_ticks {
            bail!("loop exceeded {max_ticks} ticks without terminating");
        }
        let outcome = run_tick(root, checker, dispatcher, cfg, old_tag, new_tag)?;
        ticks += 1;
        on_tick(&outcome);

        if outcome.state_after == State::End {
            let iteration_limit = outcome
                .last_error
                .as_deref()
                .is_some_and(|e| e.contains("iteration limit exceeded"));
            let stop = match outcome.state_before {
                State::Complete => LoopStop::Complete,
                State::ErrorReport => LoopStop::ErrorReport { iteration_limit },
                State::TestErrorReport => LoopStop::TestErrorReport,
                // END is terminal-only; a direct END-to-END tick means the
                // run had already finished before we started.
                other => {
                    info!(state = other.as_str(), "loop resumed an already-finished run");
                    LoopStop::Complete
                }
            };
            let iterations = final_iteration(root)?;
            info!(ticks, iterations, ?stop, "upgrade loop finished");
            return Ok(LoopOutcome {
                stop,
                ticks,
                iterations,
                last_error: outcome.last_error,
            });
        }
    }
}

// Every tick persists before returning, so the status file exists by the
// time the machine reaches END.
fn final_iteration(root: &Path) -> Result<u32> {
    let paths = crate::io::init::UpgradePaths::new(root);
    let status = crate::io::status_store::load(&paths.status_path)?;
    Ok(status.iteration)
}
