//! Final report artifacts for the terminal states.
//!
//! Every run that reaches `COMPLETE`, `ERROR_REPORT`, or `TEST_ERROR_REPORT`
//! leaves a human-readable summary behind, naming unresolved groups and the
//! recommended manual steps.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::info;

use crate::core::types::{ErrorGroup, GroupStatus, State, UpgradeStatus};
use crate::io::init::UpgradePaths;

const COMPLETE_TEMPLATE: &str = include_str!("templates/complete_report.md");
const ERROR_TEMPLATE: &str = include_str!("templates/error_report.md");
const TEST_ERROR_TEMPLATE: &str = include_str!("templates/test_error_report.md");

#[derive(Debug, Serialize)]
struct GroupRow {
    id: String,
    error_code: String,
    symbol: String,
    count: usize,
    status: String,
    sample: String,
}

impl GroupRow {
    fn from_group(group: &ErrorGroup) -> Self {
        Self {
            id: group.id.clone(),
            error_code: group.error_code.clone(),
            symbol: group.symbol.clone(),
            count: group.count,
            status: match group.status {
                GroupStatus::Pending => "pending",
                GroupStatus::Completed => "completed",
                GroupStatus::Failed => "failed",
            }
            .to_string(),
            sample: group
                .errors
                .first()
                .map(|d| d.message.clone())
                .unwrap_or_default(),
        }
    }
}

fn report_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.add_template("complete", COMPLETE_TEMPLATE)
        .expect("complete template should be valid");
    env.add_template("error", ERROR_TEMPLATE)
        .expect("error template should be valid");
    env.add_template("test_error", TEST_ERROR_TEMPLATE)
        .expect("test error template should be valid");
    env
}

/// Render and write the report for a terminal-report state, returning the
/// artifact path.
pub fn write_final_report(
    state: State,
    status: &UpgradeStatus,
    paths: &UpgradePaths,
    max_iterations: u32,
    generated_at: &str,
) -> Result<PathBuf> {
    let env = report_env();
    let open_groups: Vec<GroupRow> = status
        .error_groups
        .iter()
        .filter(|g| g.status != GroupStatus::Completed)
        .map(GroupRow::from_group)
        .collect();
    let archived_groups: Vec<GroupRow> = status
        .completed_error_groups
        .iter()
        .chain(status.error_groups.iter())
        .map(GroupRow::from_group)
        .collect();
    let scout_dir = paths.scout_dir.display().to_string();

    let (template, path) = match state {
        State::Complete => ("complete", paths.upgrade_report_path(&status.new_tag)),
        State::ErrorReport => ("error", paths.upgrade_report_path(&status.new_tag)),
        State::TestErrorReport => ("test_error", paths.test_report_path(&status.new_tag)),
        other => return Err(anyhow!("{} is not a report state", other.as_str())),
    };

    let rendered = env
        .get_template(template)?
        .render(context! {
            old_tag => status.old_tag,
            new_tag => status.new_tag,
            iteration => status.iteration,
            max_iterations => max_iterations,
            generated_at => generated_at,
            last_error => status.execution_context.last_error,
            open_groups => open_groups,
            archived_groups => archived_groups,
            test_groups => status.test_groups,
            scout_dir => scout_dir,
        })
        .context("render report template")?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report dir {}", parent.display()))?;
    }
    fs::write(&path, rendered).with_context(|| format!("write report {}", path.display()))?;
    info!(path = %path.display(), state = state.as_str(), "wrote final report");
    Ok(path)
}
