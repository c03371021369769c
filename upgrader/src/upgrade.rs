//! Upgrade-run preparation: tag validation, the derived configuration
//! block, and the rendered run instructions.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use minijinja::Environment;
use serde::Serialize;

use crate::io::config::UpgraderConfig;
use crate::io::init::UpgradePaths;

const INSTRUCTIONS_TEMPLATE: &str = include_str!("instructions.md");

/// Rejected input, raised before any state is touched. Detected via
/// `err.downcast_ref::<ValidationError>()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub detail: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid upgrade request: {}", self.detail)
    }
}

impl std::error::Error for ValidationError {}

/// Resolved parameters for one upgrade run, also rendered into the
/// instructions' configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeConfig {
    pub project_root: String,
    pub old_tag: String,
    pub new_tag: String,
    /// Release branch name: the tag with any `polkadot-` prefix stripped.
    pub sdk_branch: String,
    pub status_file: String,
    pub scout_dir: String,
    pub resources_dir: String,
    pub output_dir: String,
    pub upgrade_report_path: String,
    pub test_report_path: String,
    pub max_iterations: u32,
}

/// A validated, ready-to-run upgrade.
#[derive(Debug, Clone)]
pub struct UpgradePlan {
    pub config: UpgradeConfig,
    /// Human-readable run instructions with all parameters substituted.
    pub instructions: String,
}

/// Validate tags and derive the run configuration. Performs no side
/// effects; a missing or empty tag is a `ValidationError` and leaves the
/// project untouched.
pub fn prepare_upgrade(
    root: &Path,
    old_tag: &str,
    new_tag: &str,
    cfg: &UpgraderConfig,
) -> Result<UpgradePlan> {
    for (name, value) in [("old_tag", old_tag), ("new_tag", new_tag)] {
        if value.trim().is_empty() {
            return Err(anyhow!(ValidationError {
                detail: format!("{name} is required"),
            }));
        }
    }
    if old_tag == new_tag {
        return Err(anyhow!(ValidationError {
            detail: "old_tag and new_tag must differ".to_string(),
        }));
    }

    let paths = UpgradePaths::new(root);
    let config = UpgradeConfig {
        project_root: paths.root.display().to_string(),
        old_tag: old_tag.to_string(),
        new_tag: new_tag.to_string(),
        sdk_branch: sdk_branch(new_tag),
        status_file: paths.status_path.display().to_string(),
        scout_dir: paths
            .scout_release_dir(&cfg.product, new_tag)
            .display()
            .to_string(),
        resources_dir: paths.resources_dir.display().to_string(),
        output_dir: paths.output_dir.display().to_string(),
        upgrade_report_path: paths.upgrade_report_path(new_tag).display().to_string(),
        test_report_path: paths.test_report_path(new_tag).display().to_string(),
        max_iterations: cfg.max_iterations,
    };
    let instructions = render_instructions(&config)?;
    Ok(UpgradePlan {
        config,
        instructions,
    })
}

/// Release branch for a tag: `polkadot-v1.15.0` lives on branch `v1.15.0`.
fn sdk_branch(new_tag: &str) -> String {
    new_tag
        .strip_prefix("polkadot-")
        .unwrap_or(new_tag)
        .to_string()
}

fn render_instructions(config: &UpgradeConfig) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("instructions", INSTRUCTIONS_TEMPLATE)
        .expect("instructions template should be valid");
    env.get_template("instructions")
        .expect("template registered above")
        .render(config)
        .context("render instructions template")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tag_is_a_validation_error_with_no_side_effects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = prepare_upgrade(temp.path(), "", "polkadot-v1.15.0", &UpgraderConfig::default())
            .unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
        // Nothing was created under the project root.
        assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
    }

    #[test]
    fn identical_tags_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = prepare_upgrade(temp.path(), "v1", "v1", &UpgraderConfig::default()).unwrap_err();
        assert!(err.downcast_ref::<ValidationError>().is_some());
    }

    #[test]
    fn sdk_branch_strips_polkadot_prefix() {
        assert_eq!(sdk_branch("polkadot-v1.15.0"), "v1.15.0");
        assert_eq!(sdk_branch("v1.15.0"), "v1.15.0");
    }

    #[test]
    fn instructions_carry_the_config_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = prepare_upgrade(
            temp.path(),
            "polkadot-v1.14.0",
            "polkadot-v1.15.0",
            &UpgraderConfig::default(),
        )
        .expect("prepare");
        assert_eq!(plan.config.sdk_branch, "v1.15.0");
        assert!(plan.instructions.contains("polkadot-v1.14.0 -> polkadot-v1.15.0"));
        assert!(plan.instructions.contains("| MAX_ITERATIONS | 40 |"));
        assert!(
            plan.instructions
                .contains(&plan.config.status_file)
        );
        // No unresolved template tokens remain.
        assert!(!plan.instructions.contains("{{"));
    }
}
