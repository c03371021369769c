//! Project scaffolding for an upgrade workspace.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

/// All canonical paths within an upgrade project root.
#[derive(Debug, Clone)]
pub struct UpgradePaths {
    pub root: PathBuf,
    pub output_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub resources_dir: PathBuf,
    pub scout_dir: PathBuf,
    pub status_path: PathBuf,
    pub config_path: PathBuf,
    pub handbook_path: PathBuf,
    pub migrations_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl UpgradePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let output_dir = root.join("output");
        let resources_dir = root.join("resources");
        Self {
            artifacts_dir: output_dir.join("artifacts"),
            logs_dir: output_dir.join("logs"),
            scout_dir: resources_dir.join("scout"),
            status_path: output_dir.join("status.json"),
            config_path: root.join("upgrader.toml"),
            handbook_path: resources_dir.join("upgrade-handbook.md"),
            migrations_path: resources_dir.join("migrations.md"),
            gitignore_path: output_dir.join(".gitignore"),
            output_dir,
            resources_dir,
            root,
        }
    }

    /// Scout release directory for one product/tag pair.
    pub fn scout_release_dir(&self, product: &str, tag: &str) -> PathBuf {
        self.scout_dir.join(format!("{product}-{tag}"))
    }

    pub fn upgrade_report_path(&self, new_tag: &str) -> PathBuf {
        self.output_dir.join(format!("upgrade-report-{new_tag}.md"))
    }

    pub fn test_report_path(&self, new_tag: &str) -> PathBuf {
        self.output_dir
            .join(format!("test-upgrade-report-{new_tag}.md"))
    }
}

/// Result of an [`initialize`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    /// Entries created by this call, in creation order (`DIR: ...` / `FILE: ...`).
    pub created: Vec<String>,
    pub already_initialized: bool,
}

/// Create the upgrade scaffold at `root`. Idempotent: a second call reports
/// `already_initialized` with an empty created list and overwrites nothing.
pub fn initialize(root: &Path) -> Result<InitOutcome> {
    let paths = UpgradePaths::new(root);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!("{} exists but is not a directory", root.display()));
    }
    // The handbook is written last, so its presence marks a finished scaffold.
    if paths.handbook_path.exists() {
        info!(root = %root.display(), "already initialized");
        return Ok(InitOutcome {
            created: Vec::new(),
            already_initialized: true,
        });
    }

    let mut created = Vec::new();
    for dir in [
        &paths.output_dir,
        &paths.artifacts_dir,
        &paths.logs_dir,
        &paths.resources_dir,
        &paths.scout_dir,
    ] {
        create_dir(dir, &mut created)?;
    }
    write_new_file(&paths.gitignore_path, OUTPUT_GITIGNORE, &mut created)?;
    write_new_file(&paths.migrations_path, MIGRATIONS_PLACEHOLDER, &mut created)?;
    write_new_file(&paths.handbook_path, HANDBOOK_PLACEHOLDER, &mut created)?;

    info!(root = %root.display(), created = created.len(), "initialized upgrade scaffold");
    Ok(InitOutcome {
        created,
        already_initialized: false,
    })
}

fn create_dir(path: &Path, created: &mut Vec<String>) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)
            .with_context(|| format!("create directory {}", path.display()))?;
        created.push(format!("DIR: {}", path.display()));
    }
    Ok(())
}

fn write_new_file(path: &Path, contents: &str, created: &mut Vec<String>) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))?;
    created.push(format!("FILE: {}", path.display()));
    Ok(())
}

const OUTPUT_GITIGNORE: &str = "artifacts/\nlogs/\nstatus.json\nstatus.json.tmp\n";
const MIGRATIONS_PLACEHOLDER: &str = "# Migration notes\n\n\
Record manual migration steps discovered during upgrades here.\n";
const HANDBOOK_PLACEHOLDER: &str = "# Upgrade handbook\n\n\
Project-specific guidance for fixer workers: build quirks, known-fragile\n\
crates, and review expectations. Edit freely; the orchestrator only reads\n\
this file when assembling worker context.\n";
