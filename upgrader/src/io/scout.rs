//! Read-only survey of harvested scout artifacts.
//!
//! Harvesting itself is an external collaborator; this module only inspects
//! the layout it leaves behind so worker context and reports can name the
//! evidence that exists.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// One harvested PR directory (`pr-<n>/`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoutPr {
    pub number: u64,
    pub description_path: Option<PathBuf>,
    pub patch_path: Option<PathBuf>,
}

/// Survey of one release's scout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoutRelease {
    pub dir: PathBuf,
    pub has_release_notes: bool,
    /// PR numbers listed in `declared_prs.txt`, when present.
    pub declared_prs: Vec<u64>,
    pub prs: Vec<ScoutPr>,
}

impl ScoutRelease {
    /// Declared PRs with no harvested directory yet.
    pub fn missing_prs(&self) -> Vec<u64> {
        self.declared_prs
            .iter()
            .copied()
            .filter(|n| !self.prs.iter().any(|pr| pr.number == *n))
            .collect()
    }
}

/// Survey a scout release directory. A missing directory yields an empty
/// survey rather than an error; the FSM treats that as "no evidence".
pub fn survey(dir: &Path) -> Result<ScoutRelease> {
    if !dir.is_dir() {
        debug!(dir = %dir.display(), "scout release directory absent");
        return Ok(ScoutRelease {
            dir: dir.to_path_buf(),
            has_release_notes: false,
            declared_prs: Vec::new(),
            prs: Vec::new(),
        });
    }

    let has_release_notes = dir.join("release-notes.md").is_file();
    let declared_prs = read_declared_prs(&dir.join("declared_prs.txt"))?;

    let mut prs = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("read scout dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read scout dir {}", dir.display()))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(number) = name.strip_prefix("pr-").and_then(|n| n.parse().ok()) else {
            continue;
        };
        let description = path.join("description.md");
        let patch = path.join("patch.diff");
        prs.push(ScoutPr {
            number,
            description_path: description.is_file().then_some(description),
            patch_path: patch.is_file().then_some(patch),
        });
    }
    prs.sort_by_key(|pr| pr.number);

    debug!(dir = %dir.display(), prs = prs.len(), has_release_notes, "scout survey");
    Ok(ScoutRelease {
        dir: dir.to_path_buf(),
        has_release_notes,
        declared_prs,
        prs,
    })
}

fn read_declared_prs(path: &Path) -> Result<Vec<u64>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(contents
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}
