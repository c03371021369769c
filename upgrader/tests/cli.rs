//! CLI tests for the `init` and `plan` commands.
//!
//! Spawns the upgrader binary and verifies exit codes and output for the
//! commands that perform no build or dispatch work.

use std::process::Command;

use upgrader::exit_codes;
use upgrader::io::init::UpgradePaths;

fn upgrader(temp: &tempfile::TempDir, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_upgrader"))
        .current_dir(temp.path())
        .args(args)
        .output()
        .expect("run upgrader")
}

#[test]
fn init_creates_scaffold_and_is_idempotent() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = upgrader(&temp, &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));
    let paths = UpgradePaths::new(temp.path());
    assert!(paths.output_dir.is_dir());
    assert!(paths.handbook_path.is_file());

    let second = upgrader(&temp, &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&second.stdout);
    assert!(stdout.contains("already initialized"));
}

#[test]
fn plan_prints_instructions_without_touching_the_project() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = upgrader(
        &temp,
        &[
            "plan",
            "--old-tag",
            "polkadot-v1.14.0",
            "--new-tag",
            "polkadot-v1.15.0",
        ],
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("polkadot-v1.14.0 -> polkadot-v1.15.0"));
    assert!(stdout.contains("| SDK_BRANCH | v1.15.0 |"));
    // Plan is read-only.
    assert_eq!(std::fs::read_dir(temp.path()).expect("read dir").count(), 0);
}

#[test]
fn plan_rejects_identical_tags() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = upgrader(&temp, &["plan", "--old-tag", "v1", "--new-tag", "v1"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid upgrade request"));
}
