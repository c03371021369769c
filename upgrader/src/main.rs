//! Upgrade orchestrator CLI.
//!
//! Drives a persisted state machine that bumps dependency tags, verifies the
//! build, dispatches fixer workers for grouped diagnostics, and re-verifies
//! every claimed fix before declaring the upgrade complete.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use upgrader::exit_codes;
use upgrader::io::build_check::CargoCheckRunner;
use upgrader::io::config::{UpgraderConfig, load_config};
use upgrader::io::dispatch::ProcessDispatcher;
use upgrader::io::init::{UpgradePaths, initialize};
use upgrader::looping::{LoopStop, run_upgrade_loop};
use upgrader::tick::run_tick;
use upgrader::upgrade::prepare_upgrade;

#[derive(Parser)]
#[command(
    name = "upgrader",
    version,
    about = "Resumable dependency upgrade orchestrator"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the upgrade scaffold (output/, resources/, handbook) if missing.
    Init {
        /// Project root.
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Validate tags and print the run instructions without touching anything.
    Plan {
        #[arg(long)]
        old_tag: String,
        #[arg(long)]
        new_tag: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Advance the state machine by exactly one planned-then-applied tick.
    Tick {
        #[arg(long)]
        old_tag: String,
        #[arg(long)]
        new_tag: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Run the full upgrade loop until the machine reaches END.
    Upgrade {
        #[arg(long)]
        old_tag: String,
        #[arg(long)]
        new_tag: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
}

fn main() {
    upgrader::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { path } => cmd_init(&path),
        Command::Plan {
            old_tag,
            new_tag,
            path,
        } => cmd_plan(&path, &old_tag, &new_tag),
        Command::Tick {
            old_tag,
            new_tag,
            path,
        } => cmd_tick(&path, &old_tag, &new_tag),
        Command::Upgrade {
            old_tag,
            new_tag,
            path,
        } => cmd_upgrade(&path, &old_tag, &new_tag),
    }
}

fn cmd_init(path: &PathBuf) -> Result<i32> {
    let outcome = initialize(path)?;
    if outcome.already_initialized {
        println!("already initialized: {}", path.display());
    } else {
        for entry in &outcome.created {
            println!("{entry}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_plan(path: &PathBuf, old_tag: &str, new_tag: &str) -> Result<i32> {
    let paths = UpgradePaths::new(path.clone());
    let cfg = load_config(&paths.config_path)?;
    let plan = prepare_upgrade(path, old_tag, new_tag, &cfg)?;
    print!("{}", plan.instructions);
    Ok(exit_codes::OK)
}

fn cmd_tick(path: &PathBuf, old_tag: &str, new_tag: &str) -> Result<i32> {
    let paths = UpgradePaths::new(path.clone());
    let cfg = load_config(&paths.config_path)?;
    prepare_upgrade(path, old_tag, new_tag, &cfg)?;
    initialize(path)?;
    let (checker, dispatcher) = backends(&paths, &cfg);
    let outcome = run_tick(path, &checker, &dispatcher, &cfg, old_tag, new_tag)?;
    println!(
        "{} -> {} ({} steps)",
        outcome.state_before.as_str(),
        outcome.state_after.as_str(),
        outcome.steps_executed
    );
    if let Some(report) = outcome.report_path {
        println!("report: {}", report.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_upgrade(path: &PathBuf, old_tag: &str, new_tag: &str) -> Result<i32> {
    let paths = UpgradePaths::new(path.clone());
    let cfg = load_config(&paths.config_path)?;
    let plan = prepare_upgrade(path, old_tag, new_tag, &cfg)?;
    print!("{}", plan.instructions);
    initialize(path)?;

    let (checker, dispatcher) = backends(&paths, &cfg);
    let outcome = run_upgrade_loop(
        path,
        &checker,
        &dispatcher,
        &cfg,
        old_tag,
        new_tag,
        |tick| {
            println!(
                "{} -> {} ({} steps)",
                tick.state_before.as_str(),
                tick.state_after.as_str(),
                tick.steps_executed
            );
            if let Some(report) = &tick.report_path {
                println!("report: {}", report.display());
            }
        },
    )?;

    let code = match outcome.stop {
        LoopStop::Complete => exit_codes::OK,
        LoopStop::ErrorReport { .. } => exit_codes::UNRESOLVED,
        LoopStop::TestErrorReport => exit_codes::TEST_UNRESOLVED,
    };
    Ok(code)
}

fn backends(paths: &UpgradePaths, cfg: &UpgraderConfig) -> (CargoCheckRunner, ProcessDispatcher) {
    let checker = CargoCheckRunner {
        workdir: paths.root.clone(),
        artifact_dir: paths.artifacts_dir.clone(),
        build_command: cfg.build_command.clone(),
        test_command: cfg.test_command.clone(),
        timeout: Duration::from_secs(cfg.check_timeout_secs),
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let dispatcher = ProcessDispatcher {
        command: cfg.agent_command.clone(),
    };
    (checker, dispatcher)
}
