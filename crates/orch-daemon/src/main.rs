//! Orchestrator supervisor: loads config, discovers the task tree, and
//! drives every unit to completion or a terminal failure. No API server
//! and no frontend — the whole engine runs in this one process.

use std::path::PathBuf;

use anyhow::Result;
use at_core::cancellation::CancellationToken;
use at_core::config::EngineConfig;
use at_daemon::orchestrator::RunOptions;
use at_daemon::supervisor;
use clap::Parser;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "at-daemon", about = "Runs the orchestrator against a task tree until every unit is terminal")]
struct Cli {
    /// Workspace root containing `.orchestrator/config.toml` and the git repo.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Override the task-tree root (defaults to config's `general.task_tree_root`).
    #[arg(long)]
    task_tree_root: Option<PathBuf>,

    /// Override the configured parallelism bound.
    #[arg(long)]
    parallelism: Option<usize>,

    /// Override the configured target branch that units merge into.
    #[arg(long)]
    target_branch: Option<String>,

    /// Restrict the run to these unit IDs (and their transitive
    /// dependencies). May be given multiple times.
    #[arg(long = "unit")]
    units: Vec<String>,

    /// Validate and print the computed dependency graph without dispatching
    /// any work.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    at_telemetry::logging::init_logging("at-daemon", "info");

    let cli = Cli::parse();
    let workspace = cli.workspace.canonicalize().unwrap_or(cli.workspace.clone());

    let config = EngineConfig::load(&workspace).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    let options = RunOptions {
        task_tree_root: cli.task_tree_root,
        parallelism: cli.parallelism,
        target_branch: cli.target_branch,
        units: if cli.units.is_empty() { None } else { Some(cli.units) },
        dry_run: cli.dry_run,
    };

    let report = supervisor::supervise(workspace, config, options, cancel).await?;

    if report.succeeded() {
        info!("orchestrator run complete, all units succeeded");
        Ok(())
    } else {
        let failed: Vec<&str> = report
            .units
            .iter()
            .filter(|u| u.status != at_core::types::UnitStatus::Complete)
            .map(|u| u.id.as_str())
            .collect();
        error!(?failed, "orchestrator run complete, some units did not succeed");
        std::process::exit(1);
    }
}
