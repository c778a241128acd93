use std::path::PathBuf;

use anyhow::Result;
use at_core::cancellation::CancellationToken;
use at_core::config::EngineConfig;
use at_daemon::orchestrator::RunOptions;
use at_daemon::supervisor;
use tracing::{error, info};

pub struct RunArgs {
    pub workspace: PathBuf,
    pub task_tree_root: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub target_branch: Option<String>,
    pub units: Vec<String>,
    pub dry_run: bool,
}

/// Drive the task tree at `args.workspace` to completion (or a dry-run
/// graph print), returning the process exit code.
pub async fn execute(args: RunArgs) -> Result<i32> {
    let workspace = args.workspace.canonicalize().unwrap_or(args.workspace.clone());

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
        task_tree_root: args.task_tree_root,
        parallelism: args.parallelism,
        target_branch: args.target_branch,
        units: if args.units.is_empty() { None } else { Some(args.units) },
        dry_run: args.dry_run,
    };

    let report = supervisor::supervise(workspace, config, options, cancel).await?;

    if report.succeeded() {
        info!("orchestrator run complete, all units succeeded");
        Ok(0)
    } else {
        let failed: Vec<&str> = report
            .units
            .iter()
            .filter(|u| u.status != at_core::types::UnitStatus::Complete)
            .map(|u| u.id.as_str())
            .collect();
        error!(?failed, "orchestrator run complete, some units did not succeed");
        Ok(1)
    }
}
