//! Lockfile-guarded wrapper around [`orchestrator::run`], shared by the
//! `at-daemon` binary and `at-cli`'s `run` subcommand so neither has to
//! duplicate the acquire/run/release sequence.

use std::path::PathBuf;

use anyhow::{Context, Result};
use at_core::cancellation::CancellationToken;
use at_core::config::EngineConfig;
use at_core::lockfile::{AcquireResult, DaemonLockfile};
use tracing::{error, info};

use crate::orchestrator::{self, OrchestratorError, RunOptions, RunReport};

/// Acquire the workspace lockfile, run the engine to completion (or until
/// `cancel` fires), and release the lockfile regardless of outcome.
pub async fn supervise(
    workspace: PathBuf,
    config: EngineConfig,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let lockfile = DaemonLockfile {
        pid: std::process::id(),
        started_at: chrono::Utc::now().to_rfc3339(),
        project_path: Some(workspace.display().to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match lockfile
        .acquire(&workspace)
        .context("failed to acquire orchestrator lockfile")?
    {
        AcquireResult::Acquired => {}
        AcquireResult::AlreadyRunning(existing) => {
            anyhow::bail!(
                "orchestrator already running against this workspace (pid={})",
                existing.pid
            );
        }
        AcquireResult::StaleRemoved => {
            lockfile
                .acquire(&workspace)
                .context("failed to acquire orchestrator lockfile after stale cleanup")?;
        }
    }

    info!(workspace = %workspace.display(), "orchestrator starting");
    let result = orchestrator::run(workspace.clone(), config, options, cancel).await;
    DaemonLockfile::remove(&workspace);

    match result {
        Ok(report) => Ok(report),
        Err(OrchestratorError::InvalidTaskTree(n)) => {
            error!(count = n, "task tree validation failed");
            Err(OrchestratorError::InvalidTaskTree(n).into())
        }
        Err(err) => {
            error!(%err, "orchestrator run failed");
            Err(err.into())
        }
    }
}
