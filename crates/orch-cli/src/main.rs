//! `at`: the operator-facing CLI for the orchestrator engine. Runs the
//! engine in-process (there is no API server to talk to -- see
//! `at_daemon::orchestrator`) or reports status by reading the task tree's
//! on-disk frontmatter directly.

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use commands::run::RunArgs;
use commands::status::StatusArgs;

#[derive(Parser)]
#[command(name = "at", version, about = "Drive or inspect an orchestrator task tree")]
struct Cli {
    /// Workspace root containing `.orchestrator/config.toml` and the git repo.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator against the task tree until every unit reaches
    /// a terminal state, or until interrupted.
    Run {
        /// Override the task-tree root (defaults to config's `general.task_tree_root`).
        #[arg(long)]
        task_tree_root: Option<PathBuf>,

        /// Override the configured parallelism bound.
        #[arg(long)]
        parallelism: Option<usize>,

        /// Override the configured target branch that units merge into.
        #[arg(long)]
        target_branch: Option<String>,

        /// Restrict the run to this unit ID (and its transitive
        /// dependencies). May be given multiple times.
        #[arg(long = "unit")]
        units: Vec<String>,

        /// Validate and print the computed dependency graph without
        /// dispatching any work.
        #[arg(long)]
        dry_run: bool,
    },

    /// Print a tree view of every unit and task, read straight from
    /// on-disk frontmatter.
    Status {
        /// Override the task-tree root (defaults to config's `general.task_tree_root`).
        #[arg(long)]
        task_tree_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    at_telemetry::logging::init_logging("at-cli", "info");

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Run { task_tree_root, parallelism, target_branch, units, dry_run } => {
            commands::run::execute(RunArgs {
                workspace: cli.workspace,
                task_tree_root,
                parallelism,
                target_branch,
                units,
                dry_run,
            })
            .await?
        }
        Commands::Status { task_tree_root } => {
            commands::status::execute(StatusArgs { workspace: cli.workspace, task_tree_root })?
        }
    };

    std::process::exit(code);
}
