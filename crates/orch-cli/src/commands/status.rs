use std::path::PathBuf;

use anyhow::Result;
use at_core::config::EngineConfig;
use at_core::discovery;
use at_core::state_writer;

pub struct StatusArgs {
    pub workspace: PathBuf,
    pub task_tree_root: Option<PathBuf>,
}

/// Print a tree view of every discovered unit and its tasks, reconstituted
/// straight from the on-disk frontmatter -- no running daemon required.
pub fn execute(args: StatusArgs) -> Result<i32> {
    let workspace = args.workspace.canonicalize().unwrap_or(args.workspace.clone());
    let config = EngineConfig::load(&workspace).unwrap_or_default();
    let task_tree_root = args
        .task_tree_root
        .unwrap_or_else(|| workspace.join(&config.general.task_tree_root));

    let discovered = discovery::discover(&task_tree_root);
    if !discovered.errors.is_empty() {
        for err in &discovered.errors {
            eprintln!("error: {err}");
        }
    }

    if discovered.units.is_empty() {
        println!("no units found under {}", task_tree_root.display());
        return Ok(if discovered.is_valid() { 0 } else { 1 });
    }

    let mut any_failed = false;
    for unit in &discovered.units {
        let status = state_writer::read_unit_status(&task_tree_root, &unit.id)
            .ok()
            .flatten()
            .unwrap_or_else(|| "pending".to_string());
        if status == "failed" {
            any_failed = true;
        }
        println!("{} [{status}]", unit.id);
        for task in &unit.tasks {
            println!("  {:02} {} [{}]", task.number, task.title, task.status);
        }
    }

    Ok(if discovered.is_valid() && !any_failed { 0 } else { 1 })
}
