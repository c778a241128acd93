//! End-to-end coverage of the Worker against a real on-disk git repo: a
//! fixture with an actual `git worktree add` checkout and a bare "origin"
//! remote, a scripted stand-in for the agent subprocess that edits task
//! frontmatter the way a real agent turn would, and assertions against the
//! resulting git history and task status rather than internal state.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use at_agents::agent_adapter::{AgentAdapter, AgentCommand};
use at_agents::worker::{BaselineCheck, Worker, WorkerError, WorkerSettings};
use at_core::cancellation::CancellationToken;
use at_core::discovery;
use at_core::events::EventBus;
use at_core::state_writer::StateWriter;
use at_core::worktree_manager::WorktreeManager;

fn run(dir: &Path, args: &[&str]) {
    let output = std::process::Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// A fixture repo with one unit ("unit-a") holding a single pending task,
/// plus a bare "origin" remote so `push_and_request_pr`'s push has
/// somewhere real to land.
struct Fixture {
    _tmp: tempfile::TempDir,
    repo_dir: PathBuf,
    bare_dir: PathBuf,
    worktree_base: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let repo_dir = tmp.path().join("repo");
        let bare_dir = tmp.path().join("origin.git");
        let worktree_base = tmp.path().join("worktrees");
        std::fs::create_dir_all(&repo_dir).unwrap();

        run(&repo_dir, &["init"]);
        run(&repo_dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        run(&repo_dir, &["config", "user.email", "dev@example.com"]);
        run(&repo_dir, &["config", "user.name", "Orchestrator"]);

        let unit_dir = repo_dir.join("tasks").join("unit-a");
        std::fs::create_dir_all(&unit_dir).unwrap();
        std::fs::write(
            unit_dir.join("IMPLEMENTATION_PLAN.md"),
            "---\nunit: unit-a\ndepends_on: []\n---\n# unit-a\n",
        )
        .unwrap();
        std::fs::write(
            unit_dir.join("01-task.md"),
            "---\ntask: 1\ntitle: \"do the thing\"\nstatus: pending\nbackpressure: \"true\"\ndepends_on: []\n---\ndo it.\n",
        )
        .unwrap();

        run(&repo_dir, &["add", "-A"]);
        run(&repo_dir, &["commit", "-m", "init"]);

        let output = std::process::Command::new("git")
            .args(["clone", "--bare", repo_dir.to_str().unwrap(), bare_dir.to_str().unwrap()])
            .output()
            .unwrap();
        assert!(output.status.success());

        run(&repo_dir, &["remote", "add", "origin", bare_dir.to_str().unwrap()]);
        run(&repo_dir, &["push", "origin", "main"]);

        Self {
            _tmp: tmp,
            repo_dir,
            bare_dir,
            worktree_base,
        }
    }

    fn discover_unit_a(&self) -> at_core::types::Unit {
        let result = discovery::discover(&self.repo_dir.join("tasks"));
        assert!(result.is_valid(), "fixture tasks tree is invalid: {:?}", result.errors);
        result.units.into_iter().find(|u| u.id == "unit-a").unwrap()
    }

    /// Write an executable script that ignores its argv (the rendered
    /// prompt) and instead mutates the task files directly under its
    /// current directory — the same "agent edits files, Worker re-reads
    /// frontmatter" contract a real agent turn honours, just without an LLM
    /// behind it.
    fn agent_script(&self, body: &str) -> AgentAdapter {
        let path = self.repo_dir.parent().unwrap().join("fake_agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\nset -e\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
        }
        AgentAdapter::new(
            AgentCommand::new(vec![path.to_str().unwrap().to_string()]),
            Duration::from_secs(10),
        )
    }

    fn worker(&self, agent: AgentAdapter, max_agent_retries: u32) -> Worker {
        let worktree_manager = Arc::new(WorktreeManager::new(&self.repo_dir, &self.worktree_base, "orch"));
        let state_writer = Arc::new(StateWriter::new(self.repo_dir.join("tasks")));
        let bus = EventBus::start(64, vec![]).sender();
        let settings = WorkerSettings {
            task_tree_root: PathBuf::from("tasks"),
            target_branch: "main".to_string(),
            max_agent_retries,
            max_baseline_retries: 1,
            baseline_checks: Vec::new(),
            keep_failed_worktrees: false,
        };
        Worker::new(worktree_manager, state_writer, Arc::new(agent), bus, settings)
    }
}

/// The task's own `status: pending` line is rewritten to `complete` and the
/// change committed; the Worker must detect it, run the task's backpressure
/// command, commit, then push the branch to the real "origin" remote.
#[tokio::test]
async fn run_completes_single_task_unit_and_pushes_branch() {
    let fixture = Fixture::new();
    let agent = fixture.agent_script(
        r#"for f in $(grep -rl "status: pending" tasks 2>/dev/null); do
  sed -i "s/status: pending/status: complete/" "$f"
  exit 0
done
exit 0"#,
    );
    let worker = fixture.worker(agent, 3);
    let unit = fixture.discover_unit_a();
    let cancel = CancellationToken::new();

    let worktree = worker.run(&unit, &cancel).await.unwrap();

    let reloaded = discovery::discover(&worktree.path.join("tasks"));
    assert!(reloaded.is_valid());
    let unit_a = reloaded.units.into_iter().find(|u| u.id == "unit-a").unwrap();
    assert!(unit_a.all_tasks_complete());

    // Task completion was committed inside the worktree.
    let log = std::process::Command::new("git")
        .current_dir(&worktree.path)
        .args(["log", "--oneline"])
        .output()
        .unwrap();
    let log = String::from_utf8_lossy(&log.stdout);
    assert!(log.contains("task 1"));

    // The branch landed on the bare remote.
    let branches = std::process::Command::new("git")
        .current_dir(&fixture.bare_dir)
        .args(["branch", "--list", &worktree.branch])
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&branches.stdout).contains(&worktree.branch));

    // Phase 1 setup persisted branch/worktree into the main tree's plan file.
    let plan = std::fs::read_to_string(fixture.repo_dir.join("tasks/unit-a/IMPLEMENTATION_PLAN.md")).unwrap();
    assert!(plan.contains("orch_branch"));
    assert!(plan.contains(&worktree.branch));
}

/// A backpressure command that never passes reverts the task to pending and
/// emits a retry rather than accepting it; an agent that never makes
/// progress at all (the no-op script below) exhausts the bounded retry
/// count and the unit fails without ever pushing a branch.
#[tokio::test]
async fn run_fails_after_exhausting_agent_retries_on_no_progress() {
    let fixture = Fixture::new();
    // Does nothing to the task tree — the agent "tried" but made no progress.
    let agent = fixture.agent_script("exit 0");
    let worker = fixture.worker(agent, 2);
    let unit = fixture.discover_unit_a();
    let cancel = CancellationToken::new();

    let err = worker.run(&unit, &cancel).await.unwrap_err();
    assert!(matches!(err, WorkerError::AgentRetriesExhausted(2)));

    // No worktree is left behind: finalize() ran and keep_failed_worktrees is false.
    let worktree_path = fixture.worktree_base.join("unit-a");
    assert!(!worktree_path.exists());
}

#[tokio::test]
async fn baseline_check_failure_is_reported_after_retries_exhausted() {
    let fixture = Fixture::new();
    // The lone task completes on the first turn so the loop reaches Phase 3.
    let agent = fixture.agent_script(
        r#"for f in $(grep -rl "status: pending" tasks 2>/dev/null); do
  sed -i "s/status: pending/status: complete/" "$f"
  exit 0
done
exit 0"#,
    );
    let worktree_manager = Arc::new(WorktreeManager::new(&fixture.repo_dir, &fixture.worktree_base, "orch"));
    let state_writer = Arc::new(StateWriter::new(fixture.repo_dir.join("tasks")));
    let bus = EventBus::start(64, vec![]).sender();
    let settings = WorkerSettings {
        task_tree_root: PathBuf::from("tasks"),
        target_branch: "main".to_string(),
        max_agent_retries: 3,
        max_baseline_retries: 1,
        baseline_checks: vec![BaselineCheck {
            name: "lint".to_string(),
            command: "false".to_string(),
        }],
        keep_failed_worktrees: false,
    };
    let worker = Worker::new(worktree_manager, state_writer, Arc::new(agent), bus, settings);
    let unit = fixture.discover_unit_a();
    let cancel = CancellationToken::new();

    let err = worker.run(&unit, &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        WorkerError::BaselineRetriesExhausted { ref check, attempts: 1 } if check == "lint"
    ));
}
