//! The Worker: drives one unit from a freshly created worktree through its
//! tasks, baseline checks, and branch push.
//!
//! Phases, per unit:
//! 1. Setup — create the worktree, persist branch/worktree to frontmatter.
//! 2. Task loop — compute the ready task set, hand it to the agent, detect
//!    which task(s) it completed by re-reading frontmatter, run that task's
//!    backpressure command, commit on success.
//! 3. Baseline — once every task is complete, run the unit's baseline checks
//!    (format/lint/typecheck), agent-assisted fix on failure.
//! 4. Push + PR request — push the branch and ask the agent to open the PR.
//!    Finding the PR number and driving it through review live in the
//!    review adapter, not here.
//!
//! The Worker never interprets the agent's stdout as a protocol: "did the
//! agent do what it was asked" is always measured by re-reading frontmatter
//! and running the task's own backpressure command.

use std::path::{Path, PathBuf};

use at_core::cancellation::CancellationToken;
use at_core::discovery;
use at_core::events::{Event, EventKind, EventSender};
use at_core::git_adapter::{GitAdapter, GitAdapterPolicy};
use at_core::state_writer::StateWriter;
use at_core::types::{Task, TaskStatus, Unit};
use at_core::worktree_manager::{WorktreeInfo, WorktreeManager};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::agent_adapter::{AgentAdapter, AgentRequest};
use crate::prompts::{self, PromptKind, ReviewCommentSlot, TaskSlot, UnitContext};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worktree setup failed: {0}")]
    Worktree(#[from] at_core::worktree_manager::WorktreeManagerError),
    #[error("state write failed: {0}")]
    StateWrite(#[from] at_core::state_writer::StateWriterError),
    #[error("git operation failed: {0}")]
    Git(#[from] at_core::git_adapter::GitAdapterError),
    #[error("repo path error: {0}")]
    Repo(#[from] at_core::repo::RepoError),
    #[error("no ready tasks but unit is not complete — likely a dependency deadlock")]
    Deadlock,
    #[error("exhausted {0} agent attempts without completing a task")]
    AgentRetriesExhausted(u32),
    #[error("baseline check {check} failed after {attempts} agent-assisted fix attempts")]
    BaselineRetriesExhausted { check: String, attempts: u32 },
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// A single named baseline check run in Phase 3 once every task is complete.
#[derive(Debug, Clone)]
pub struct BaselineCheck {
    pub name: String,
    pub command: String,
}

/// Static configuration a Worker needs for every unit it drives.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Path (relative to the worktree root) at which the task tree lives.
    pub task_tree_root: PathBuf,
    pub target_branch: String,
    pub max_agent_retries: u32,
    pub max_baseline_retries: u32,
    pub baseline_checks: Vec<BaselineCheck>,
    pub keep_failed_worktrees: bool,
}

/// Drives a single unit from worktree creation through branch push.
pub struct Worker {
    worktree_manager: std::sync::Arc<WorktreeManager>,
    state_writer: std::sync::Arc<StateWriter>,
    agent: std::sync::Arc<AgentAdapter>,
    bus: EventSender,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        worktree_manager: std::sync::Arc<WorktreeManager>,
        state_writer: std::sync::Arc<StateWriter>,
        agent: std::sync::Arc<AgentAdapter>,
        bus: EventSender,
        settings: WorkerSettings,
    ) -> Self {
        Self { worktree_manager, state_writer, agent, bus, settings }
    }

    /// Run a unit to completion (or a terminal failure). `unit` is the
    /// immutable model Discovery built before the worktree existed; the
    /// Worker re-discovers the unit inside the worktree after every agent
    /// turn to see what actually changed.
    pub async fn run(&self, unit: &Unit, cancel: &CancellationToken) -> Result<WorktreeInfo> {
        let worktree = self.setup(unit).await?;

        if let Err(err) = self.drive_to_pr(unit, &worktree, cancel).await {
            // Cancellation leaves the worktree in place so a subsequent run
            // can resume from on-disk file state; every other failure here
            // is this function's to clean up, since the review phase
            // (driven separately, after a PR exists) does its own finalize
            // once its own outcome is known.
            if !matches!(err, WorkerError::Cancelled) {
                self.finalize(&unit.id, &worktree, false).await;
            }
            return Err(err);
        }

        Ok(worktree)
    }

    /// Resume a unit recovered from a prior run's `in_progress` frontmatter
    /// state: the worktree and branch already exist on disk, so this skips
    /// straight to the task loop rather than re-running Phase 1 setup.
    /// `reload_unit` inside `run_task_loop` re-reads current task status from
    /// the worktree, so a unit interrupted mid-task resumes exactly where
    /// its frontmatter says it left off.
    pub async fn resume(&self, unit: &Unit, worktree: &WorktreeInfo, cancel: &CancellationToken) -> Result<()> {
        if let Err(err) = self.drive_to_pr(unit, worktree, cancel).await {
            if !matches!(err, WorkerError::Cancelled) {
                self.finalize(&unit.id, worktree, false).await;
            }
            return Err(err);
        }
        Ok(())
    }

    async fn drive_to_pr(&self, unit: &Unit, worktree: &WorktreeInfo, cancel: &CancellationToken) -> Result<()> {
        self.run_task_loop(unit, worktree, cancel).await?;
        self.run_baseline_checks(unit, worktree, cancel).await?;
        self.push_and_request_pr(unit, worktree, cancel).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Phase 1 — setup
    // -----------------------------------------------------------------

    async fn setup(&self, unit: &Unit) -> Result<WorktreeInfo> {
        let worktree = self
            .worktree_manager
            .create_for_unit(&unit.id, &self.settings.target_branch)
            .await?;

        let payload = json!({
            "branch": worktree.branch,
            "worktree": worktree.path.display().to_string(),
        });
        self.bus.emit(
            Event::for_unit(EventKind::WorktreeCreated, &unit.id).with_payload(payload.clone()),
        );
        self.state_writer
            .set_unit_started(&unit.id, &worktree.branch, &worktree.path.display().to_string())?;
        self.bus
            .emit(Event::for_unit(EventKind::UnitStarted, &unit.id).with_payload(payload));

        info!(unit_id = %unit.id, branch = %worktree.branch, "unit worktree ready");
        Ok(worktree)
    }

    // -----------------------------------------------------------------
    // Phase 2 — task loop
    // -----------------------------------------------------------------

    async fn run_task_loop(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stalled_attempts = 0u32;
        let mut started: std::collections::HashSet<u32> = std::collections::HashSet::new();

        loop {
            if cancel.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }

            let current = self.reload_unit(unit)?;
            if current.all_tasks_complete() {
                return Ok(());
            }

            let ready = current.ready_tasks();
            if ready.is_empty() {
                self.bus.emit(
                    Event::for_unit(EventKind::UnitFailed, &unit.id)
                        .with_error("no ready tasks; dependency deadlock"),
                );
                return Err(WorkerError::Deadlock);
            }

            for task in &ready {
                if started.insert(task.number) {
                    self.bus.emit(Event::for_task(EventKind::TaskStarted, &unit.id, task.number));
                }
            }

            let before: Vec<(u32, TaskStatus)> =
                current.tasks.iter().map(|t| (t.number, t.status)).collect();

            let prompt = PromptKind::TaskExecution {
                unit: UnitContext::from_unit(&current),
                ready_tasks: ready.iter().map(|t| TaskSlot::from_task(t)).collect(),
            };
            self.invoke_agent(unit, worktree, &prompt, cancel).await?;

            let after = self.reload_unit(unit)?;
            let newly_complete: Vec<&Task> = after
                .tasks
                .iter()
                .filter(|t| {
                    t.status == TaskStatus::Complete
                        && before
                            .iter()
                            .any(|(n, s)| *n == t.number && *s != TaskStatus::Complete)
                })
                .collect();

            if newly_complete.is_empty() {
                stalled_attempts += 1;
                warn!(unit_id = %unit.id, attempts = stalled_attempts, "agent turn made no progress");
                if stalled_attempts >= self.settings.max_agent_retries {
                    for task in &ready {
                        self.bus.emit(
                            Event::for_task(EventKind::TaskFailed, &unit.id, task.number)
                                .with_error("agent made no progress before unit retries were exhausted"),
                        );
                    }
                    self.bus.emit(
                        Event::for_unit(EventKind::UnitFailed, &unit.id)
                            .with_error("agent made no progress on ready task set"),
                    );
                    return Err(WorkerError::AgentRetriesExhausted(self.settings.max_agent_retries));
                }
                continue;
            }

            let mut any_accepted = false;
            for task in newly_complete {
                self.bus.emit(Event::for_task(EventKind::TaskAgentDone, &unit.id, task.number));
                if self.validate_and_commit_task(unit, worktree, task)? {
                    any_accepted = true;
                } else {
                    // Backpressure failure retries unboundedly by re-invoking the
                    // agent on the next loop iteration — only a genuinely idle
                    // turn (no newly-complete task at all) counts toward the
                    // bounded agent-retry limit below.
                    self.state_writer.set_task_status(&task.file_path, "pending")?;
                    self.bus.emit(Event::for_task(EventKind::TaskRetry, &unit.id, task.number));
                }
            }

            if any_accepted {
                stalled_attempts = 0;
            }
        }
    }

    /// Run a completed task's acceptance check and commit on success.
    /// Returns `true` if the task is genuinely accepted.
    fn validate_and_commit_task(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        task: &Task,
    ) -> Result<bool> {
        let passed = run_shell(&worktree.path, &task.backpressure);
        if !passed {
            warn!(unit_id = %unit.id, task = task.number, "backpressure check failed, reverting task to pending");
            self.bus.emit(
                Event::for_task(EventKind::TaskBackpressureFail, &unit.id, task.number),
            );
            self.bus.emit(
                Event::for_task(EventKind::TaskValidationFail, &unit.id, task.number)
                    .with_error(format!("backpressure command failed: {}", task.backpressure)),
            );
            return Ok(false);
        }

        self.bus
            .emit(Event::for_task(EventKind::TaskValidationOk, &unit.id, task.number));

        let adapter = self.git_adapter_for(worktree)?;
        adapter.write(&["add", "-A"])?;
        let message = format!("task {}: {}", task.number, task.title);
        adapter.write(&["commit", "-m", &message])?;

        self.bus.emit(Event::for_task(EventKind::TaskCommitted, &unit.id, task.number));
        self.bus.emit(Event::for_task(EventKind::TaskCompleted, &unit.id, task.number));
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Phase 3 — baseline checks
    // -----------------------------------------------------------------

    async fn run_baseline_checks(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for check in &self.settings.baseline_checks {
            let mut attempts = 0u32;
            loop {
                if cancel.is_cancelled() {
                    return Err(WorkerError::Cancelled);
                }
                if run_shell(&worktree.path, &check.command) {
                    break;
                }

                attempts += 1;
                if attempts > self.settings.max_baseline_retries {
                    self.bus.emit(
                        Event::for_unit(EventKind::UnitFailed, &unit.id)
                            .with_error(format!("baseline check {} never passed", check.name)),
                    );
                    return Err(WorkerError::BaselineRetriesExhausted {
                        check: check.name.clone(),
                        attempts: self.settings.max_baseline_retries,
                    });
                }

                let current = self.reload_unit(unit)?;
                let output = capture_shell(&worktree.path, &check.command);
                let prompt = PromptKind::BaselineFix {
                    unit: UnitContext::from_unit(&current),
                    check_name: check.name.clone(),
                    output,
                };
                self.invoke_agent(unit, worktree, &prompt, cancel).await?;

                let adapter = self.git_adapter_for(worktree)?;
                adapter.write(&["add", "-A"])?;
                let _ = adapter.write(&["commit", "-m", &format!("fix: {}", check.name)]);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Phase 4 (partial) — push + request PR
    // -----------------------------------------------------------------

    async fn push_and_request_pr(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let adapter = self.git_adapter_for(worktree)?;
        adapter.write(&["push", "-u", "origin", &worktree.branch])?;
        self.bus.emit(Event::for_unit(EventKind::BranchPushed, &unit.id));

        let current = self.reload_unit(unit)?;
        let prompt = PromptKind::PrCreate {
            unit: UnitContext::from_unit(&current),
            base_branch: self.settings.target_branch.clone(),
        };
        self.invoke_agent(unit, worktree, &prompt, cancel).await?;
        Ok(())
    }

    /// Address reviewer feedback on an already-open PR. Exposed for the
    /// review adapter to call back into once it has unresolved comments to
    /// hand off — the Worker owns the only agent invocation path for a
    /// unit's worktree.
    pub async fn address_feedback(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        pr_number: u64,
        comments: Vec<ReviewCommentSlot>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self.reload_unit(unit)?;
        let prompt = PromptKind::PrFeedbackAddress {
            unit: UnitContext::from_unit(&current),
            pr_number,
            comments,
        };
        self.invoke_agent(unit, worktree, &prompt, cancel).await?;
        let adapter = self.git_adapter_for(worktree)?;
        adapter.write(&["add", "-A"])?;
        let _ = adapter.write(&["commit", "-m", &format!("address review feedback on #{pr_number}")]);
        adapter.write(&["push", "origin", &worktree.branch])?;
        Ok(())
    }

    /// Ask the agent to resolve a rebase conflict. Leaves the resolution
    /// staged; it is the caller's responsibility to drive `rebase
    /// --continue` since only the review adapter's merge sequence knows
    /// where in the rebase it is.
    pub async fn resolve_conflict(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        target_branch: &str,
        conflict_files: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self.reload_unit(unit)?;
        let prompt = PromptKind::ConflictResolve {
            unit: UnitContext::from_unit(&current),
            target_branch: target_branch.to_string(),
            conflict_files,
        };
        self.invoke_agent(unit, worktree, &prompt, cancel).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------

    /// The worktree manager backing this Worker, exposed so the review
    /// adapter's merge sequence can build its own `GitAdapter` against the
    /// same worktree the task loop set up, without duplicating its own copy
    /// of the worktree lifecycle.
    pub fn worktree_manager(&self) -> &std::sync::Arc<WorktreeManager> {
        &self.worktree_manager
    }

    /// Phase 4 — cleanup. Removes the worktree and deletes its local branch
    /// on terminal success, or on terminal failure unless
    /// `keep_failed_worktrees` is configured. Called by the orchestrator
    /// once a unit reaches a terminal status, after both the worker and
    /// review phases (if any) have resolved.
    pub async fn finalize(&self, unit_id: &str, worktree: &WorktreeInfo, succeeded: bool) {
        if !succeeded && self.settings.keep_failed_worktrees {
            info!(unit_id = %unit_id, "keeping worktree for a failed unit per configuration");
            return;
        }
        match self.worktree_manager.remove(worktree).await {
            Ok(()) => {
                self.bus.emit(Event::for_unit(EventKind::WorktreeRemoved, unit_id));
            }
            Err(err) => {
                warn!(unit_id = %unit_id, %err, "failed to remove worktree during cleanup");
            }
        }
    }

    /// Invoke the agent in `worktree` with a rendered prompt. `cancel` is
    /// threaded into the subprocess invocation itself — a shutdown request
    /// kills the in-flight agent process rather than waiting for the turn
    /// to finish on its own.
    async fn invoke_agent(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        prompt: &PromptKind,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.bus.emit(Event::for_unit(EventKind::TaskAgentInvoked, &unit.id));
        let request = AgentRequest {
            working_dir: worktree.path.clone(),
            prompt: prompts::render(prompt),
            max_turns: None,
        };
        match self.agent.invoke(&request, cancel.subscribe()).await {
            Ok(response) => {
                info!(unit_id = %unit.id, exit_code = response.exit_code, "agent turn finished");
                Ok(())
            }
            Err(crate::agent_adapter::AgentAdapterError::Cancelled) => Err(WorkerError::Cancelled),
            Err(err) => {
                warn!(unit_id = %unit.id, %err, "agent invocation error");
                Ok(())
            }
        }
    }

    fn git_adapter_for(&self, worktree: &WorktreeInfo) -> Result<GitAdapter> {
        let repo = self.worktree_manager.repo_path_for_worktree(worktree);
        let policy = GitAdapterPolicy {
            required_branch: Some(worktree.branch.clone()),
            ..GitAdapterPolicy::default()
        };
        Ok(GitAdapter::new(repo, policy))
    }

    /// Re-read the unit from inside its worktree — the source of truth for
    /// task status once the agent has had a turn.
    fn reload_unit(&self, unit: &Unit) -> Result<Unit> {
        // Worktree layout mirrors the main tree: worktree root joined with
        // the task-tree root contains the same `<unit-id>/` directory.
        let worktree_root = self
            .worktree_manager
            .worktree_path(&unit.id)
            .join(&self.settings.task_tree_root);
        let result = discovery::discover(&worktree_root);
        result
            .units
            .into_iter()
            .find(|u| u.id == unit.id)
            .ok_or_else(|| {
                WorkerError::Repo(at_core::repo::RepoError::PathNotFound(format!(
                    "unit {} not found in worktree after discovery",
                    unit.id
                )))
            })
    }
}

fn run_shell(dir: &Path, command: &str) -> bool {
    std::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(dir)
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn capture_shell(dir: &Path, command: &str) -> String {
    match std::process::Command::new("sh").arg("-c").arg(command).current_dir(dir).output() {
        Ok(output) => format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
        Err(e) => format!("failed to run check: {e}"),
    }
}
