//! Engine wiring: Discovery -> Scheduler -> Worker -> Review Adapter,
//! glued together by the event bus. This is the single function both
//! `at-daemon`'s and `at-cli`'s `run` command call into — there is no
//! separate client/server split, since the engine has no API surface of
//! its own to serve.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use at_agents::agent_adapter::{AgentAdapter, AgentCommand};
use at_agents::worker::{BaselineCheck, Worker, WorkerSettings};
use at_core::cancellation::CancellationToken;
use at_core::config::EngineConfig;
use at_core::discovery;
use at_core::events::{Event, EventHandler, EventKind};
use at_core::lockfile::MergeLock;
use at_core::state_writer::{RecoveredUnit, StateWriterHandler};
use at_core::types::{Unit, UnitStatus};
use at_core::worktree_manager::{WorktreeInfo, WorktreeManager};
use at_integrations::github::client::GitHubClient;
use at_integrations::github::review::{ReviewAdapter, ReviewSettings};
use at_integrations::types::GitHubConfig as GitHubClientConfig;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::scheduler::{DispatchOutcome, Scheduler};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task tree validation failed with {0} error(s); see log for detail")]
    InvalidTaskTree(usize),
    #[error("unit {0} requested via --unit was not found in the task tree")]
    UnknownUnit(String),
    #[error("github client setup failed: {0}")]
    GitHub(#[from] at_integrations::github::client::GitHubError),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Overrides a caller (the CLI's `run` subcommand, or the daemon's own
/// startup) may apply on top of the loaded [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub task_tree_root: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub target_branch: Option<String>,
    /// Restrict the run to these units and their transitive dependencies.
    pub units: Option<Vec<String>>,
    /// Validate and print the computed graph without dispatching any work.
    pub dry_run: bool,
}

/// What happened to one unit over the course of a run, for the caller's
/// exit-code decision and any summary it wants to print.
#[derive(Debug, Clone)]
pub struct UnitOutcome {
    pub id: String,
    pub status: UnitStatus,
}

#[derive(Debug)]
pub struct RunReport {
    pub units: Vec<UnitOutcome>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.units.iter().all(|u| u.status == UnitStatus::Complete)
    }
}

/// Run the task tree under `config`/`options` to completion (every unit
/// terminal) or until `cancel` is triggered. Mirrors the teacher's
/// main.rs shutdown pattern minus the HTTP/Leptos frontend it serves: the
/// caller installs the ctrl-c handler, this function just honors the token.
pub async fn run(
    workspace: PathBuf,
    config: EngineConfig,
    options: RunOptions,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let task_tree_root = options
        .task_tree_root
        .unwrap_or_else(|| workspace.join(&config.general.task_tree_root));
    let target_branch = options.target_branch.unwrap_or(config.general.target_branch.clone());
    let parallelism = options.parallelism.unwrap_or(config.scheduler.parallelism);

    let discovered = discovery::discover(&task_tree_root);
    if !discovered.is_valid() {
        for err in &discovered.errors {
            error!(%err, "task tree validation error");
        }
        return Err(OrchestratorError::InvalidTaskTree(discovered.errors.len()));
    }

    let units = select_units(discovered.units, options.units.as_deref())?;

    if options.dry_run {
        print_graph(&units, parallelism);
        return Ok(RunReport {
            units: units.iter().map(|u| UnitOutcome { id: u.id.clone(), status: UnitStatus::Ready }).collect(),
        });
    }

    // The Scheduler needs a bus sender to exist, and the bridge needs the
    // Scheduler — broken via a cell the bridge reads lazily, since by the
    // time any event it cares about arrives the Scheduler is always set.
    let scheduler_cell: Arc<OnceLock<Arc<Scheduler>>> = Arc::new(OnceLock::new());

    let root_for_handlers = task_tree_root.clone();
    let mut handlers: Vec<Box<dyn EventHandler>> = vec![
        Box::new(StateWriterHandler::new(root_for_handlers)),
        Box::new(LogSinkHandler),
        Box::new(SchedulerBridge { scheduler: scheduler_cell.clone() }),
    ];
    if config.forwarder.enabled {
        let graph = serde_json::json!({
            "parallelism": parallelism.max(1),
            "units": units.iter().map(|u| serde_json::json!({
                "id": u.id,
                "depends_on": u.depends_on,
                "task_count": u.tasks.len(),
            })).collect::<Vec<_>>(),
        });
        match crate::forwarder::ForwarderHandler::connect(config.forwarder.clone(), graph) {
            Ok(handler) => handlers.push(Box::new(handler)),
            Err(err) => warn!(%err, "event forwarder disabled: could not start"),
        }
    }

    let bus = at_core::events::EventBus::start(config.event_bus.buffer_size, handlers);
    let sender = bus.sender();
    sender.emit(Event::new(EventKind::EngineStarted));

    let recovered = recover_unit_states(&task_tree_root, &units);
    let scheduler = Arc::new(Scheduler::with_recovered(
        &units,
        parallelism.max(1),
        sender.clone(),
        &recovered.iter().map(|(id, r)| (id.clone(), r.status)).collect(),
    ));
    scheduler_cell.set(scheduler.clone()).ok();

    let worktree_manager = Arc::new(WorktreeManager::new(
        workspace.clone(),
        workspace.join(&config.general.worktree_base),
        config.general.branch_prefix.clone(),
    ));
    let state_writer = Arc::new(at_core::state_writer::StateWriter::new(task_tree_root.clone()));
    let agent_command = if config.worker.agent_command.is_empty() {
        AgentCommand::default_command()
    } else {
        AgentCommand::new(config.worker.agent_command.clone())
    };
    let agent = Arc::new(AgentAdapter::new(
        agent_command,
        Duration::from_secs(config.worker.agent_timeout_secs),
    ));
    let worker_settings = WorkerSettings {
        task_tree_root: PathBuf::from(&config.general.task_tree_root),
        target_branch: target_branch.clone(),
        max_agent_retries: config.worker.max_agent_retries,
        max_baseline_retries: config.worker.max_baseline_retries,
        baseline_checks: config
            .worker
            .baseline_checks
            .iter()
            .map(|c| BaselineCheck { name: c.name.clone(), command: c.command.clone() })
            .collect(),
        keep_failed_worktrees: config.general.keep_failed_worktrees,
    };
    let worker = Arc::new(Worker::new(
        worktree_manager.clone(),
        state_writer.clone(),
        agent.clone(),
        sender.clone(),
        worker_settings,
    ));

    let github_client = github_client_from_config(&config.github)?;
    let merge_lock = Arc::new(MergeLock::new());
    let review_settings = ReviewSettings {
        target_branch: target_branch.clone(),
        poll_interval: Duration::from_secs(config.review.poll_interval_secs),
        review_timeout: Duration::from_secs(config.review.review_timeout_secs),
        ci_gate: config.review.ci_gate,
        max_conflict_rounds: 3,
    };
    let review = github_client.map(|client| {
        Arc::new(ReviewAdapter::new(
            client,
            worker.clone(),
            worktree_manager.clone(),
            merge_lock.clone(),
            sender.clone(),
            review_settings,
        ))
    });

    let mut in_flight: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    // Units recovered as active (in_progress or one of the PR phases) are
    // already counted active by the scheduler but will never come out of
    // `dispatch()` — they're resumed directly here, by their recorded
    // branch/worktree/PR number, instead of going through worktree setup
    // again.
    for (id, recovered_unit) in &recovered {
        if !recovered_unit.status.is_active() {
            continue;
        }
        let Some(unit) = units.iter().find(|u| &u.id == id) else { continue };
        let Some(branch) = recovered_unit.branch.clone() else {
            warn!(unit_id = %id, "recovered unit has no recorded branch to resume from");
            scheduler.fail(id, "recovered in-flight unit has no recorded branch");
            continue;
        };
        let worktree = match worktree_manager.resume_for_unit(id, &branch, &target_branch) {
            Ok(wt) => wt,
            Err(err) => {
                warn!(unit_id = %id, %err, "failed to resume recorded worktree");
                scheduler.fail(id, err.to_string());
                continue;
            }
        };
        let handle = tokio::spawn(resume_unit(
            unit.clone(),
            scheduler.clone(),
            worker.clone(),
            review.clone(),
            cancel.clone(),
            recovered_unit.status,
            worktree,
            recovered_unit.pr_number,
        ));
        in_flight.push(handle);
    }

    loop {
        if cancel.is_cancelled() {
            info!("cancellation requested, draining in-flight units");
            break;
        }
        match scheduler.dispatch() {
            DispatchOutcome::Dispatched(id) => {
                let unit = units.iter().find(|u| u.id == id).expect("dispatched unit exists").clone();
                let handle = tokio::spawn(run_unit(
                    unit,
                    scheduler.clone(),
                    worker.clone(),
                    review.clone(),
                    cancel.clone(),
                ));
                in_flight.push(handle);
            }
            DispatchOutcome::AllComplete | DispatchOutcome::AllBlocked => break,
            DispatchOutcome::AtCapacity | DispatchOutcome::NoReadyUnits => {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    for handle in in_flight {
        let _ = handle.await;
    }

    sender.emit(Event::new(EventKind::EngineShutdown));

    let report = RunReport {
        units: units
            .iter()
            .map(|u| UnitOutcome {
                id: u.id.clone(),
                status: scheduler.get_state(&u.id).map(|rt| rt.status).unwrap_or(UnitStatus::Pending),
            })
            .collect(),
    };
    Ok(report)
}

async fn run_unit(
    unit: Unit,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    review: Option<Arc<ReviewAdapter>>,
    cancel: CancellationToken,
) {
    let worktree: WorktreeInfo = match worker.run(&unit, &cancel).await {
        Ok(wt) => wt,
        Err(err) => {
            warn!(unit_id = %unit.id, %err, "unit failed in worker phase");
            scheduler.fail(&unit.id, err.to_string());
            return;
        }
    };

    let Some(review) = review else {
        warn!(unit_id = %unit.id, "no GitHub client configured, cannot open/drive a pull request");
        scheduler.fail(&unit.id, "github client unavailable");
        return;
    };

    let pr_number = match await_pr_number(&review, &worktree.branch, &cancel).await {
        Some(n) => n,
        None => {
            scheduler.fail(&unit.id, "timed out waiting for the agent-opened pull request to appear");
            return;
        }
    };

    match review.run(&unit, &worktree, pr_number, &cancel).await {
        Ok(()) => {
            worker.finalize(&unit.id, &worktree, true).await;
            scheduler.complete(&unit.id);
        }
        Err(err) => {
            warn!(unit_id = %unit.id, pr_number, %err, "unit failed in review phase");
            if !cancel.is_cancelled() {
                worker.finalize(&unit.id, &worktree, false).await;
            }
            scheduler.fail(&unit.id, err.to_string());
        }
    }
}

/// Resume a unit recovered as active from a prior run: `InProgress` re-enters
/// the task loop on the existing worktree; the PR phases (`PrOpen`,
/// `InReview`, `Merging`) already have an open PR, so they skip straight to
/// the review poll loop with the recorded PR number.
async fn resume_unit(
    unit: Unit,
    scheduler: Arc<Scheduler>,
    worker: Arc<Worker>,
    review: Option<Arc<ReviewAdapter>>,
    cancel: CancellationToken,
    recovered_status: UnitStatus,
    worktree: WorktreeInfo,
    recovered_pr_number: Option<u64>,
) {
    if recovered_status == UnitStatus::InProgress {
        if let Err(err) = worker.resume(&unit, &worktree, &cancel).await {
            warn!(unit_id = %unit.id, %err, "resumed unit failed in worker phase");
            scheduler.fail(&unit.id, err.to_string());
            return;
        }
    }

    let Some(review) = review else {
        warn!(unit_id = %unit.id, "no GitHub client configured, cannot resume the pull request");
        scheduler.fail(&unit.id, "github client unavailable");
        return;
    };

    let pr_number = match recovered_pr_number {
        Some(n) => n,
        None => match await_pr_number(&review, &worktree.branch, &cancel).await {
            Some(n) => n,
            None => {
                scheduler.fail(&unit.id, "timed out waiting for the agent-opened pull request to appear");
                return;
            }
        },
    };

    match review.run(&unit, &worktree, pr_number, &cancel).await {
        Ok(()) => {
            worker.finalize(&unit.id, &worktree, true).await;
            scheduler.complete(&unit.id);
        }
        Err(err) => {
            warn!(unit_id = %unit.id, pr_number, %err, "resumed unit failed in review phase");
            if !cancel.is_cancelled() {
                worker.finalize(&unit.id, &worktree, false).await;
            }
            scheduler.fail(&unit.id, err.to_string());
        }
    }
}

/// Read back every unit's `orch_status` (and, for active units, its
/// recorded branch/worktree/PR number) from on-disk frontmatter so a
/// restart can resume rather than re-run completed or in-flight work.
/// Units with no prior `orch_status` (never dispatched before) are simply
/// absent from the returned map.
fn recover_unit_states(task_tree_root: &std::path::Path, units: &[Unit]) -> HashMap<String, RecoveredUnit> {
    let mut out = HashMap::new();
    for unit in units {
        match at_core::state_writer::read_recovered_unit(task_tree_root, &unit.id) {
            Ok(Some(recovered)) => {
                out.insert(unit.id.clone(), recovered);
            }
            Ok(None) => {}
            Err(err) => warn!(unit_id = %unit.id, %err, "failed to read recovered unit state, treating as fresh"),
        }
    }
    out
}

/// The agent opens the PR itself (Phase 3 delegates this to it); the
/// orchestrator learns the PR number by polling the GitHub API for a PR
/// whose head is the unit's branch, the same way a human watching the repo
/// would notice it appear.
async fn await_pr_number(
    review: &ReviewAdapter,
    branch: &str,
    cancel: &CancellationToken,
) -> Option<u64> {
    const MAX_ATTEMPTS: u32 = 40;
    for _ in 0..MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(number) = review.find_pr_number(branch).await {
            return Some(number);
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
    }
    None
}

/// Keeps the scheduler's in-memory `UnitStatus` in step with the PR
/// lifecycle events the Review Adapter emits on the bus, since those
/// transitions (`pr_open`, `in_review`, `merging`) happen outside the
/// Scheduler's own `dispatch`/`complete`/`fail` chokepoints.
struct SchedulerBridge {
    scheduler: Arc<OnceLock<Arc<Scheduler>>>,
}

impl EventHandler for SchedulerBridge {
    fn handle(&self, event: &Event) {
        let Some(scheduler) = self.scheduler.get() else { return };
        let Some(unit_id) = event.unit_id.as_deref() else { return };
        let current = match scheduler.get_state(unit_id) {
            Some(rt) => rt.status,
            None => return,
        };
        match event.kind {
            EventKind::PrCreated if current == UnitStatus::InProgress => {
                scheduler.transition_to(unit_id, UnitStatus::PrOpen);
            }
            EventKind::PrReviewInProgress if current == UnitStatus::PrOpen => {
                scheduler.transition_to(unit_id, UnitStatus::InReview);
            }
            EventKind::PrFeedbackAddressed if current == UnitStatus::InReview => {
                scheduler.transition_to(unit_id, UnitStatus::PrOpen);
            }
            EventKind::PrMergeQueued => {
                if current == UnitStatus::PrOpen {
                    scheduler.transition_to(unit_id, UnitStatus::InReview);
                }
                scheduler.transition_to(unit_id, UnitStatus::Merging);
            }
            _ => {}
        }
    }
}

/// Plain structured logging of bus events, at the density the rest of the
/// engine logs at: one line per lifecycle transition, no payload dump.
struct LogSinkHandler;

impl EventHandler for LogSinkHandler {
    fn handle(&self, event: &Event) {
        if let Some(err) = &event.error {
            warn!(unit_id = ?event.unit_id, task_number = ?event.task_number, pr_number = ?event.pr_number, kind = ?event.kind, %err, "event");
        } else {
            info!(unit_id = ?event.unit_id, task_number = ?event.task_number, pr_number = ?event.pr_number, kind = ?event.kind, "event");
        }
    }
}

fn github_client_from_config(cfg: &at_core::config::GitHubConfig) -> Result<Option<GitHubClient>> {
    let Some(token) = std::env::var(&cfg.token_env).ok().or_else(gh_auth_token) else {
        warn!(var = %cfg.token_env, "no GitHub token in environment or `gh auth token`, PRs cannot be driven");
        return Ok(None);
    };
    let Some(owner) = cfg.owner.clone() else {
        warn!("github.owner not set in config, PRs cannot be driven");
        return Ok(None);
    };
    let Some(repo) = cfg.repo.clone() else {
        warn!("github.repo not set in config, PRs cannot be driven");
        return Ok(None);
    };
    let client = GitHubClient::new(GitHubClientConfig { token: Some(token), owner, repo })?;
    Ok(Some(client))
}

/// Fallback token source per SPEC_FULL.md §6: when the configured
/// environment variable is unset, shell out to `gh auth token` the way the
/// `gh` CLI itself expects callers without their own credential to do.
fn gh_auth_token() -> Option<String> {
    let output = std::process::Command::new("gh").args(["auth", "token"]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8(output.stdout).ok()?.trim().to_string();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Narrow `units` to exactly those named in `filter` plus their transitive
/// dependencies, preserving the rest of the DAG's shape for everyone still
/// included. `None` means run everything.
fn select_units(units: Vec<Unit>, filter: Option<&[String]>) -> Result<Vec<Unit>> {
    let Some(filter) = filter else { return Ok(units) };

    let by_id: std::collections::HashMap<String, Unit> =
        units.into_iter().map(|u| (u.id.clone(), u)).collect();

    for id in filter {
        if !by_id.contains_key(id) {
            return Err(OrchestratorError::UnknownUnit(id.clone()));
        }
    }

    let mut keep: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = filter.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        if !keep.insert(id.clone()) {
            continue;
        }
        if let Some(unit) = by_id.get(&id) {
            for dep in &unit.depends_on {
                queue.push_back(dep.clone());
            }
        }
    }

    let mut selected: Vec<Unit> = by_id.into_iter().filter(|(id, _)| keep.contains(id)).map(|(_, u)| u).collect();
    selected.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(selected)
}

fn print_graph(units: &[Unit], parallelism: usize) {
    info!(unit_count = units.len(), parallelism, "dry run: computed graph");
    for unit in units {
        let deps = unit.depends_on.iter().cloned().collect::<Vec<_>>().join(", ");
        info!(unit_id = %unit.id, tasks = unit.tasks.len(), depends_on = %deps, "unit");
    }
}
