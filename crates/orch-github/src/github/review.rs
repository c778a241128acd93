//! The Review Adapter: polls a pull request's reactions and comments for a
//! review signal, asks the Worker to address feedback, and drives the
//! rebase/merge sequence once a unit's PR is approved.
//!
//! States map onto [`at_core::types::UnitStatus`]: `pr_open` while polling
//! with no signal yet, `in_review` once a reviewer has engaged, `merging`
//! while the rebase/merge sequence runs. This module only emits events for
//! those transitions — [`at_core::state_writer::StateWriterHandler`], already
//! subscribed on the bus, is what actually persists them.

use std::sync::Arc;
use std::time::Duration;

use at_agents::worker::Worker;
use at_agents::prompts::ReviewCommentSlot;
use at_core::cancellation::CancellationToken;
use at_core::events::{Event, EventKind, EventSender};
use at_core::git_adapter::{DestructiveOp, GitAdapter, GitAdapterError, GitAdapterPolicy};
use at_core::git_read_adapter::{GitReadAdapter, ShellGitReadAdapter};
use at_core::lockfile::MergeLock;
use at_core::types::{ReviewStatus, Unit};
use at_core::worktree_manager::{WorktreeInfo, WorktreeManager};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use super::client::{GitHubClient, GitHubError};
use super::pull_requests;
use crate::types::{CheckRun, Reaction, ReviewComment};

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("github api error: {0}")]
    GitHub(#[from] GitHubError),
    #[error("git operation failed: {0}")]
    Git(#[from] GitAdapterError),
    #[error("worker error: {0}")]
    Worker(#[from] at_agents::worker::WorkerError),
    #[error("review timed out without reaching a terminal state")]
    ReviewTimeout,
    #[error("exhausted {0} agent-assisted conflict resolution rounds")]
    ConflictRetriesExhausted(u32),
    #[error("CI check(s) failed on the PR head")]
    CiFailed,
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ReviewError>;

/// Static configuration for one review loop run.
#[derive(Debug, Clone)]
pub struct ReviewSettings {
    pub target_branch: String,
    pub poll_interval: Duration,
    pub review_timeout: Duration,
    pub ci_gate: bool,
    pub max_conflict_rounds: u32,
}

/// Drives a single unit's PR from open to merged (or a terminal failure).
pub struct ReviewAdapter {
    client: GitHubClient,
    worker: Arc<Worker>,
    worktree_manager: Arc<WorktreeManager>,
    merge_lock: Arc<MergeLock>,
    bus: EventSender,
    settings: ReviewSettings,
}

enum CiOutcome {
    Pass,
    Fail,
}

impl ReviewAdapter {
    pub fn new(
        client: GitHubClient,
        worker: Arc<Worker>,
        worktree_manager: Arc<WorktreeManager>,
        merge_lock: Arc<MergeLock>,
        bus: EventSender,
        settings: ReviewSettings,
    ) -> Self {
        Self { client, worker, worktree_manager, merge_lock, bus, settings }
    }

    /// Run the poll loop for `unit`'s PR until it merges or fails terminally.
    pub async fn run(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        pr_number: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.bus.emit(Event::for_pr(EventKind::PrCreated, &unit.id, pr_number));

        let started = Utc::now();
        let mut last_address_ts = started;
        let mut entered_review = false;

        loop {
            if cancel.is_cancelled() {
                return Err(ReviewError::Cancelled);
            }
            let elapsed = Utc::now().signed_duration_since(started);
            let timeout = chrono::Duration::from_std(self.settings.review_timeout)
                .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
            if elapsed > timeout {
                self.bus.emit(
                    Event::for_pr(EventKind::PrReviewTimeout, &unit.id, pr_number)
                        .with_error("review timed out"),
                );
                return Err(ReviewError::ReviewTimeout);
            }

            let pr = with_retry(|| pull_requests::get_pull_request(&self.client, pr_number)).await?;
            let reactions = with_retry(|| pull_requests::list_reactions(&self.client, pr_number)).await?;
            let mut comments =
                with_retry(|| pull_requests::list_issue_comments(&self.client, pr_number)).await?;
            comments.extend(
                with_retry(|| pull_requests::list_review_comments(&self.client, pr_number)).await?,
            );

            let status = compute_review_status(&reactions, &comments, &pr.author, last_address_ts);
            info!(unit_id = %unit.id, pr_number, %status, "review poll");

            match status {
                ReviewStatus::Pending => {}
                ReviewStatus::InProgress => {
                    if !entered_review {
                        self.bus.emit(Event::for_pr(EventKind::PrReviewInProgress, &unit.id, pr_number));
                        entered_review = true;
                    }
                }
                ReviewStatus::ChangesRequested => {
                    let fresh: Vec<ReviewCommentSlot> = comments
                        .iter()
                        .filter(|c| c.author != pr.author && c.created_at > last_address_ts)
                        .map(|c| ReviewCommentSlot { author: c.author.clone(), body: c.body.clone() })
                        .collect();
                    if !fresh.is_empty() {
                        self.bus.emit(Event::for_pr(EventKind::PrFeedbackReceived, &unit.id, pr_number));
                        self.worker.address_feedback(unit, worktree, pr_number, fresh, cancel).await?;
                        last_address_ts = Utc::now();
                        self.bus.emit(Event::for_pr(EventKind::PrFeedbackAddressed, &unit.id, pr_number));
                    }
                }
                ReviewStatus::Approved => {
                    self.bus.emit(Event::for_pr(EventKind::PrReviewApproved, &unit.id, pr_number));
                    if self.settings.ci_gate {
                        match self.wait_for_ci(&pr.head_branch, cancel).await? {
                            CiOutcome::Pass => {}
                            CiOutcome::Fail => {
                                self.bus.emit(
                                    Event::for_pr(EventKind::PrFailed, &unit.id, pr_number)
                                        .with_error("CI check failed on PR head"),
                                );
                                return Err(ReviewError::CiFailed);
                            }
                        }
                    }
                    self.merge(unit, worktree, pr_number, cancel).await?;
                    return Ok(());
                }
            }

            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Look up the pull request the agent opened for `branch`, if GitHub has
    /// indexed it yet. The agent opens PRs itself (Phase 3 delegates this to
    /// it via `gh pr create`); this is how the orchestrator learns the
    /// number without the Worker having to parse the agent's stdout as a
    /// protocol.
    pub async fn find_pr_number(&self, branch: &str) -> Option<u64> {
        match pull_requests::find_pr_for_branch(&self.client, branch).await {
            Ok(Some(pr)) => Some(pr.number),
            Ok(None) => None,
            Err(err) => {
                warn!(branch, %err, "failed to look up pull request for branch");
                None
            }
        }
    }

    /// Poll check-runs for `head_ref` until every run has completed.
    async fn wait_for_ci(&self, head_ref: &str, cancel: &CancellationToken) -> Result<CiOutcome> {
        loop {
            if cancel.is_cancelled() {
                return Err(ReviewError::Cancelled);
            }
            let runs = with_retry(|| pull_requests::list_check_runs(&self.client, head_ref)).await?;
            if runs.iter().any(CheckRun::is_failure) {
                return Ok(CiOutcome::Fail);
            }
            if !runs.is_empty() && runs.iter().all(CheckRun::is_complete) {
                return Ok(CiOutcome::Pass);
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// Acquire the process-wide merge lock, rebase the unit's branch onto
    /// the target, resolve conflicts with agent assistance (bounded), force
    /// push, then merge via the GitHub API (squash).
    async fn merge(
        &self,
        unit: &Unit,
        worktree: &WorktreeInfo,
        pr_number: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let _guard = self.merge_lock.acquire().await;
        self.bus.emit(Event::for_pr(EventKind::PrMergeQueued, &unit.id, pr_number));

        let repo = self.worktree_manager.repo_path_for_worktree(worktree);
        let read_adapter = ShellGitReadAdapter;
        let workdir = worktree.path.to_string_lossy().to_string();

        let fetch_adapter = GitAdapter::new(repo.clone(), GitAdapterPolicy::default());
        fetch_adapter.read(&["fetch", "origin", &self.settings.target_branch])?;

        let rebase_adapter = GitAdapter::new(
            repo.clone(),
            GitAdapterPolicy { required_branch: Some(worktree.branch.clone()), ..GitAdapterPolicy::default() },
        );

        let mut round = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ReviewError::Cancelled);
            }
            let rebase_target = format!("origin/{}", self.settings.target_branch);
            match rebase_adapter.write(&["rebase", &rebase_target]) {
                Ok(_) => break,
                Err(rebase_err) => {
                    let conflicts = read_adapter
                        .conflict_files(&workdir)
                        .map_err(|e| GitAdapterError::Command(e.to_string()))?;
                    if conflicts.is_empty() {
                        // Rebase failed for a reason other than a conflict —
                        // nothing an agent turn can fix, surface it as-is.
                        return Err(rebase_err.into());
                    }

                    round += 1;
                    if round > self.settings.max_conflict_rounds {
                        let _ = rebase_adapter.write(&["rebase", "--abort"]);
                        self.bus.emit(
                            Event::for_pr(EventKind::PrFailed, &unit.id, pr_number)
                                .with_error("merge conflict resolution exhausted"),
                        );
                        return Err(ReviewError::ConflictRetriesExhausted(
                            self.settings.max_conflict_rounds,
                        ));
                    }

                    self.bus.emit(Event::for_pr(EventKind::PrConflict, &unit.id, pr_number));
                    self.worker
                        .resolve_conflict(unit, worktree, &self.settings.target_branch, conflicts, cancel)
                        .await?;
                    rebase_adapter.write(&["add", "-A"])?;
                    rebase_adapter.write(&["rebase", "--continue"])?;
                }
            }
        }

        let push_adapter = GitAdapter::new(
            repo,
            GitAdapterPolicy {
                required_branch: Some(worktree.branch.clone()),
                allow_destructive: true,
                ..GitAdapterPolicy::default()
            },
        );
        push_adapter.write_destructive(
            DestructiveOp::ForcePush,
            &["push", "--force-with-lease", "origin", &worktree.branch],
        )?;

        with_retry(|| pull_requests::merge_pull_request(&self.client, pr_number, None, Some("squash")))
            .await?;

        self.bus.emit(Event::for_pr(EventKind::PrMerged, &unit.id, pr_number));
        Ok(())
    }
}

/// Signal-protocol precedence: an approving reaction wins outright, then an
/// eyes reaction, then any reviewer comment newer than the last address
/// round, else pending. GitHub's reaction content values are `+1`/`eyes`, not
/// the emoji themselves.
fn compute_review_status(
    reactions: &[Reaction],
    comments: &[ReviewComment],
    pr_author: &str,
    last_address_ts: DateTime<Utc>,
) -> ReviewStatus {
    if reactions.iter().any(|r| r.content == "+1") {
        return ReviewStatus::Approved;
    }
    if reactions.iter().any(|r| r.content == "eyes") {
        return ReviewStatus::InProgress;
    }
    let has_fresh_reviewer_comment = comments
        .iter()
        .any(|c| c.author != pr_author && c.created_at > last_address_ts);
    if has_fresh_reviewer_comment {
        return ReviewStatus::ChangesRequested;
    }
    ReviewStatus::Pending
}

/// Retries GitHub API calls per the engine's rate-limit policy: `5xx` five
/// times at 1/2/4/8/16s, `403`/`429` with the same exponential schedule
/// (the typed responses this client consumes don't surface the raw
/// `Retry-After` header, so we fall back to the backoff table rather than
/// guess at a delay), and anything else (other `4xx`) fails on the first try.
async fn with_retry<T, F, Fut>(mut f: F) -> std::result::Result<T, GitHubError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, GitHubError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                if attempt >= 5 || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = Duration::from_secs(1u64 << attempt);
                warn!(attempt, ?delay, %err, "retrying GitHub API call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn is_retryable(err: &GitHubError) -> bool {
    match err {
        GitHubError::Api(octocrab::Error::GitHub { source, .. }) => matches!(
            source.status_code.as_u16(),
            403 | 429 | 500 | 502 | 503 | 504
        ),
        // Connection-level failures (no response at all) are transient by nature.
        GitHubError::Api(octocrab::Error::Http { .. }) => true,
        _ => false,
    }
}
