//! The Unit/Task domain model discovered from the on-disk task tree.
//!
//! A [`Unit`] is a directory under the task-tree root carrying an
//! `IMPLEMENTATION_PLAN.md` and a sequence of numbered task files. These
//! types are produced by [`crate::discovery`] and are immutable once built —
//! runtime state (the thing that actually changes as the engine runs) lives
//! in [`UnitRuntime`], owned by the scheduler and written back to disk by the
//! state writer, never mutated on these structs directly.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A single numbered task file within a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub number: u32,
    pub title: String,
    pub status: TaskStatus,
    /// Shell command whose zero exit status is the acceptance contract.
    pub backpressure: String,
    /// Task numbers (within the same unit) that must be `complete` first.
    pub depends_on: BTreeSet<u32>,
    pub file_path: PathBuf,
    /// Raw markdown body, preserved byte-for-byte across rewrites.
    pub body: String,
}

impl Task {
    /// Whether every dependency of this task is satisfied by `completed`.
    pub fn is_ready(&self, completed: &BTreeSet<u32>) -> bool {
        self.status == TaskStatus::Pending && self.depends_on.is_subset(completed)
    }
}

// ---------------------------------------------------------------------------
// Unit runtime status
// ---------------------------------------------------------------------------

/// The unit's position in the orchestration lifecycle.
///
/// Allowed transitions: `pending -> ready | blocked`, `ready -> in_progress
/// | blocked`, `in_progress -> pr_open | complete | failed`, `pr_open ->
/// in_review | complete | failed`, `in_review -> merging | pr_open | failed`,
/// `merging -> complete | failed`. Terminal states accept no further
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Ready,
    InProgress,
    PrOpen,
    InReview,
    Merging,
    Complete,
    Failed,
    Blocked,
}

impl UnitStatus {
    /// Active statuses consume a parallelism slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            UnitStatus::InProgress
                | UnitStatus::PrOpen
                | UnitStatus::InReview
                | UnitStatus::Merging
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitStatus::Complete | UnitStatus::Failed | UnitStatus::Blocked
        )
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Ready => "ready",
            UnitStatus::InProgress => "in_progress",
            UnitStatus::PrOpen => "pr_open",
            UnitStatus::InReview => "in_review",
            UnitStatus::Merging => "merging",
            UnitStatus::Complete => "complete",
            UnitStatus::Failed => "failed",
            UnitStatus::Blocked => "blocked",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Unit
// ---------------------------------------------------------------------------

/// A named collection of ordered tasks plus a dependency list referencing
/// other units by ID. Immutable after [`crate::discovery::discover`] builds it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unit {
    pub id: String,
    pub depends_on: BTreeSet<String>,
    /// Ordered 1..N by task number.
    pub tasks: Vec<Task>,
    pub plan_path: PathBuf,
    pub plan_body: String,
}

impl Unit {
    pub fn task(&self, number: u32) -> Option<&Task> {
        self.tasks.iter().find(|t| t.number == number)
    }

    /// Tasks whose status is `pending` and whose intra-unit deps are all complete.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        let completed: BTreeSet<u32> = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| t.number)
            .collect();
        self.tasks
            .iter()
            .filter(|t| t.is_ready(&completed))
            .collect()
    }

    pub fn all_tasks_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.status == TaskStatus::Complete)
    }
}

// ---------------------------------------------------------------------------
// UnitRuntime — the mutable, per-unit bookkeeping the Scheduler/Worker own
// ---------------------------------------------------------------------------

/// Mutable runtime bookkeeping for a unit, separate from the immutable
/// [`Unit`] model. Owned by the scheduler (status, timestamps, `blocked_by`)
/// and the worker (branch/worktree/pr_number) for the unit's active lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRuntime {
    pub status: UnitStatus,
    pub branch: Option<String>,
    pub worktree: Option<PathBuf>,
    pub pr_number: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blocked_by: Vec<String>,
}

impl Default for UnitRuntime {
    fn default() -> Self {
        Self {
            status: UnitStatus::Pending,
            branch: None,
            worktree: None,
            pr_number: None,
            started_at: None,
            completed_at: None,
            blocked_by: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// PR review status (Review Adapter signal protocol)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    InProgress,
    ChangesRequested,
    Approved,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::InProgress => "in_progress",
            ReviewStatus::ChangesRequested => "changes_requested",
            ReviewStatus::Approved => "approved",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(number: u32, status: TaskStatus, depends_on: &[u32]) -> Task {
        Task {
            number,
            title: format!("task {number}"),
            status,
            backpressure: "true".to_string(),
            depends_on: depends_on.iter().copied().collect(),
            file_path: PathBuf::from(format!("{number:02}-task.md")),
            body: String::new(),
        }
    }

    #[test]
    fn task_ready_requires_all_deps_complete() {
        let mut completed = BTreeSet::new();
        let t = task(2, TaskStatus::Pending, &[1]);
        assert!(!t.is_ready(&completed));
        completed.insert(1);
        assert!(t.is_ready(&completed));
    }

    #[test]
    fn non_pending_task_is_never_ready() {
        let t = task(1, TaskStatus::Complete, &[]);
        assert!(!t.is_ready(&BTreeSet::new()));
    }

    #[test]
    fn unit_ready_tasks_respects_ordering_and_completion() {
        let unit = Unit {
            id: "unit-a".to_string(),
            depends_on: BTreeSet::new(),
            tasks: vec![
                task(1, TaskStatus::Complete, &[]),
                task(2, TaskStatus::Pending, &[1]),
                task(3, TaskStatus::Pending, &[2]),
            ],
            plan_path: PathBuf::from("IMPLEMENTATION_PLAN.md"),
            plan_body: String::new(),
        };
        let ready = unit.ready_tasks();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].number, 2);
    }

    #[test]
    fn unit_status_active_and_terminal_are_disjoint() {
        for status in [
            UnitStatus::Pending,
            UnitStatus::Ready,
            UnitStatus::InProgress,
            UnitStatus::PrOpen,
            UnitStatus::InReview,
            UnitStatus::Merging,
            UnitStatus::Complete,
            UnitStatus::Failed,
            UnitStatus::Blocked,
        ] {
            assert!(!(status.is_active() && status.is_terminal()));
        }
    }
}
