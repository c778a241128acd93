//! The sole writer of orchestrator-owned frontmatter fields.
//!
//! Every other component — Scheduler, Worker, Git/Review adapters — learns
//! about a state change the same way everyone else does: by receiving the
//! [`crate::events::Event`] that announces it. Only this module is allowed
//! to open a unit's `IMPLEMENTATION_PLAN.md` or a task file and rewrite its
//! `orch_*`/`status` fields. Workers mutate file *bodies* (via the agent);
//! they never touch these fields directly, so recovery can always trust what
//! it reads here.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_yaml::Value;
use thiserror::Error;
use tracing::error;

use crate::events::{Event, EventHandler, EventKind};
use crate::frontmatter::{self, Frontmatter, FrontmatterError};
use crate::types::UnitStatus;

#[derive(Debug, Error)]
pub enum StateWriterError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frontmatter error: {0}")]
    Frontmatter(#[from] FrontmatterError),
}

pub type Result<T> = std::result::Result<T, StateWriterError>;

/// Writes to `<root>/<unit_id>/IMPLEMENTATION_PLAN.md`, atomically.
pub struct StateWriter {
    root: PathBuf,
}

impl StateWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn plan_path(&self, unit_id: &str) -> PathBuf {
        self.root.join(unit_id).join("IMPLEMENTATION_PLAN.md")
    }

    /// Set one or more orchestrator-owned fields on a unit's plan file,
    /// leaving every other field and the body untouched.
    pub fn set_unit_fields(&self, unit_id: &str, fields: &[(&str, Value)]) -> Result<()> {
        let path = self.plan_path(unit_id);
        self.mutate(&path, fields)
    }

    pub fn set_unit_status(&self, unit_id: &str, status: &str) -> Result<()> {
        self.set_unit_fields(unit_id, &[("orch_status", Value::String(status.into()))])
    }

    pub fn set_unit_started(&self, unit_id: &str, branch: &str, worktree: &str) -> Result<()> {
        self.set_unit_fields(
            unit_id,
            &[
                ("orch_status", Value::String("in_progress".into())),
                ("orch_branch", Value::String(branch.into())),
                ("orch_worktree", Value::String(worktree.into())),
                ("orch_started_at", Value::String(Utc::now().to_rfc3339())),
            ],
        )
    }

    pub fn set_unit_pr(&self, unit_id: &str, pr_number: u64) -> Result<()> {
        self.set_unit_fields(
            unit_id,
            &[
                ("orch_status", Value::String("pr_open".into())),
                ("orch_pr_number", Value::Number(pr_number.into())),
            ],
        )
    }

    pub fn set_unit_completed(&self, unit_id: &str) -> Result<()> {
        self.set_unit_fields(
            unit_id,
            &[
                ("orch_status", Value::String("complete".into())),
                ("orch_completed_at", Value::String(Utc::now().to_rfc3339())),
            ],
        )
    }

    pub fn set_unit_failed(&self, unit_id: &str) -> Result<()> {
        self.set_unit_fields(unit_id, &[("orch_status", Value::String("failed".into()))])
    }

    pub fn set_unit_blocked(&self, unit_id: &str, blocked_by: &[String]) -> Result<()> {
        let list = Value::Sequence(blocked_by.iter().map(|s| Value::String(s.clone())).collect());
        self.set_unit_fields(
            unit_id,
            &[("orch_status", Value::String("blocked".into())), ("blocked_by", list)],
        )
    }

    /// Tasks are identified by path, since Discovery already resolved it.
    /// Only `status` is ever mutated here on a task file.
    pub fn set_task_status(&self, task_file: &Path, status: &str) -> Result<()> {
        self.mutate(task_file, &[("status", Value::String(status.into()))])
    }

    fn mutate(&self, path: &Path, fields: &[(&str, Value)]) -> Result<()> {
        let text = std::fs::read_to_string(path)?;
        let mut fm = frontmatter::parse(&text)?;

        let map = fm
            .fields
            .as_mapping_mut()
            .expect("frontmatter root must be a mapping");
        for (key, value) in fields {
            map.insert(Value::String((*key).to_string()), value.clone());
        }

        let rendered = frontmatter::render(&fm)?;
        atomic_write(path, &rendered)?;
        Ok(())
    }
}

fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    use std::io::Write;
    tmp.write_all(content.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Adapts [`StateWriter`] into an [`EventHandler`] so it can be registered
/// directly on the event bus. Every state-changing event that carries a
/// `unit_id` is translated into the corresponding frontmatter mutation;
/// write failures are logged (the file is the source of truth but a failed
/// write here must not take down the consumer thread, since other
/// subscribers — the log sink, the forwarder — still need their turn).
pub struct StateWriterHandler {
    writer: StateWriter,
}

impl StateWriterHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { writer: StateWriter::new(root) }
    }
}

impl EventHandler for StateWriterHandler {
    fn handle(&self, event: &Event) {
        let Some(unit_id) = event.unit_id.as_deref() else { return };

        let result = match event.kind {
            EventKind::UnitStarted => {
                let branch = event.payload.get("branch").and_then(|v| v.as_str()).unwrap_or("");
                let worktree = event.payload.get("worktree").and_then(|v| v.as_str()).unwrap_or("");
                self.writer.set_unit_started(unit_id, branch, worktree)
            }
            EventKind::UnitQueued => self.writer.set_unit_status(unit_id, "ready"),
            EventKind::PrCreated => {
                match event.pr_number {
                    Some(n) => self.writer.set_unit_pr(unit_id, n),
                    None => Ok(()),
                }
            }
            EventKind::PrReviewInProgress => self.writer.set_unit_status(unit_id, "in_review"),
            EventKind::PrMergeQueued => self.writer.set_unit_status(unit_id, "merging"),
            EventKind::UnitCompleted => self.writer.set_unit_completed(unit_id),
            EventKind::UnitFailed | EventKind::PrReviewTimeout => {
                self.writer.set_unit_failed(unit_id)
            }
            EventKind::UnitBlocked => {
                let blocked_by: Vec<String> = event
                    .payload
                    .get("blocked_by")
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                self.writer.set_unit_blocked(unit_id, &blocked_by)
            }
            _ => Ok(()),
        };

        if let Err(err) = result {
            error!(unit_id, kind = ?event.kind, %err, "state writer failed to persist event");
        }
    }
}

/// Reconstitutes the runtime status map from on-disk frontmatter, used both
/// by the `status` CLI command and by recovery on restart.
pub fn read_unit_status(root: &Path, unit_id: &str) -> Result<Option<String>> {
    let path = root.join(unit_id).join("IMPLEMENTATION_PLAN.md");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let fm: Frontmatter = frontmatter::parse(&text)?;
    Ok(frontmatter::field_str(&fm.fields, "orch_status").map(String::from))
}

/// Everything a restart needs to reconstitute a unit's runtime state without
/// re-running work already recorded as done: `orch_status` plus the fields
/// that only matter once a unit is active or further along (branch,
/// worktree, PR number, `blocked_by`). Returns `None` for a unit whose plan
/// carries no `orch_status` yet (never dispatched in a prior run) or whose
/// `orch_status` is unrecognized (treated as fresh rather than trusted).
#[derive(Debug, Clone)]
pub struct RecoveredUnit {
    pub status: UnitStatus,
    pub branch: Option<String>,
    pub worktree: Option<String>,
    pub pr_number: Option<u64>,
    pub blocked_by: Vec<String>,
}

pub fn read_recovered_unit(root: &Path, unit_id: &str) -> Result<Option<RecoveredUnit>> {
    let path = root.join(unit_id).join("IMPLEMENTATION_PLAN.md");
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let fm: Frontmatter = frontmatter::parse(&text)?;

    let Some(status) = frontmatter::field_str(&fm.fields, "orch_status").and_then(parse_unit_status) else {
        return Ok(None);
    };

    Ok(Some(RecoveredUnit {
        status,
        branch: frontmatter::field_str(&fm.fields, "orch_branch").map(String::from),
        worktree: frontmatter::field_str(&fm.fields, "orch_worktree").map(String::from),
        pr_number: fm.fields.get("orch_pr_number").and_then(|v| v.as_u64()),
        blocked_by: frontmatter::field_str_list(&fm.fields, "blocked_by"),
    }))
}

fn parse_unit_status(s: &str) -> Option<UnitStatus> {
    match s {
        "pending" => Some(UnitStatus::Pending),
        "ready" => Some(UnitStatus::Ready),
        "in_progress" => Some(UnitStatus::InProgress),
        "pr_open" => Some(UnitStatus::PrOpen),
        "in_review" => Some(UnitStatus::InReview),
        "merging" => Some(UnitStatus::Merging),
        "complete" => Some(UnitStatus::Complete),
        "failed" => Some(UnitStatus::Failed),
        "blocked" => Some(UnitStatus::Blocked),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_unit(root: &Path, id: &str, extra: &str) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("IMPLEMENTATION_PLAN.md"),
            format!("---\nunit: {id}\ndepends_on: []\n{extra}---\n\n# {id}\n"),
        )
        .unwrap();
    }

    #[test]
    fn set_unit_started_preserves_body_and_other_fields() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "alpha", "");
        let writer = StateWriter::new(tmp.path());
        writer.set_unit_started("alpha", "orch/alpha-1234", "/tmp/wt/alpha").unwrap();

        let text = std::fs::read_to_string(tmp.path().join("alpha/IMPLEMENTATION_PLAN.md")).unwrap();
        assert!(text.contains("unit: alpha"));
        assert!(text.contains("orch_branch: orch/alpha-1234"));
        assert!(text.contains("orch_status: in_progress"));
        assert!(text.contains("# alpha"));
    }

    #[test]
    fn set_unit_completed_then_read_status_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "beta", "");
        let writer = StateWriter::new(tmp.path());
        writer.set_unit_completed("beta").unwrap();

        let status = read_unit_status(tmp.path(), "beta").unwrap();
        assert_eq!(status.as_deref(), Some("complete"));
    }

    #[test]
    fn handler_translates_unit_completed_event() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "gamma", "");
        let handler = StateWriterHandler::new(tmp.path());
        handler.handle(&Event::for_unit(EventKind::UnitCompleted, "gamma"));

        let status = read_unit_status(tmp.path(), "gamma").unwrap();
        assert_eq!(status.as_deref(), Some("complete"));
    }

    #[test]
    fn handler_translates_unit_blocked_event_with_payload() {
        let tmp = tempfile::tempdir().unwrap();
        write_unit(tmp.path(), "delta", "");
        let handler = StateWriterHandler::new(tmp.path());
        let event = Event::for_unit(EventKind::UnitBlocked, "delta")
            .with_payload(serde_json::json!({"blocked_by": ["alpha"]}));
        handler.handle(&event);

        let text = std::fs::read_to_string(tmp.path().join("delta/IMPLEMENTATION_PLAN.md")).unwrap();
        assert!(text.contains("orch_status: blocked"));
        assert!(text.contains("blocked_by"));
    }
}
