use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::repo::RepoPath;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorktreeManagerError {
    #[error("worktree already exists: {0}")]
    AlreadyExists(String),
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorktreeManagerError>;

// ---------------------------------------------------------------------------
// WorktreeInfo
// ---------------------------------------------------------------------------

/// Information about a unit's worktree, as persisted into its frontmatter
/// via the State Writer (`orch_branch`, `orch_worktree`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
    pub base_branch: String,
    pub unit_id: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Real git runner that shells out to the `git` binary.
pub struct RealGitRunner;

impl GitRunner for RealGitRunner {
    fn run_git(&self, dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// WorktreeManager
// ---------------------------------------------------------------------------

/// Creates, tracks, and merges the per-unit worktrees that back the Worker's
/// Phase 1 setup and Phase 4 cleanup.
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_base: PathBuf,
    branch_prefix: String,
    git: Box<dyn GitRunner>,
}

impl WorktreeManager {
    /// Create a new WorktreeManager with the real git runner.
    pub fn new(repo_root: impl Into<PathBuf>, worktree_base: impl Into<PathBuf>, branch_prefix: impl Into<String>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_base: worktree_base.into(),
            branch_prefix: branch_prefix.into(),
            git: Box::new(RealGitRunner),
        }
    }

    /// Create a new WorktreeManager with a custom git runner (for testing).
    pub fn with_git_runner(
        repo_root: impl Into<PathBuf>,
        worktree_base: impl Into<PathBuf>,
        branch_prefix: impl Into<String>,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_base: worktree_base.into(),
            branch_prefix: branch_prefix.into(),
            git,
        }
    }

    /// Create a worktree for `unit_id` under `<worktree-base>/<unit-id>` on
    /// a fresh branch `<prefix>/<unit-id>-<random>` forked from `target_branch`.
    pub async fn create_for_unit(&self, unit_id: &str, target_branch: &str) -> Result<WorktreeInfo> {
        let wt_path = self.worktree_base.join(unit_id);
        let random = Uuid::new_v4().simple().to_string();
        let branch_name = format!("{}/{unit_id}-{}", self.branch_prefix, &random[..8]);

        info!(
            unit_id,
            worktree = %wt_path.display(),
            branch = %branch_name,
            "creating worktree for unit"
        );

        if wt_path.exists() {
            return Err(WorktreeManagerError::AlreadyExists(wt_path.display().to_string()));
        }
        if let Some(parent) = wt_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repo_root_str = self.repo_root.to_str().unwrap_or(".");
        let wt_path_str = wt_path.to_str().unwrap_or(".");

        let result = self.git.run_git(
            repo_root_str,
            &["worktree", "add", "-b", &branch_name, wt_path_str, target_branch],
        );

        match result {
            Ok(output) if output.success => Ok(WorktreeInfo {
                path: wt_path,
                branch: branch_name,
                base_branch: target_branch.to_string(),
                unit_id: unit_id.to_string(),
                created_at: Utc::now(),
            }),
            Ok(output) => Err(WorktreeManagerError::GitCommand(output.stderr)),
            Err(e) => Err(WorktreeManagerError::GitCommand(e)),
        }
    }

    /// Reconstitute a [`WorktreeInfo`] for a unit whose worktree and branch
    /// were already created in a prior run, per the recorded `orch_branch`/
    /// `orch_worktree` frontmatter fields — no git operations, since the
    /// worktree is expected to already exist on disk.
    pub fn resume_for_unit(&self, unit_id: &str, branch: &str, base_branch: &str) -> Result<WorktreeInfo> {
        let wt_path = self.worktree_path(unit_id);
        if !wt_path.exists() {
            return Err(WorktreeManagerError::GitCommand(format!(
                "recorded worktree {} for unit {unit_id} no longer exists on disk",
                wt_path.display()
            )));
        }
        Ok(WorktreeInfo {
            path: wt_path,
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            unit_id: unit_id.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Remove a unit's worktree and delete its local branch. Called on
    /// terminal success (Phase 4); terminal failures keep the worktree
    /// unless the caller decides otherwise.
    pub async fn remove(&self, worktree: &WorktreeInfo) -> Result<()> {
        let repo_root_str = self.repo_root.to_str().unwrap_or(".");
        let path_str = worktree.path.to_str().unwrap_or(".");

        if let Err(e) = self
            .git
            .run_git(repo_root_str, &["worktree", "remove", "--force", path_str])
        {
            warn!(unit_id = %worktree.unit_id, error = %e, "git worktree remove failed");
        }
        if let Err(e) = self
            .git
            .run_git(repo_root_str, &["branch", "-D", &worktree.branch])
        {
            warn!(unit_id = %worktree.unit_id, error = %e, "git branch delete failed");
        }
        Ok(())
    }

    /// Remove worktrees under the worktree base older than `max_age`.
    pub async fn cleanup_stale(&self, max_age: Duration) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        if !self.worktree_base.exists() {
            return Ok(removed);
        }

        let entries = std::fs::read_dir(&self.worktree_base)?;
        let cutoff = std::time::SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let metadata = std::fs::metadata(&path)?;
            let modified = metadata
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

            if modified < cutoff {
                let path_str = path.to_str().unwrap_or("");
                let repo_root_str = self.repo_root.to_str().unwrap_or(".");
                info!(path = %path.display(), "removing stale worktree");

                match self
                    .git
                    .run_git(repo_root_str, &["worktree", "remove", "--force", path_str])
                {
                    Ok(output) if output.success => removed.push(path),
                    Ok(output) => warn!(path = %path.display(), stderr = %output.stderr, "failed to remove stale worktree"),
                    Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stale worktree"),
                }
            }
        }

        Ok(removed)
    }

    /// Build a `RepoPath` for a unit's worktree.
    pub fn repo_path_for_worktree(&self, worktree: &WorktreeInfo) -> RepoPath {
        let gitdir = self
            .repo_root
            .join(".git")
            .join("worktrees")
            .join(&worktree.unit_id);
        RepoPath::new(gitdir, worktree.path.clone())
    }

    /// Build a `RepoPath` for the main repository (not a worktree).
    pub fn repo_path(&self) -> RepoPath {
        RepoPath::new(self.repo_root.join(".git"), self.repo_root.clone())
    }

    /// The filesystem path a unit's worktree would be located at.
    pub fn worktree_path(&self, unit_id: &str) -> PathBuf {
        self.worktree_base.join(unit_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockGitRunner {
        responses: Mutex<Vec<GitOutput>>,
    }

    impl MockGitRunner {
        fn new(responses: Vec<GitOutput>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    impl GitRunner for MockGitRunner {
        fn run_git(&self, _dir: &str, _args: &[&str]) -> std::result::Result<GitOutput, String> {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(GitOutput {
                    success: true,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn ok_output() -> GitOutput {
        GitOutput {
            success: true,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    #[tokio::test]
    async fn create_for_unit_builds_correct_path_and_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let wt_base = tmp.path().join("worktrees");
        let git = Box::new(MockGitRunner::new(vec![ok_output()]));
        let manager = WorktreeManager::with_git_runner(tmp.path(), &wt_base, "orch", git);

        let info = manager.create_for_unit("unit-a", "main").await.unwrap();
        assert_eq!(info.path, wt_base.join("unit-a"));
        assert!(info.branch.starts_with("orch/unit-a-"));
        assert_eq!(info.base_branch, "main");
    }

    #[tokio::test]
    async fn create_for_unit_rejects_duplicate() {
        let tmp = tempfile::tempdir().unwrap();
        let wt_base = tmp.path().join("worktrees");
        std::fs::create_dir_all(wt_base.join("unit-a")).unwrap();

        let git = Box::new(MockGitRunner::new(vec![]));
        let manager = WorktreeManager::with_git_runner(tmp.path(), &wt_base, "orch", git);

        let result = manager.create_for_unit("unit-a", "main").await;
        assert!(matches!(result, Err(WorktreeManagerError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn cleanup_stale_with_no_worktrees_dir() {
        let git = Box::new(MockGitRunner::new(vec![]));
        let manager = WorktreeManager::with_git_runner("/nonexistent", "/nonexistent/.worktrees", "orch", git);
        let result = manager.cleanup_stale(Duration::from_secs(3600)).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn resume_for_unit_requires_existing_path() {
        let tmp = tempfile::tempdir().unwrap();
        let wt_base = tmp.path().join("worktrees");
        let manager = WorktreeManager::with_git_runner(tmp.path(), &wt_base, "orch", Box::new(MockGitRunner::new(vec![])));

        let missing = manager.resume_for_unit("unit-a", "orch/unit-a-deadbeef", "main");
        assert!(matches!(missing, Err(WorktreeManagerError::GitCommand(_))));

        std::fs::create_dir_all(wt_base.join("unit-a")).unwrap();
        let info = manager.resume_for_unit("unit-a", "orch/unit-a-deadbeef", "main").unwrap();
        assert_eq!(info.path, wt_base.join("unit-a"));
        assert_eq!(info.branch, "orch/unit-a-deadbeef");
    }

    #[tokio::test]
    async fn repo_path_for_worktree_sets_correct_paths() {
        let manager = WorktreeManager::new("/project", "/project/.worktrees", "orch");
        let wt = WorktreeInfo {
            path: PathBuf::from("/project/.worktrees/unit-a"),
            branch: "orch/unit-a-deadbeef".to_string(),
            base_branch: "main".to_string(),
            unit_id: "unit-a".to_string(),
            created_at: Utc::now(),
        };
        let rp = manager.repo_path_for_worktree(&wt);
        assert_eq!(rp.gitdir(), PathBuf::from("/project/.git/worktrees/unit-a"));
        assert!(rp.is_worktree());
    }
}
