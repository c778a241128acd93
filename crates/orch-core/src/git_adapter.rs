//! The path-validated, policy-enforcing git gateway.
//!
//! [`crate::repo::RepoPath`] validates *where* a git operation runs.
//! [`GitAdapter`] sits on top of it and additionally enforces *what* may run
//! there: a branch guard (refuse to mutate a protected branch, or a branch
//! outside an allow-list), a destructive-operation gate (refuse
//! checkout/clean/reset-hard/force-push unless explicitly allowed), and
//! per-repo-path write serialization so concurrent workers never interleave
//! git invocations against the same working tree.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::repo::RepoPath;
use crate::worktree_manager::{GitOutput, GitRunner, RealGitRunner};

#[derive(Debug, Error)]
pub enum GitAdapterError {
    #[error("git command failed: {0}")]
    Command(String),
    #[error("operation would touch protected branch {branch:?}")]
    ProtectedBranch { branch: String },
    #[error("branch {branch:?} is not in the allowed set for this operation")]
    BranchNotAllowed { branch: String },
    #[error("destructive operation {op:?} requires allow_destructive")]
    DestructiveNotAllowed { op: DestructiveOp },
    #[error("repo path error: {0}")]
    Repo(#[from] crate::repo::RepoError),
}

pub type Result<T> = std::result::Result<T, GitAdapterError>;

/// Operations that mutate or discard working-tree state and are gated
/// behind `allow_destructive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestructiveOp {
    CheckoutFiles,
    Clean,
    ResetHard,
    ForcePush,
}

/// Branches a write operation may not touch unless explicitly overridden.
pub fn default_protected_branches() -> HashSet<String> {
    ["main", "master"].iter().map(|s| s.to_string()).collect()
}

/// Process-wide registry of per-canonical-path mutexes, so two adapters
/// opened against the same repo (e.g. by two workers racing a shared
/// worktree during recovery) serialize their writes against each other.
fn write_lock_registry() -> &'static Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>> {
    static REGISTRY: OnceLock<Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>>> =
        OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(std::collections::HashMap::new()))
}

fn lock_for(path: &str) -> Arc<Mutex<()>> {
    let mut reg = write_lock_registry().lock().expect("write lock registry poisoned");
    reg.entry(path.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
}

/// Policy configuration for an adapter instance.
#[derive(Debug, Clone)]
pub struct GitAdapterPolicy {
    /// If set, write operations must run on exactly this branch.
    pub required_branch: Option<String>,
    /// If set, write operations must run on a branch whose name starts with
    /// one of these prefixes.
    pub allowed_prefixes: Vec<String>,
    pub protected_branches: HashSet<String>,
    pub allow_destructive: bool,
}

impl Default for GitAdapterPolicy {
    fn default() -> Self {
        Self {
            required_branch: None,
            allowed_prefixes: Vec::new(),
            protected_branches: default_protected_branches(),
            allow_destructive: false,
        }
    }
}

/// The gateway workers and adapters use for every git invocation.
pub struct GitAdapter {
    repo: RepoPath,
    git: Box<dyn GitRunner>,
    policy: GitAdapterPolicy,
}

impl GitAdapter {
    pub fn new(repo: RepoPath, policy: GitAdapterPolicy) -> Self {
        Self { repo, git: Box::new(RealGitRunner), policy }
    }

    pub fn with_runner(repo: RepoPath, policy: GitAdapterPolicy, git: Box<dyn GitRunner>) -> Self {
        Self { repo, git, policy }
    }

    pub fn repo_path(&self) -> &RepoPath {
        &self.repo
    }

    fn current_branch(&self) -> Result<String> {
        let out = self.run_unlocked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    fn check_branch_guard(&self) -> Result<()> {
        let branch = self.current_branch()?;
        if self.policy.protected_branches.contains(&branch) {
            return Err(GitAdapterError::ProtectedBranch { branch });
        }
        if let Some(required) = &self.policy.required_branch {
            if &branch != required {
                return Err(GitAdapterError::BranchNotAllowed { branch });
            }
        } else if !self.policy.allowed_prefixes.is_empty()
            && !self.policy.allowed_prefixes.iter().any(|p| branch.starts_with(p))
        {
            return Err(GitAdapterError::BranchNotAllowed { branch });
        }
        Ok(())
    }

    fn check_destructive(&self, op: DestructiveOp) -> Result<()> {
        if !self.policy.allow_destructive {
            return Err(GitAdapterError::DestructiveNotAllowed { op });
        }
        Ok(())
    }

    fn run_unlocked(&self, args: &[&str]) -> Result<GitOutput> {
        let dir = self.repo.workdir().to_string_lossy().to_string();
        let out = self.git.run_git(&dir, args).map_err(GitAdapterError::Command)?;
        if !out.success {
            return Err(GitAdapterError::Command(out.stderr.clone()));
        }
        Ok(out)
    }

    /// Run a read-only git command; does not take the per-repo write lock.
    pub fn read(&self, args: &[&str]) -> Result<GitOutput> {
        self.repo.revalidate()?;
        self.run_unlocked(args)
    }

    /// Run a write git command: revalidates the path, enforces the branch
    /// guard, takes the per-repo write lock for the duration.
    pub fn write(&self, args: &[&str]) -> Result<GitOutput> {
        self.repo.revalidate()?;
        self.check_branch_guard()?;
        let path = self.repo.workdir().to_string_lossy().to_string();
        let lock = lock_for(&path);
        let _guard = lock.lock().expect("per-repo write lock poisoned");
        self.run_unlocked(args)
    }

    /// Run a destructive write command, additionally gated on
    /// `allow_destructive`.
    pub fn write_destructive(&self, op: DestructiveOp, args: &[&str]) -> Result<GitOutput> {
        self.check_destructive(op)?;
        self.write(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct ScriptedRunner {
        branch: StdMutex<String>,
    }

    impl GitRunner for ScriptedRunner {
        fn run_git(&self, _dir: &str, args: &[&str]) -> std::result::Result<GitOutput, String> {
            if args == ["rev-parse", "--abbrev-ref", "HEAD"] {
                let branch = self.branch.lock().unwrap().clone();
                return Ok(GitOutput { success: true, stdout: branch, stderr: String::new() });
            }
            Ok(GitOutput { success: true, stdout: String::new(), stderr: String::new() })
        }
    }

    fn fixture_repo() -> (tempfile::TempDir, RepoPath) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let run = |args: &[&str]| {
            std::process::Command::new("git").current_dir(root).args(args).output().unwrap()
        };
        run(&["init"]);
        run(&["config", "user.email", "dev@example.com"]);
        run(&["config", "user.name", "Orchestrator"]);
        std::fs::write(root.join("f.txt"), "x").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "init"]);
        let repo = RepoPath::from_workdir(root).unwrap();
        (tmp, repo)
    }

    #[test]
    fn refuses_write_on_protected_branch() {
        let (_tmp, repo) = fixture_repo();
        let runner = ScriptedRunner { branch: StdMutex::new("main".into()) };
        let adapter = GitAdapter::with_runner(repo, GitAdapterPolicy::default(), Box::new(runner));
        let err = adapter.write(&["commit", "-am", "x"]).unwrap_err();
        assert!(matches!(err, GitAdapterError::ProtectedBranch { .. }));
    }

    #[test]
    fn allows_write_on_unprotected_branch() {
        let (_tmp, repo) = fixture_repo();
        let runner = ScriptedRunner { branch: StdMutex::new("orch/unit-a-1234".into()) };
        let adapter = GitAdapter::with_runner(repo, GitAdapterPolicy::default(), Box::new(runner));
        adapter.write(&["status"]).unwrap();
    }

    #[test]
    fn refuses_destructive_op_without_flag() {
        let (_tmp, repo) = fixture_repo();
        let runner = ScriptedRunner { branch: StdMutex::new("orch/unit-a-1234".into()) };
        let adapter = GitAdapter::with_runner(repo, GitAdapterPolicy::default(), Box::new(runner));
        let err = adapter
            .write_destructive(DestructiveOp::ResetHard, &["reset", "--hard"])
            .unwrap_err();
        assert!(matches!(err, GitAdapterError::DestructiveNotAllowed { .. }));
    }

    #[test]
    fn allows_destructive_op_with_flag() {
        let (_tmp, repo) = fixture_repo();
        let runner = ScriptedRunner { branch: StdMutex::new("orch/unit-a-1234".into()) };
        let policy = GitAdapterPolicy { allow_destructive: true, ..GitAdapterPolicy::default() };
        let adapter = GitAdapter::with_runner(repo, policy, Box::new(runner));
        adapter
            .write_destructive(DestructiveOp::ResetHard, &["reset", "--hard"])
            .unwrap();
    }

    #[test]
    fn required_branch_rejects_mismatch() {
        let (_tmp, repo) = fixture_repo();
        let runner = ScriptedRunner { branch: StdMutex::new("orch/unit-a-1234".into()) };
        let policy = GitAdapterPolicy {
            required_branch: Some("orch/unit-b-5678".into()),
            ..GitAdapterPolicy::default()
        };
        let adapter = GitAdapter::with_runner(repo, policy, Box::new(runner));
        let err = adapter.write(&["status"]).unwrap_err();
        assert!(matches!(err, GitAdapterError::BranchNotAllowed { .. }));
    }
}
