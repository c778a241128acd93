use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("git command failed: {0}")]
    GitCommand(String),

    #[error("not a git repository: {0}")]
    NotARepo(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path is empty")]
    EmptyPath,

    #[error("path is not absolute: {0}")]
    NotAbsolute(String),

    #[error("path is not a directory: {0}")]
    NotADirectory(String),

    #[error("path is not a git worktree (toplevel does not resolve): {0}")]
    NotAWorktree(String),

    #[error("toplevel {toplevel} does not equal path {path}")]
    ToplevelMismatch { toplevel: String, path: String },

    #[error("refusing to operate directly on the repo root: {0}")]
    IsRepoRoot(String),

    #[error("path is outside the configured worktree base: {0}")]
    OutsideWorktreeBase(String),

    #[error("invalid repo path: gitdir and workdir mismatch")]
    InvalidRepoPath,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RepoError>;

// ---------------------------------------------------------------------------
// RepoPath — gitdir/workdir separation with path-validated construction
// ---------------------------------------------------------------------------

/// A git repository's two fundamental paths: the `.git` directory (or bare
/// repo path) and the working directory (checkout). Separating them
/// supports worktrees, bare repos, and submodules where the two diverge.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoPath {
    gitdir: PathBuf,
    workdir: PathBuf,
}

impl RepoPath {
    /// Create a RepoPath from a working directory, auto-discovering the gitdir.
    /// Performs no worktree-base validation; use [`RepoPath::validated`] for
    /// paths that will be handed to write operations.
    pub fn from_workdir(workdir: impl Into<PathBuf>) -> Result<Self> {
        let workdir = workdir.into();
        if !workdir.exists() {
            return Err(RepoError::PathNotFound(workdir.display().to_string()));
        }

        let gitdir = discover_gitdir(&workdir)?;
        Ok(Self { gitdir, workdir })
    }

    /// Create a RepoPath with explicit gitdir and workdir (for worktrees).
    pub fn new(gitdir: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            gitdir: gitdir.into(),
            workdir: workdir.into(),
        }
    }

    /// Construct a RepoPath from `path`, enforcing the full validation
    /// checklist: non-empty, absolute, canonical, exists, is a directory,
    /// is a git worktree whose toplevel resolves and equals `path`, is not
    /// the repo root (unless `allow_repo_root`), and is under
    /// `worktree_base` (unless `allow_outside_base`).
    pub fn validated(
        path: impl AsRef<Path>,
        worktree_base: &Path,
        allow_repo_root: bool,
        allow_outside_base: bool,
    ) -> Result<Self> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(RepoError::EmptyPath);
        }
        if !path.is_absolute() {
            return Err(RepoError::NotAbsolute(path.display().to_string()));
        }
        let canonical = path
            .canonicalize()
            .map_err(|_| RepoError::PathNotFound(path.display().to_string()))?;
        if !canonical.is_dir() {
            return Err(RepoError::NotADirectory(canonical.display().to_string()));
        }

        let toplevel = git_toplevel(&canonical)
            .ok_or_else(|| RepoError::NotAWorktree(canonical.display().to_string()))?;
        if toplevel != canonical {
            return Err(RepoError::ToplevelMismatch {
                toplevel: toplevel.display().to_string(),
                path: canonical.display().to_string(),
            });
        }

        if !allow_repo_root {
            if let Ok(gitdir) = discover_gitdir(&canonical) {
                if gitdir.parent() == Some(canonical.as_path()) {
                    return Err(RepoError::IsRepoRoot(canonical.display().to_string()));
                }
            }
        }

        if !allow_outside_base {
            let base = worktree_base
                .canonicalize()
                .unwrap_or_else(|_| worktree_base.to_path_buf());
            if !canonical.starts_with(&base) {
                return Err(RepoError::OutsideWorktreeBase(canonical.display().to_string()));
            }
        }

        let gitdir = discover_gitdir(&canonical)?;
        Ok(Self {
            gitdir,
            workdir: canonical,
        })
    }

    /// Re-run the existence/directory/toplevel checks (points 4-7) against
    /// the current filesystem state. A hostile or racing caller may have
    /// swapped the directory out from under a previously-validated path.
    pub fn revalidate(&self) -> Result<()> {
        if !self.workdir.exists() {
            return Err(RepoError::PathNotFound(self.workdir.display().to_string()));
        }
        if !self.workdir.is_dir() {
            return Err(RepoError::NotADirectory(self.workdir.display().to_string()));
        }
        let toplevel = git_toplevel(&self.workdir)
            .ok_or_else(|| RepoError::NotAWorktree(self.workdir.display().to_string()))?;
        if toplevel != self.workdir {
            return Err(RepoError::ToplevelMismatch {
                toplevel: toplevel.display().to_string(),
                path: self.workdir.display().to_string(),
            });
        }
        Ok(())
    }

    /// The `.git` directory path.
    pub fn gitdir(&self) -> &Path {
        &self.gitdir
    }

    /// The working directory path.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Whether this is a worktree (gitdir differs from workdir/.git).
    pub fn is_worktree(&self) -> bool {
        let expected_gitdir = self.workdir.join(".git");
        self.gitdir != expected_gitdir
    }

    /// Whether this is a bare repository (no workdir checkout).
    pub fn is_bare(&self) -> bool {
        self.gitdir == self.workdir
    }
}

impl std::fmt::Display for RepoPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.workdir.display())
    }
}

/// Discover the gitdir for a working directory via `git rev-parse --git-dir`.
pub fn discover_gitdir(workdir: &Path) -> Result<PathBuf> {
    discover_gitdir_shell(workdir)
}

/// Shell-out fallback for gitdir discovery (`git rev-parse --git-dir`).
fn discover_gitdir_shell(workdir: &Path) -> Result<PathBuf> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--git-dir"])
        .current_dir(workdir)
        .output()?;

    if !output.status.success() {
        return Err(RepoError::NotARepo(workdir.display().to_string()));
    }

    let gitdir_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let gitdir = Path::new(&gitdir_str);

    // git rev-parse may return relative path
    if gitdir.is_absolute() {
        Ok(gitdir.to_path_buf())
    } else {
        Ok(workdir.join(gitdir))
    }
}

/// Resolve `git rev-parse --show-toplevel` for `path`, canonicalized.
fn git_toplevel(path: &Path) -> Option<PathBuf> {
    let output = std::process::Command::new("git")
        .args(["rev-parse", "--show-toplevel"])
        .current_dir(path)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let raw = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Path::new(&raw).canonicalize().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
