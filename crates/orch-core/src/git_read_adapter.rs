use thiserror::Error;

/// Errors that can occur when performing read-only git operations.
///
/// These errors are returned by implementations of [`GitReadAdapter`] and
/// cover both low-level I/O failures and git-specific command errors.
#[derive(Debug, Error)]
pub enum GitReadError {
    /// A git command returned a non-zero exit code.
    ///
    /// This typically occurs when:
    /// - The repository path is invalid or not a git repository
    /// - The requested branch or ref doesn't exist
    /// - Git binary is not installed or not in PATH
    /// - Git command encountered an error (stderr is captured in the message)
    #[error("git command failed: {0}")]
    Command(String),

    /// Failed to read from or write to the filesystem during git operations.
    ///
    /// This typically occurs when:
    /// - Repository directory is inaccessible
    /// - Insufficient file permissions
    /// - Disk I/O errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Git command output contained invalid UTF-8.
    ///
    /// This is rare but can occur if:
    /// - File paths in the repository use non-UTF-8 encoding
    /// - Git binary produces unexpected output
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Read-only git operations used by orchestration/UI status flows.
///
/// This is intentionally narrow and excludes write operations (merge/rebase/push).
/// Write-paths remain on the existing shell-based runner until parity testing is done.
pub trait GitReadAdapter: Send + Sync {
    fn current_branch(&self, repo_dir: &str) -> Result<String, GitReadError>;
    fn status_porcelain(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError>;
    fn diff_stat(&self, repo_dir: &str, base: &str, head: &str) -> Result<String, GitReadError>;
    fn conflict_files(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError>;
}

/// Shell-based read adapter. This is the baseline behavior for migration.
pub struct ShellGitReadAdapter;

impl ShellGitReadAdapter {
    fn run_git(repo_dir: &str, args: &[&str]) -> Result<String, GitReadError> {
        let output = std::process::Command::new("git")
            .current_dir(repo_dir)
            .args(args)
            .output()?;

        if !output.status.success() {
            let stderr = String::from_utf8(output.stderr)
                .unwrap_or_else(|_| "git returned non-utf8 stderr".to_string());
            return Err(GitReadError::Command(stderr.trim().to_string()));
        }

        let stdout = String::from_utf8(output.stdout)?;
        Ok(stdout.trim().to_string())
    }
}

impl GitReadAdapter for ShellGitReadAdapter {
    fn current_branch(&self, repo_dir: &str) -> Result<String, GitReadError> {
        Self::run_git(repo_dir, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn status_porcelain(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        let out = Self::run_git(repo_dir, &["status", "--porcelain"])?;
        let lines = out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        Ok(lines)
    }

    fn diff_stat(&self, repo_dir: &str, base: &str, head: &str) -> Result<String, GitReadError> {
        Self::run_git(repo_dir, &["diff", "--stat", base, head])
    }

    fn conflict_files(&self, repo_dir: &str) -> Result<Vec<String>, GitReadError> {
        let out = Self::run_git(repo_dir, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(ToOwned::to_owned)
            .collect())
    }
}

/// Create the default read adapter for the current build.
pub fn default_read_adapter() -> Box<dyn GitReadAdapter> {
    Box::new(ShellGitReadAdapter)
}
