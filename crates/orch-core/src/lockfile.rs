//! Single-instance lockfile for the orchestrator engine.
//!
//! There is no HTTP server here for a lockfile to help discover — this only
//! guards against two supervisor instances running against the same task
//! tree at once. The engine writes `<workspace>/.orchestrator/orchestrator.lock`
//! on start and removes it on clean shutdown.
//!
//! ## Race safety
//!
//! `acquire()` uses `O_CREAT | O_EXCL` to atomically create the lockfile.
//! If two instances race, exactly one wins the create — the loser gets
//! `AlreadyRunning` and can check whether the winner is still alive.
//!
//! ## Stale lockfile recovery
//!
//! The PID in the lockfile is checked via `kill(pid, 0)`. If the process is
//! dead (crash, SIGKILL), the stale lockfile is removed automatically and
//! the next instance can start.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Runtime identity written by the engine after it starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub started_at: String,
    pub project_path: Option<String>,
    pub version: String,
}

/// Result of trying to acquire the lockfile.
pub enum AcquireResult {
    /// We created the lockfile — we own it.
    Acquired,
    /// Another live instance holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up — retry.
    StaleRemoved,
}

impl DaemonLockfile {
    /// Canonical lockfile path for a given workspace root.
    pub fn path_for(workspace: &Path) -> PathBuf {
        workspace.join(".orchestrator").join("orchestrator.lock")
    }

    /// Try to exclusively create and write the lockfile under `workspace`.
    ///
    /// Uses `O_CREAT | O_EXCL` so two instances racing will have exactly one
    /// winner. The loser gets `AlreadyRunning` or `StaleRemoved`.
    pub fn acquire(&self, workspace: &Path) -> std::io::Result<AcquireResult> {
        let path = Self::path_for(workspace);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true) // O_CREAT | O_EXCL — fails if file exists
            .open(&path)
        {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(std::io::Error::other)?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::read(workspace) {
                    Some(existing) if existing.is_alive() => {
                        Ok(AcquireResult::AlreadyRunning(existing))
                    }
                    _ => {
                        tracing::info!("removing stale orchestrator lockfile");
                        Self::remove(workspace);
                        Ok(AcquireResult::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Acquire with automatic retry after stale cleanup.
    ///
    /// Returns `Ok(())` if we own the lockfile, `Err` if another instance is
    /// running or an I/O error occurred.
    pub fn acquire_or_fail(&self, workspace: &Path) -> Result<(), String> {
        for attempt in 0..2 {
            match self.acquire(workspace) {
                Ok(AcquireResult::Acquired) => return Ok(()),
                Ok(AcquireResult::AlreadyRunning(existing)) => {
                    return Err(format!(
                        "orchestrator already running against this workspace (pid={})",
                        existing.pid,
                    ));
                }
                Ok(AcquireResult::StaleRemoved) if attempt == 0 => {
                    tracing::info!("stale lockfile removed, retrying acquire");
                    continue;
                }
                Ok(AcquireResult::StaleRemoved) => {
                    return Err("failed to acquire lockfile after stale cleanup".into());
                }
                Err(e) => return Err(format!("lockfile I/O error: {e}")),
            }
        }
        Err("lockfile acquire failed".into())
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read(workspace: &Path) -> Option<Self> {
        let path = Self::path_for(workspace);
        let content = std::fs::read_to_string(&path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the lockfile.
    pub fn remove(workspace: &Path) {
        let _ = std::fs::remove_file(Self::path_for(workspace));
    }

    /// Check if the PID in this lockfile is still alive.
    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    /// Read the lockfile, validate the PID is alive, and auto-remove stale entries.
    ///
    /// Returns `Some(lockfile)` only if the file exists AND the PID is alive.
    pub fn read_valid(workspace: &Path) -> Option<Self> {
        let lock = Self::read(workspace)?;
        if lock.is_alive() {
            Some(lock)
        } else {
            tracing::info!(
                pid = lock.pid,
                "removing stale orchestrator lockfile (process not running)"
            );
            Self::remove(workspace);
            None
        }
    }
}

/// Process-wide merge lock serializing the rebase→push→merge sequence across
/// units.
///
/// The scheduler may run many workers concurrently, but only one of them may
/// be mid-merge against the target branch at a time — otherwise two workers
/// could race a rebase against a moving target. `tokio::sync::Mutex` queues
/// waiters FIFO, so contending workers merge in first-come-first-served order
/// rather than whichever wins an OS scheduling race.
pub struct MergeLock {
    inner: tokio::sync::Mutex<()>,
}

impl MergeLock {
    pub fn new() -> Self {
        Self {
            inner: tokio::sync::Mutex::new(()),
        }
    }

    /// Wait for and hold the merge lock until the guard is dropped.
    pub async fn acquire(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.inner.lock().await
    }
}

impl Default for MergeLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // On non-Unix platforms, assume alive (conservative — avoids accidental cleanup).
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_dead() {
        // PID 4_000_000 is extremely unlikely to exist.
        assert!(!pid_alive(4_000_000));
    }

    #[test]
    fn lockfile_roundtrip() {
        let lock = DaemonLockfile {
            pid: std::process::id(),
            started_at: "2026-02-22T00:00:00Z".into(),
            project_path: Some("/tmp/test-project".into()),
            version: "0.1.0".into(),
        };

        let json = serde_json::to_string_pretty(&lock).unwrap();
        let parsed: DaemonLockfile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pid, lock.pid);
        assert_eq!(parsed.project_path.as_deref(), Some("/tmp/test-project"));
    }

    #[test]
    fn acquire_then_acquire_again_reports_running() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = DaemonLockfile {
            pid: std::process::id(),
            started_at: "now".into(),
            project_path: None,
            version: "0.1.0".into(),
        };
        assert!(matches!(lock.acquire(tmp.path()).unwrap(), AcquireResult::Acquired));
        assert!(matches!(
            lock.acquire(tmp.path()).unwrap(),
            AcquireResult::AlreadyRunning(_)
        ));
    }

    #[test]
    fn stale_lockfile_from_dead_pid_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = DaemonLockfile {
            pid: 4_000_000,
            started_at: "now".into(),
            project_path: None,
            version: "0.1.0".into(),
        };
        stale.acquire(tmp.path()).unwrap();

        let fresh = DaemonLockfile {
            pid: std::process::id(),
            started_at: "now".into(),
            project_path: None,
            version: "0.1.0".into(),
        };
        assert!(matches!(
            fresh.acquire(tmp.path()).unwrap(),
            AcquireResult::StaleRemoved
        ));
        assert!(matches!(fresh.acquire(tmp.path()).unwrap(), AcquireResult::Acquired));
    }

    #[tokio::test]
    async fn merge_lock_serializes_waiters() {
        let lock = std::sync::Arc::new(MergeLock::new());
        let guard = lock.acquire().await;
        let lock2 = lock.clone();
        let handle = tokio::spawn(async move {
            let _g = lock2.acquire().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        drop(guard);
        handle.await.unwrap();
    }

    #[test]
    fn is_alive_for_current_process() {
        let lock = DaemonLockfile {
            pid: std::process::id(),
            started_at: String::new(),
            project_path: None,
            version: String::new(),
        };
        assert!(lock.is_alive());
    }
}
