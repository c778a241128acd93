//! The Agent Adapter: a thin subprocess gateway to the external coding-agent
//! binary.
//!
//! The adapter never parses the agent's stdout as protocol. Whatever the
//! agent actually did is measured afterwards by the Worker re-reading task
//! frontmatter and git state — the adapter's only job is to run the
//! subprocess with the right flags and hand back its exit code and
//! combined output log.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::state_machine::{AgentEvent, AgentStateMachine};

#[derive(Debug, Error)]
pub enum AgentAdapterError {
    #[error("failed to spawn agent process: {0}")]
    Spawn(std::io::Error),
    #[error("agent invocation timed out after {0:?}")]
    Timeout(Duration),
    #[error("agent invocation was cancelled")]
    Cancelled,
    #[error("io error reading agent output: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AgentAdapterError>;

/// One invocation of the agent subprocess.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub working_dir: PathBuf,
    pub prompt: String,
    pub max_turns: Option<u32>,
}

/// The outcome of one invocation, independent of whether it "succeeded" —
/// exit code and log are evidence the Worker interprets, not a verdict.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub exit_code: i32,
    pub merged_output: String,
}

/// Command template used to invoke the external agent. The first element is
/// the binary; remaining elements are flags applied before the prompt
/// argument. Configured via `WorkerConfig::agent_command`, falling back to
/// the built-in default when empty.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub argv: Vec<String>,
}

impl AgentCommand {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// The default invocation: non-interactive, permission prompts bypassed.
    pub fn default_command() -> Self {
        Self::new(vec![
            "claude".to_string(),
            "-p".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ])
    }
}

impl Default for AgentCommand {
    fn default() -> Self {
        Self::default_command()
    }
}

/// Runs the configured agent binary against one [`AgentRequest`].
pub struct AgentAdapter {
    command: AgentCommand,
    timeout: Duration,
}

impl AgentAdapter {
    pub fn new(command: AgentCommand, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    /// Invoke the agent, honouring `cancel` cooperatively: on cancellation
    /// the subprocess is killed and reaped rather than left orphaned.
    pub async fn invoke(
        &self,
        request: &AgentRequest,
        mut cancel: tokio::sync::broadcast::Receiver<()>,
    ) -> Result<AgentResponse> {
        let mut sm = AgentStateMachine::new();
        let _ = sm.transition(AgentEvent::Start);

        let mut cmd = Command::new(&self.command.argv[0]);
        cmd.args(&self.command.argv[1..]);
        if let Some(max_turns) = request.max_turns {
            cmd.arg("--max-turns").arg(max_turns.to_string());
        }
        cmd.arg(&request.prompt);
        cmd.current_dir(&request.working_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!(working_dir = %request.working_dir.display(), "invoking agent");

        let mut child = cmd.spawn().map_err(AgentAdapterError::Spawn)?;
        let _ = sm.transition(AgentEvent::Spawned);

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let wait_fut = async {
            let mut out = String::new();
            let mut err = String::new();
            let (_, _, status) = tokio::join!(
                stdout.read_to_string(&mut out),
                stderr.read_to_string(&mut err),
                child.wait(),
            );
            (out, err, status)
        };

        tokio::select! {
            result = wait_fut => {
                let (out, err, status) = result;
                let status = status.map_err(AgentAdapterError::Io)?;
                let merged_output = format!("{out}{err}");
                let _ = sm.transition(AgentEvent::Stop);
                Ok(AgentResponse {
                    exit_code: status.code().unwrap_or(-1),
                    merged_output,
                })
            }
            _ = tokio::time::sleep(self.timeout) => {
                warn!(timeout = ?self.timeout, "agent invocation timed out, killing process");
                let _ = child.kill().await;
                Err(AgentAdapterError::Timeout(self.timeout))
            }
            _ = cancel.recv() => {
                warn!("agent invocation cancelled, killing process");
                let _ = child.kill().await;
                Err(AgentAdapterError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn shutdown_rx() -> tokio::sync::broadcast::Receiver<()> {
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        rx
    }

    #[tokio::test]
    async fn successful_invocation_captures_exit_code_and_output() {
        let adapter = AgentAdapter::new(
            AgentCommand::new(vec!["sh".into(), "-c".into()]),
            Duration::from_secs(5),
        );
        let tmp = tempfile::tempdir().unwrap();
        let request = AgentRequest {
            working_dir: tmp.path().to_path_buf(),
            prompt: "echo hello".into(),
            max_turns: None,
        };
        let response = adapter.invoke(&request, shutdown_rx()).await.unwrap();
        assert_eq!(response.exit_code, 0);
        assert!(response.merged_output.contains("hello"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_treated_as_error() {
        let adapter = AgentAdapter::new(
            AgentCommand::new(vec!["sh".into(), "-c".into()]),
            Duration::from_secs(5),
        );
        let tmp = tempfile::tempdir().unwrap();
        let request = AgentRequest {
            working_dir: tmp.path().to_path_buf(),
            prompt: "exit 7".into(),
            max_turns: None,
        };
        let response = adapter.invoke(&request, shutdown_rx()).await.unwrap();
        assert_eq!(response.exit_code, 7);
    }

    #[tokio::test]
    async fn timeout_kills_process_and_returns_error() {
        let adapter = AgentAdapter::new(
            AgentCommand::new(vec!["sh".into(), "-c".into()]),
            Duration::from_millis(50),
        );
        let tmp = tempfile::tempdir().unwrap();
        let request = AgentRequest {
            working_dir: tmp.path().to_path_buf(),
            prompt: "sleep 5".into(),
            max_turns: None,
        };
        let result = adapter.invoke(&request, shutdown_rx()).await;
        assert!(matches!(result, Err(AgentAdapterError::Timeout(_))));
    }

    #[tokio::test]
    async fn cancellation_kills_process_and_returns_error() {
        let adapter = AgentAdapter::new(
            AgentCommand::new(vec!["sh".into(), "-c".into()]),
            Duration::from_secs(30),
        );
        let tmp = tempfile::tempdir().unwrap();
        let request = AgentRequest {
            working_dir: tmp.path().to_path_buf(),
            prompt: "sleep 5".into(),
            max_turns: None,
        };
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        let adapter = std::sync::Arc::new(adapter);
        let adapter2 = adapter.clone();
        let handle = tokio::spawn(async move { adapter2.invoke(&request, rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(AgentAdapterError::Cancelled)));
    }
}
