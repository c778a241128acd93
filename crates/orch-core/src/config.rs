use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `<workspace>/.orchestrator/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub review: ReviewConfig,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub forwarder: ForwarderConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            review: ReviewConfig::default(),
            github: GitHubConfig::default(),
            event_bus: EventBusConfig::default(),
            forwarder: ForwarderConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load config from `<workspace>/.orchestrator/config.toml`, falling
    /// back to defaults (with a warning) when the file does not exist.
    pub fn load(workspace: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = workspace.into().join(".orchestrator").join("config.toml");
        if path.exists() {
            Self::load_from(path)
        } else {
            tracing::warn!(path = %path.display(), "no config file found, using defaults");
            Ok(EngineConfig::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: EngineConfig =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_task_tree_root")]
    pub task_tree_root: String,
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default = "default_worktree_base")]
    pub worktree_base: String,
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default)]
    pub keep_failed_worktrees: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            task_tree_root: default_task_tree_root(),
            target_branch: default_target_branch(),
            worktree_base: default_worktree_base(),
            branch_prefix: default_branch_prefix(),
            keep_failed_worktrees: false,
        }
    }
}

fn default_task_tree_root() -> String {
    ".".into()
}
fn default_target_branch() -> String {
    "main".into()
}
fn default_worktree_base() -> String {
    "../orchestrator-worktrees".into()
}
fn default_branch_prefix() -> String {
    "orch".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
        }
    }
}

fn default_parallelism() -> usize {
    4
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_max_agent_retries")]
    pub max_agent_retries: u32,
    #[serde(default = "default_max_baseline_retries")]
    pub max_baseline_retries: u32,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default)]
    pub agent_command: Vec<String>,
    #[serde(default)]
    pub baseline_checks: Vec<BaselineCheck>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_agent_retries: default_max_agent_retries(),
            max_baseline_retries: default_max_baseline_retries(),
            agent_timeout_secs: default_agent_timeout_secs(),
            agent_command: Vec::new(),
            baseline_checks: Vec::new(),
        }
    }
}

/// A single named baseline check (format, lint, type-check, ...) run in
/// Phase 2.5 once every task in a unit is complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineCheck {
    pub name: String,
    pub command: String,
}

fn default_max_agent_retries() -> u32 {
    3
}

fn default_max_baseline_retries() -> u32 {
    3
}

fn default_agent_timeout_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_review_timeout_secs")]
    pub review_timeout_secs: u64,
    #[serde(default)]
    pub ci_gate: bool,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            review_timeout_secs: default_review_timeout_secs(),
            ci_gate: false,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_review_timeout_secs() -> u64 {
    2 * 60 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default = "default_github_token_env")]
    pub token_env: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub repo: Option<String>,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token_env: default_github_token_env(),
            owner: None,
            repo: None,
        }
    }
}

fn default_github_token_env() -> String {
    "GITHUB_TOKEN".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_event_bus_buffer")]
    pub buffer_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_event_bus_buffer(),
        }
    }
}

fn default_event_bus_buffer() -> usize {
    1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_forwarder_socket")]
    pub socket_path: String,
    #[serde(default = "default_forwarder_buffer")]
    pub buffer_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: default_forwarder_socket(),
            buffer_size: default_forwarder_buffer(),
        }
    }
}

fn default_forwarder_socket() -> String {
    "/tmp/orchestrator.sock".into()
}
fn default_forwarder_buffer() -> usize {
    1000
}
