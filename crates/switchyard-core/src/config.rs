//! Configuration resolution for Switchyard.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/switchyard/config.toml)
//! 3. Project config (.switchyard/config.toml)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::protocol::DEFAULT_MAX_FRAME_BYTES;

/// Complete Switchyard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub agents: Vec<AgentDeclaration>,
}

/// Task scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks executing at once.
    pub max_concurrent: usize,
    /// Interval of the dispatch loop.
    pub poll_interval_ms: u64,
    /// Outer per-task timeout.
    pub task_timeout_ms: u64,
    /// Terminal tasks kept in the in-memory history window.
    pub history_limit: usize,
    pub message_priority: u32,
    pub tool_priority: u32,
    pub analysis_priority: u32,
    pub message_max_retries: u32,
    pub tool_max_retries: u32,
    pub analysis_max_retries: u32,
    /// Consecutive failures before an agent is reported degraded.
    pub degraded_failure_threshold: u32,
    /// Consecutive failures before an agent is reported unavailable.
    pub unavailable_failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            poll_interval_ms: 100,
            task_timeout_ms: 30_000,
            history_limit: 1_000,
            message_priority: 5,
            tool_priority: 7,
            analysis_priority: 6,
            message_max_retries: 2,
            tool_max_retries: 1,
            analysis_max_retries: 1,
            degraded_failure_threshold: 3,
            unavailable_failure_threshold: 10,
        }
    }
}

impl SchedulerConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub const fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    /// Reject values the dispatch loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("scheduler.max_concurrent must be > 0".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config(
                "scheduler.poll_interval_ms must be > 0".into(),
            ));
        }
        if self.task_timeout_ms == 0 {
            return Err(Error::Config("scheduler.task_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Process registry tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Inner per-request timeout; kept at or below the task timeout.
    pub request_timeout_ms: u64,
    /// Timeout for the `initialize` handshake.
    pub handshake_timeout_ms: u64,
    /// Grace period between graceful termination and a forced kill.
    pub terminate_grace_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            terminate_grace_secs: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl RegistryConfig {
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Logging output settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// A worker process to register at start-up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentDeclaration {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub tools: Vec<String>,
}

impl Config {
    /// Check invariants and normalise dependent values.
    ///
    /// The inner request timeout is clamped to the outer task timeout.
    pub fn validate(&mut self) -> Result<()> {
        self.scheduler.validate()?;
        if self.registry.request_timeout_ms > self.scheduler.task_timeout_ms {
            warn!(
                request_timeout_ms = self.registry.request_timeout_ms,
                task_timeout_ms = self.scheduler.task_timeout_ms,
                "Request timeout exceeds task timeout, clamping"
            );
            self.registry.request_timeout_ms = self.scheduler.task_timeout_ms;
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(Error::Config("agent id must not be empty".into()));
            }
            if agent.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "agent '{}' has an empty command",
                    agent.id
                )));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Config(format!("duplicate agent id '{}'", agent.id)));
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".switchyard").join("config.toml");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);
    config.validate()?;

    Ok(config)
}

/// Load an explicit config file, skipping the global and project layers.
///
/// Environment overrides still apply.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let mut config = Config::default();
    merge_config(&mut config, load_config_file(path)?);
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchyard").join("config.toml"))
}

/// Read a single TOML config file.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    toml::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.scheduler = overlay.scheduler;
    base.registry = overlay.registry;
    base.logging = overlay.logging;

    // Agents merge by id; later layers replace earlier declarations.
    for agent in overlay.agents {
        if let Some(existing) = base.agents.iter_mut().find(|a| a.id == agent.id) {
            *existing = agent;
        } else {
            base.agents.push(agent);
        }
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(n) = env_parse("SWITCHYARD_MAX_CONCURRENT") {
        config.scheduler.max_concurrent = n;
    }
    if let Some(n) = env_parse("SWITCHYARD_TASK_TIMEOUT_MS") {
        config.scheduler.task_timeout_ms = n;
    }
    if let Some(n) = env_parse("SWITCHYARD_POLL_INTERVAL_MS") {
        config.scheduler.poll_interval_ms = n;
    }
    if let Some(n) = env_parse("SWITCHYARD_REQUEST_TIMEOUT_MS") {
        config.registry.request_timeout_ms = n;
    }
    if let Ok(val) = std::env::var("SWITCHYARD_LOG_LEVEL") {
        config.logging.level = val;
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let val = std::env::var(key).ok()?;
    let parsed = val.parse().ok();
    if parsed.is_none() {
        warn!(key, value = %val, "Ignoring unparsable environment override");
    }
    parsed
}
