//! Byte transports connecting the registry to worker processes.
//!
//! A [`Launcher`] starts a worker and hands back a [`Connection`]: a
//! [`Transport`] for writing frames plus a channel of [`TransportEvent`]s
//! carrying raw output chunks and, last, the exit notice.
//!
//! - [`ProcessLauncher`]: real OS processes over stdio.
//! - [`MemoryLauncher`]: in-process workers for tests and embedding.

pub mod memory;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use switchyard_core::config::AgentDeclaration;
use tokio::sync::mpsc;

pub use memory::{MemoryLauncher, Reply};
pub use process::ProcessLauncher;

/// How to start a worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Tools the worker is allowed to be asked for.
    #[serde(default)]
    pub declared_tools: Vec<String>,
}

impl LaunchSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.declared_tools = tools.into_iter().map(Into::into).collect();
        self
    }
}

impl From<&AgentDeclaration> for LaunchSpec {
    fn from(decl: &AgentDeclaration) -> Self {
        Self {
            command: decl.command.clone(),
            args: decl.args.clone(),
            env: decl.env.clone(),
            working_directory: decl.working_directory.clone(),
            declared_tools: decl.tools.clone(),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Output of a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes, not necessarily aligned to frames.
    Data(Vec<u8>),
    /// The worker is gone. Always the final event.
    Exited(ExitInfo),
}

/// Write side of a worker connection.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one encoded frame.
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Ask the worker to terminate, forcing it after `grace`.
    async fn shutdown(&self, grace: Duration);

    /// OS process id, when there is one.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// A started worker.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Starts workers.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    async fn launch(&self, agent_id: &str, spec: &LaunchSpec) -> Result<Connection, TransportError>;
}

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("Worker input closed")]
    Closed,
}
