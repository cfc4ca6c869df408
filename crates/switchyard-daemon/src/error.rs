//! Dispatch error taxonomy.
//!
//! Every failure a caller can observe maps to one [`ErrorKind`]; the kind
//! decides whether the scheduler retries.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::transport::TransportError;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Protocol,
    Timeout,
    Process,
    Remote,
    UnknownAgent,
    Capability,
    AlreadyRegistered,
    InvalidTask,
    RetryExhausted,
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Process => "process",
            Self::Remote => "remote",
            Self::UnknownAgent => "unknown_agent",
            Self::Capability => "capability",
            Self::AlreadyRegistered => "already_registered",
            Self::InvalidTask => "invalid_task",
            Self::RetryExhausted => "retry_exhausted",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Errors from registry and scheduler operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("Malformed frame: {reason}")]
    Protocol { reason: String },

    #[error("No response from '{agent_id}' within {}ms", .after.as_millis())]
    Timeout { agent_id: String, after: Duration },

    #[error("Process error for '{agent_id}': {reason}")]
    Process { agent_id: String, reason: String },

    #[error("Agent '{agent_id}' returned an error: {message} (code {code})")]
    Remote {
        agent_id: String,
        code: i64,
        message: String,
    },

    #[error("Unknown agent: {agent_id}")]
    UnknownAgent { agent_id: String },

    #[error("Tool '{tool}' is not declared by agent '{agent_id}'")]
    Capability { agent_id: String, tool: String },

    #[error("Agent already registered: {agent_id}")]
    AlreadyRegistered { agent_id: String },

    #[error("Invalid task: {reason}")]
    InvalidTask { reason: String },

    #[error("Task {task_id} failed after {attempts} attempts: {last}")]
    RetryExhausted {
        task_id: String,
        attempts: u32,
        last: Box<DispatchError>,
    },

    #[error("service shutdown")]
    Shutdown,
}

impl DispatchError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Process { .. } => ErrorKind::Process,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::UnknownAgent { .. } => ErrorKind::UnknownAgent,
            Self::Capability { .. } => ErrorKind::Capability,
            Self::AlreadyRegistered { .. } => ErrorKind::AlreadyRegistered,
            Self::InvalidTask { .. } => ErrorKind::InvalidTask,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Transient failures the scheduler may retry.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Process | ErrorKind::Remote
        )
    }

    /// Whether the underlying cause is a timeout, looking through retries.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    /// The innermost error kind, looking through retries.
    pub fn root_kind(&self) -> ErrorKind {
        match self {
            Self::RetryExhausted { last, .. } => last.root_kind(),
            other => other.kind(),
        }
    }

    pub(crate) fn process(agent_id: &str, reason: impl Into<String>) -> Self {
        Self::Process {
            agent_id: agent_id.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn from_transport(agent_id: &str, err: &TransportError) -> Self {
        Self::process(agent_id, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        let timeout = DispatchError::Timeout {
            agent_id: "a".into(),
            after: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(DispatchError::process("a", "exited").is_retryable());
        assert!(
            !DispatchError::UnknownAgent {
                agent_id: "a".into()
            }
            .is_retryable()
        );
        assert!(
            !DispatchError::Capability {
                agent_id: "a".into(),
                tool: "t".into()
            }
            .is_retryable()
        );
        assert!(!DispatchError::Shutdown.is_retryable());
    }

    #[test]
    fn exhausted_reports_root_cause() {
        let err = DispatchError::RetryExhausted {
            task_id: "t1".into(),
            attempts: 3,
            last: Box::new(DispatchError::Timeout {
                agent_id: "a".into(),
                after: Duration::from_millis(250),
            }),
        };
        assert!(err.is_timeout());
        assert_eq!(err.root_kind(), ErrorKind::Timeout);
        assert_eq!(err.kind(), ErrorKind::RetryExhausted);
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn shutdown_message_is_stable() {
        assert_eq!(DispatchError::Shutdown.to_string(), "service shutdown");
    }
}
