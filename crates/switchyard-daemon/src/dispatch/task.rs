//! Task model.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use switchyard_core::config::SchedulerConfig;

use crate::error::DispatchError;

/// What a task asks the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Message,
    ToolCall,
    Analysis,
}

impl TaskKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::ToolCall => "tool_call",
            Self::Analysis => "analysis",
        }
    }

    pub const fn default_priority(self, config: &SchedulerConfig) -> u32 {
        match self {
            Self::Message => config.message_priority,
            Self::ToolCall => config.tool_priority,
            Self::Analysis => config.analysis_priority,
        }
    }

    pub const fn default_max_retries(self, config: &SchedulerConfig) -> u32 {
        match self {
            Self::Message => config.message_max_retries,
            Self::ToolCall => config.tool_max_retries,
            Self::Analysis => config.analysis_max_retries,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = DispatchError;

    /// Unrecognised kinds are a permanent error.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "message" => Ok(Self::Message),
            "tool_call" | "tool-call" | "tool" => Ok(Self::ToolCall),
            "analysis" => Ok(Self::Analysis),
            other => Err(DispatchError::InvalidTask {
                reason: format!("unknown task kind '{other}'"),
            }),
        }
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    TimedOut,
}

/// A task to be submitted.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub agent_id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub context: Value,
    /// Defaults per kind from the scheduler config.
    pub priority: Option<u32>,
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(agent_id: impl Into<String>, kind: TaskKind, payload: Value) -> Self {
        Self {
            agent_id: agent_id.into(),
            kind,
            payload,
            context: Value::Null,
            priority: None,
            max_retries: None,
        }
    }

    pub fn message(agent_id: impl Into<String>, message: &str, context: Value) -> Self {
        Self::new(agent_id, TaskKind::Message, json!(message)).with_context(context)
    }

    pub fn tool_call(agent_id: impl Into<String>, tool: &str, arguments: Value) -> Self {
        Self::new(
            agent_id,
            TaskKind::ToolCall,
            json!({ "name": tool, "arguments": arguments }),
        )
    }

    pub fn analysis(agent_id: impl Into<String>, data: Value, kind: &str, context: Value) -> Self {
        Self::new(
            agent_id,
            TaskKind::Analysis,
            json!({ "data": data, "kind": kind }),
        )
        .with_context(context)
    }

    #[must_use]
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Tool name of a tool-call payload.
    pub fn tool_name(&self) -> Option<&str> {
        self.payload.get("name").and_then(Value::as_str)
    }

    /// Reject payloads that can never succeed.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.agent_id.trim().is_empty() {
            return Err(DispatchError::InvalidTask {
                reason: "agent id must not be empty".to_string(),
            });
        }
        match self.kind {
            TaskKind::Message => {
                if self.payload.is_null() {
                    return Err(DispatchError::InvalidTask {
                        reason: "message payload must not be null".to_string(),
                    });
                }
            }
            TaskKind::ToolCall => {
                if self.tool_name().is_none_or(|n| n.trim().is_empty()) {
                    return Err(DispatchError::InvalidTask {
                        reason: "tool call requires a tool name".to_string(),
                    });
                }
            }
            TaskKind::Analysis => {
                if self.payload.get("kind").and_then(Value::as_str).is_none() {
                    return Err(DispatchError::InvalidTask {
                        reason: "analysis requires a kind".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// A task owned by the scheduler.
#[derive(Debug, Clone)]
pub(crate) struct Task {
    pub id: String,
    pub agent_id: String,
    pub kind: TaskKind,
    pub payload: Value,
    pub context: Value,
    pub priority: u32,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub submitted: Instant,
}

impl Task {
    pub fn from_new(id: String, new: NewTask, config: &SchedulerConfig) -> Self {
        Self {
            id,
            priority: new.priority.unwrap_or_else(|| new.kind.default_priority(config)),
            max_retries: new
                .max_retries
                .unwrap_or_else(|| new.kind.default_max_retries(config)),
            agent_id: new.agent_id,
            kind: new.kind,
            payload: new.payload,
            context: new.context,
            status: TaskStatus::Pending,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            submitted: Instant::now(),
        }
    }

    /// Put a failed attempt back in line with one less priority point.
    pub fn reset_for_retry(&mut self) {
        self.retry_count += 1;
        self.priority = decayed_priority(self.priority);
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.completed_at = None;
        self.last_error = None;
    }

    pub fn record(&self) -> TaskRecord {
        TaskRecord {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            kind: self.kind,
            status: self.status,
            priority: self.priority,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.last_error.clone(),
        }
    }
}

/// Priority after a failed attempt. Never drops below 1.
pub const fn decayed_priority(priority: u32) -> u32 {
    if priority > 1 { priority - 1 } else { priority }
}

/// Snapshot of a terminal task kept in the history window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub agent_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub priority: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Terminal outcome delivered to the submitter.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub agent_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub retry_count: u32,
    /// Wall time from submission to the terminal state.
    pub elapsed: Duration,
    pub outcome: Result<Value, DispatchError>,
}

impl TaskReport {
    pub(crate) fn from_task(task: &Task, outcome: Result<Value, DispatchError>) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: task.agent_id.clone(),
            kind: task.kind,
            status: task.status,
            retry_count: task.retry_count,
            elapsed: task.submitted.elapsed(),
            outcome,
        }
    }

    pub const fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}
