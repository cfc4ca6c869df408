//! Caller-facing task results.
//!
//! Front-ends render an [`AgentResult`] instead of handling raw errors.

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::task::{TaskKind, TaskReport};
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub status: ResultStatus,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl AgentResult {
    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Shape a terminal report.
    ///
    /// `request` is the tool-call payload (`{name, arguments}`) for tool
    /// tasks and is echoed back in `tool_calls`.
    pub fn from_report(report: TaskReport, request: Option<&Value>) -> Self {
        let execution_time_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX);
        let mut metadata = Map::new();
        metadata.insert("taskId".into(), json!(report.task_id));
        metadata.insert("kind".into(), json!(report.kind));
        metadata.insert("retryCount".into(), json!(report.retry_count));

        match report.outcome {
            Ok(value) => {
                let message = extract_message(&value);
                let tool_calls = (report.kind == TaskKind::ToolCall).then(|| {
                    let mut call = request.cloned().unwrap_or_else(|| json!({}));
                    if let Some(map) = call.as_object_mut() {
                        map.insert("result".into(), value.clone());
                    }
                    vec![call]
                });
                if let Some(extra) = value.get("metadata").and_then(Value::as_object) {
                    for (k, v) in extra {
                        metadata.entry(k.clone()).or_insert_with(|| v.clone());
                    }
                }
                if report.kind == TaskKind::Analysis || message.is_none() {
                    metadata.insert("result".into(), value);
                }
                Self {
                    agent_id: report.agent_id,
                    message,
                    tool_calls,
                    metadata: Some(Value::Object(metadata)),
                    status: ResultStatus::Success,
                    execution_time_ms,
                    error: None,
                    error_kind: None,
                }
            }
            Err(err) => {
                let status = if err.is_timeout() {
                    ResultStatus::Timeout
                } else {
                    ResultStatus::Error
                };
                Self {
                    agent_id: report.agent_id,
                    message: None,
                    tool_calls: None,
                    metadata: Some(Value::Object(metadata)),
                    status,
                    execution_time_ms,
                    error: Some(err.to_string()),
                    error_kind: Some(err.root_kind()),
                }
            }
        }
    }
}

/// Text reply of a worker: a bare string, or a `message`/`content`/`text` field.
fn extract_message(value: &Value) -> Option<String> {
    if let Some(s) = value.as_str() {
        return Some(s.to_string());
    }
    ["message", "content", "text"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
