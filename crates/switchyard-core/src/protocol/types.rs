//! Message types for the worker wire protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Method name of the mandatory handshake request.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Method name of the best-effort shutdown notification.
pub const METHOD_SHUTDOWN: &str = "shutdown";
/// Method used to deliver a chat message to a worker.
pub const METHOD_MESSAGE: &str = "message";
/// Method used to invoke a declared tool.
pub const METHOD_TOOL_CALL: &str = "tools/call";
/// Method used to request an analysis.
pub const METHOD_ANALYZE: &str = "analyze";

/// Protocol revision advertised in the handshake.
pub const PROTOCOL_VERSION: &str = "2025-01-01";

/// JSON-RPC style code for an internal worker error.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// Correlation id linking a request to its response.
///
/// Outgoing ids are numeric; ids originated by workers may be either form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Correlation id of requests and responses; notifications have none.
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Short label used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }
}

/// A call expecting exactly one response with the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Reply to a [`Request`], carrying either a result or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    pub const fn success(id: RequestId, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub const fn failure(id: RequestId, error: ErrorObject) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`. An error wins over a result; a response with
    /// neither is a successful `null`.
    pub fn into_outcome(self) -> Result<Value, ErrorObject> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Fire-and-forget message; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

/// Error payload of a failed response.
///
/// Workers may send either a bare string or a `{code, message, data}` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawErrorObject")]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR_CODE, message)
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawErrorObject {
    Text(String),
    Detailed {
        #[serde(default)]
        code: i64,
        message: String,
        #[serde(default)]
        data: Option<Value>,
    },
}

impl From<RawErrorObject> for ErrorObject {
    fn from(raw: RawErrorObject) -> Self {
        match raw {
            RawErrorObject::Text(message) => Self::internal(message),
            RawErrorObject::Detailed {
                code,
                message,
                data,
            } => Self {
                code,
                message,
                data,
            },
        }
    }
}
