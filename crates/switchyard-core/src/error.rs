//! Error types for Switchyard core library.

use thiserror::Error;

/// Result type alias using Switchyard Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for Switchyard operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed wire frame
    #[error("Malformed frame: {0}")]
    Protocol(String),

    /// A partial frame grew past the configured limit
    #[error("Frame exceeds {limit} bytes")]
    FrameTooLarge { limit: usize },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
