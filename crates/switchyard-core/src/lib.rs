//! Switchyard Core Library
//!
//! Shared functionality for Switchyard components:
//! - Line-framed JSON wire protocol (message types and codec)
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
