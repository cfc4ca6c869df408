//! Switchyard daemon library
//!
//! Dispatches work to long-running worker processes:
//! - Transports for OS processes and in-memory workers
//! - Process registry with handshake and request correlation
//! - Priority scheduler with concurrency cap, retries and timeouts
//! - Dispatch facade returning renderable results

pub mod dispatch;
pub mod error;
pub mod registry;
pub mod transport;

pub use dispatch::AgentDispatcher;
pub use error::{DispatchError, ErrorKind};
pub use registry::ProcessRegistry;
