//! Task dispatch: priority scheduler, execution pool, agent statistics.
//!
//! - [`TaskScheduler`]: priority queue, dispatch loop, retry and timeout policy.
//! - [`ExecutionPool`]: semaphore-based concurrency cap for executing tasks.
//! - [`AgentStatusTable`]: per-agent counts, latency and health.
//! - [`AgentDispatcher`]: the public API front-ends call.

pub mod pool;
pub mod result;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod task;

pub use pool::{ExecutionPool, RunningTask};
pub use result::{AgentResult, ResultStatus};
pub use scheduler::{TaskHandle, TaskScheduler};
pub use service::{AgentDispatcher, HealthReport, OverallHealth};
pub use status::{AgentStatus, AgentStatusTable, HealthLevel};
pub use task::{NewTask, TaskKind, TaskRecord, TaskReport, TaskStatus};
