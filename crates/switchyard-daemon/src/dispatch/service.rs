//! Public dispatch API.
//!
//! [`AgentDispatcher`] ties a [`ProcessRegistry`] and a [`TaskScheduler`]
//! together and exposes the operations front-ends and agent-registration
//! flows consume.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use switchyard_core::config::SchedulerConfig;
use switchyard_core::{Config, Error as ConfigError};
use tracing::info;

use super::pool::RunningTask;
use super::result::AgentResult;
use super::scheduler::TaskScheduler;
use super::status::{AgentStatus, HealthLevel};
use super::task::{NewTask, TaskRecord};
use crate::error::DispatchError;
use crate::registry::{ProcessRegistry, ProcessState, ServerStatus};
use crate::transport::{LaunchSpec, Launcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    /// `None` when the agent has statistics but no live registration.
    pub process_state: Option<ProcessState>,
    pub health: HealthLevel,
    pub busy: bool,
    pub total_tasks: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: OverallHealth,
    pub agents: Vec<AgentHealth>,
    pub queue_depth: usize,
    pub active_tasks: usize,
    pub free_slots: usize,
    pub running: Vec<RunningTask>,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

/// Dispatch facade over one registry and one scheduler.
pub struct AgentDispatcher {
    registry: Arc<ProcessRegistry>,
    scheduler: TaskScheduler,
}

impl AgentDispatcher {
    /// Build the registry and scheduler from `config` and start dispatching.
    ///
    /// The config is validated first; a request timeout above the task
    /// timeout is clamped to it.
    pub fn new(launcher: Arc<dyn Launcher>, config: &Config) -> Result<Self, ConfigError> {
        let mut config = config.clone();
        config.validate()?;
        let registry = Arc::new(ProcessRegistry::new(launcher, config.registry));
        Self::with_registry(registry, config.scheduler)
    }

    /// Start a scheduler over an existing registry.
    ///
    /// Fails when the registry's request timeout outlasts the task timeout.
    pub fn with_registry(
        registry: Arc<ProcessRegistry>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let request_timeout_ms = registry.config().request_timeout_ms;
        if request_timeout_ms > config.task_timeout_ms {
            return Err(ConfigError::Config(format!(
                "registry.request_timeout_ms ({request_timeout_ms}) exceeds scheduler.task_timeout_ms ({})",
                config.task_timeout_ms
            )));
        }
        let scheduler = TaskScheduler::new(Arc::clone(&registry), config);
        scheduler.start();
        Ok(Self {
            registry,
            scheduler,
        })
    }

    pub const fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    // -- Dispatch API --

    pub async fn submit_message(&self, agent_id: &str, message: &str, context: Value) -> AgentResult {
        self.submit(NewTask::message(agent_id, message, context)).await
    }

    pub async fn submit_tool_call(&self, agent_id: &str, tool: &str, parameters: Value) -> AgentResult {
        self.submit(NewTask::tool_call(agent_id, tool, parameters)).await
    }

    pub async fn submit_analysis(
        &self,
        agent_id: &str,
        data: Value,
        analysis_kind: &str,
        context: Value,
    ) -> AgentResult {
        self.submit(NewTask::analysis(agent_id, data, analysis_kind, context))
            .await
    }

    /// Submit any task and wait for its shaped result.
    pub async fn submit(&self, task: NewTask) -> AgentResult {
        let request = task.payload.clone();
        let handle = self.scheduler.submit(task).await;
        let report = handle.wait().await;
        AgentResult::from_report(report, Some(&request))
    }

    pub fn get_agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.scheduler.agent_status(agent_id)
    }

    pub fn list_agent_statuses(&self) -> Vec<AgentStatus> {
        self.scheduler.agent_statuses()
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler.queue_depth()
    }

    pub fn active_task_count(&self) -> usize {
        self.scheduler.active_count()
    }

    pub fn task_history(&self, limit: usize) -> Vec<TaskRecord> {
        self.scheduler.history(limit)
    }

    /// Aggregate health. Degraded when any agent is unhealthy or any
    /// registered worker is not ready.
    #[allow(clippy::cast_precision_loss)]
    pub async fn health_check(&self) -> HealthReport {
        let statuses = self.scheduler.agent_statuses();
        let processes = self.registry.statuses().await;

        let mut total = 0u64;
        let mut successes = 0u64;
        let mut weighted_latency = 0.0f64;
        let mut agents = Vec::with_capacity(statuses.len());
        for status in statuses {
            let process_state = processes
                .iter()
                .find(|p| p.agent_id == status.agent_id)
                .map(|p| p.state);
            total += status.total_tasks;
            successes += status.successes;
            weighted_latency += status.average_latency_ms * status.total_tasks as f64;
            agents.push(AgentHealth {
                process_state,
                health: status.health,
                busy: status.is_busy(),
                total_tasks: status.total_tasks,
                success_rate: ratio(status.successes, status.total_tasks),
                average_latency_ms: status.average_latency_ms,
                agent_id: status.agent_id,
            });
        }

        let unhealthy_agent = agents.iter().any(|a| a.health != HealthLevel::Healthy);
        let unready_process = processes.iter().any(|p| p.state != ProcessState::Ready);
        let status = if unhealthy_agent || unready_process {
            OverallHealth::Degraded
        } else {
            OverallHealth::Healthy
        };

        HealthReport {
            status,
            agents,
            queue_depth: self.scheduler.queue_depth(),
            active_tasks: self.scheduler.active_count(),
            free_slots: self.scheduler.free_slots(),
            running: self.scheduler.running().await,
            success_rate: ratio(successes, total),
            average_latency_ms: if total == 0 {
                0.0
            } else {
                weighted_latency / total as f64
            },
        }
    }

    // -- Process management --

    pub async fn register_server(
        &self,
        agent_id: &str,
        spec: LaunchSpec,
    ) -> Result<ServerStatus, DispatchError> {
        let status = self.registry.register(agent_id, spec).await?;
        self.scheduler.statuses().ensure(agent_id);
        Ok(status)
    }

    pub async fn send_message(&self, agent_id: &str, payload: Value) -> Result<Value, DispatchError> {
        self.registry.send_message(agent_id, payload).await
    }

    pub async fn execute_tool(
        &self,
        agent_id: &str,
        tool: &str,
        parameters: Value,
    ) -> Result<Value, DispatchError> {
        self.registry.execute_tool(agent_id, tool, parameters).await
    }

    pub async fn list_tools(&self, agent_id: &str) -> Result<Vec<String>, DispatchError> {
        self.registry.list_tools(agent_id).await
    }

    pub async fn get_server_status(&self, agent_id: &str) -> Option<ServerStatus> {
        self.registry.status(agent_id).await
    }

    pub async fn get_all_server_statuses(&self) -> Vec<ServerStatus> {
        self.registry.statuses().await
    }

    pub async fn stop_server(&self, agent_id: &str) -> Result<(), DispatchError> {
        self.registry.stop(agent_id).await
    }

    /// Shut the scheduler down, then stop every worker.
    pub async fn close(&self) {
        info!("Closing dispatcher");
        self.scheduler.shutdown().await;
        self.registry.close().await;
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        1.0
    } else {
        part as f64 / whole as f64
    }
}
