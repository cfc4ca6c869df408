//! Per-agent rolling statistics and health.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Health derived from consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unavailable,
}

/// Consecutive-failure counter with two thresholds.
#[derive(Debug, Clone, Copy)]
pub struct HealthCounter {
    pub consecutive_failures: u32,
    pub degraded_threshold: u32,
    pub unavailable_threshold: u32,
}

impl HealthCounter {
    pub const fn new(degraded_threshold: u32, unavailable_threshold: u32) -> Self {
        Self {
            consecutive_failures: 0,
            degraded_threshold,
            unavailable_threshold,
        }
    }

    pub const fn level(&self) -> HealthLevel {
        if self.consecutive_failures >= self.unavailable_threshold {
            HealthLevel::Unavailable
        } else if self.consecutive_failures >= self.degraded_threshold {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }

    pub const fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub const fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Statistics for one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    /// Finished attempts, successful or not.
    pub total_tasks: u64,
    pub successes: u64,
    pub failures: u64,
    /// Attempts executing right now.
    pub active_tasks: u32,
    /// Running mean over every finished attempt.
    pub average_latency_ms: f64,
    pub consecutive_failures: u32,
    pub health: HealthLevel,
    pub last_activity: Option<DateTime<Utc>>,
}

impl AgentStatus {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            total_tasks: 0,
            successes: 0,
            failures: 0,
            active_tasks: 0,
            average_latency_ms: 0.0,
            consecutive_failures: 0,
            health: HealthLevel::Healthy,
            last_activity: None,
        }
    }

    pub const fn is_busy(&self) -> bool {
        self.active_tasks > 0
    }

    #[allow(clippy::cast_precision_loss)]
    fn finish(&mut self, latency: Duration) {
        self.active_tasks = self.active_tasks.saturating_sub(1);
        self.total_tasks += 1;
        let sample = latency.as_secs_f64() * 1_000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.total_tasks as f64;
        self.last_activity = Some(Utc::now());
    }
}

struct Entry {
    status: AgentStatus,
    health: HealthCounter,
}

/// Statistics for every agent the scheduler has seen.
pub struct AgentStatusTable {
    entries: Mutex<HashMap<String, Entry>>,
    degraded_threshold: u32,
    unavailable_threshold: u32,
}

impl AgentStatusTable {
    pub fn new(degraded_threshold: u32, unavailable_threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            degraded_threshold,
            unavailable_threshold: unavailable_threshold.max(degraded_threshold),
        }
    }

    /// Make sure an agent has a (possibly empty) entry.
    pub fn ensure(&self, agent_id: &str) {
        self.with_entry(agent_id, |_| {});
    }

    pub fn record_start(&self, agent_id: &str) {
        self.with_entry(agent_id, |entry| {
            entry.status.active_tasks += 1;
            entry.status.last_activity = Some(Utc::now());
        });
    }

    pub fn record_success(&self, agent_id: &str, latency: Duration) {
        self.with_entry(agent_id, |entry| {
            entry.status.finish(latency);
            entry.status.successes += 1;
            entry.health.record_success();
        });
    }

    pub fn record_failure(&self, agent_id: &str, latency: Duration) {
        self.with_entry(agent_id, |entry| {
            entry.status.finish(latency);
            entry.status.failures += 1;
            entry.health.record_failure();
        });
    }

    /// Drop a running attempt that never finished (aborted at shutdown).
    pub fn record_abandoned(&self, agent_id: &str) {
        self.with_entry(agent_id, |entry| {
            entry.status.active_tasks = entry.status.active_tasks.saturating_sub(1);
        });
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentStatus> {
        self.lock().get(agent_id).map(snapshot)
    }

    /// All agents, ordered by id.
    pub fn list(&self) -> Vec<AgentStatus> {
        let mut all: Vec<AgentStatus> = self.lock().values().map(snapshot).collect();
        all.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        all
    }

    fn with_entry(&self, agent_id: &str, f: impl FnOnce(&mut Entry)) {
        let mut entries = self.lock();
        let entry = entries.entry(agent_id.to_string()).or_insert_with(|| Entry {
            status: AgentStatus::new(agent_id),
            health: HealthCounter::new(self.degraded_threshold, self.unavailable_threshold),
        });
        f(entry);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot(entry: &Entry) -> AgentStatus {
    let mut status = entry.status.clone();
    status.consecutive_failures = entry.health.consecutive_failures;
    status.health = entry.health.level();
    status
}
