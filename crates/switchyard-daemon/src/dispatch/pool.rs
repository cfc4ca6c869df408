//! Semaphore-based execution pool.
//!
//! The [`ExecutionPool`] caps how many tasks execute at once. Permits come
//! from a Tokio semaphore; every running task is tracked with its abort
//! handle so the scheduler can report or cancel it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Fallback when a zero limit is configured.
const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// A permit granting the right to execute one task.
///
/// When dropped, the permit is returned to the pool.
pub struct PoolPermit {
    _permit: OwnedSemaphorePermit,
}

/// A task occupying an execution slot.
struct PoolEntry {
    task_id: String,
    agent_id: String,
    started_at: Instant,
    abort: AbortHandle,
}

/// Snapshot of one executing task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningTask {
    pub task_id: String,
    pub agent_id: String,
    pub running_ms: u64,
}

/// Concurrency pool for task execution.
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    entries: Arc<RwLock<HashMap<String, PoolEntry>>>,
}

impl ExecutionPool {
    pub fn new(max_concurrency: usize) -> Self {
        let limit = if max_concurrency == 0 {
            DEFAULT_MAX_CONCURRENCY
        } else {
            max_concurrency
        };

        info!(max_concurrency = limit, "ExecutionPool created");

        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            max_concurrency: limit,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolPermit> {
        let permit = Arc::clone(&self.semaphore).try_acquire_owned().ok()?;
        Some(PoolPermit { _permit: permit })
    }

    /// Run `work` in the slot held by `permit`.
    ///
    /// The permit is released when `work` finishes or is aborted. The entry
    /// is inserted before `work` can observe it, so [`Self::release`] called
    /// from inside `work` always finds it.
    pub async fn spawn<F>(&self, task_id: &str, agent_id: &str, permit: PoolPermit, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut entries = self.entries.write().await;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            work.await;
        });
        debug!(task_id, agent_id, "Task occupies execution slot");
        entries.insert(
            task_id.to_string(),
            PoolEntry {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                started_at: Instant::now(),
                abort: handle.abort_handle(),
            },
        );
    }

    /// Forget a finished task.
    pub async fn release(&self, task_id: &str) -> bool {
        self.entries.write().await.remove(task_id).is_some()
    }

    /// Abort every running task and return their ids.
    pub async fn abort_all(&self) -> Vec<String> {
        let drained: Vec<PoolEntry> = self.entries.write().await.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.abort.abort();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "Aborted running tasks");
        }
        drained.into_iter().map(|e| e.task_id).collect()
    }

    /// Executing tasks, longest running first.
    pub async fn running(&self) -> Vec<RunningTask> {
        let mut running: Vec<RunningTask> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| RunningTask {
                task_id: entry.task_id.clone(),
                agent_id: entry.agent_id.clone(),
                running_ms: u64::try_from(entry.started_at.elapsed().as_millis())
                    .unwrap_or(u64::MAX),
            })
            .collect();
        running.sort_by(|a, b| b.running_ms.cmp(&a.running_ms));
        running
    }

    pub const fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Number of free slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

impl Default for ExecutionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn zero_uses_default() {
        let pool = ExecutionPool::new(0);
        assert_eq!(pool.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
    }

    #[tokio::test]
    async fn permits_are_bounded() {
        let pool = ExecutionPool::new(2);
        let p1 = pool.try_acquire().unwrap();
        let _p2 = pool.try_acquire().unwrap();
        assert!(pool.try_acquire().is_none());
        drop(p1);
        assert!(pool.try_acquire().is_some());
    }

    #[tokio::test]
    async fn finished_work_returns_its_permit() {
        let pool = Arc::new(ExecutionPool::new(1));
        let permit = pool.try_acquire().unwrap();
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&pool);
        pool.spawn("t1", "a", permit, async move {
            assert!(inner.release("t1").await);
            let _ = tx.send(());
        })
        .await;
        rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.available_permits(), 1);
        assert!(pool.running().await.is_empty());
    }

    #[tokio::test]
    async fn abort_all_cancels_running_work() {
        let pool = ExecutionPool::new(2);
        for id in ["t1", "t2"] {
            let permit = pool.try_acquire().unwrap();
            pool.spawn(id, "a", permit, async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        }
        assert_eq!(pool.available_permits(), 0);
        let running = pool.running().await;
        assert_eq!(running.len(), 2);
        assert!(running.iter().all(|r| r.agent_id == "a"));

        let mut aborted = pool.abort_all().await;
        aborted.sort();
        assert_eq!(aborted, vec!["t1", "t2"]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.available_permits(), 2);
    }
}
