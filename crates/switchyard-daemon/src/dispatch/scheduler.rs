//! Priority task scheduler.
//!
//! [`TaskScheduler`] accepts tasks, queues them by priority and admits them
//! into the [`ExecutionPool`] from a single dispatch loop. Each admitted task
//! runs under an outer timeout and goes through the [`ProcessRegistry`];
//! retryable failures re-enter the queue with one less priority point until
//! the retry budget is spent.
//!
//! Every submission gets its own completion channel, resolved exactly once
//! when the task reaches a terminal state.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use switchyard_core::config::SchedulerConfig;
use switchyard_core::protocol::{METHOD_ANALYZE, METHOD_MESSAGE};
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::{ExecutionPool, RunningTask};
use super::status::{AgentStatus, AgentStatusTable};
use super::task::{NewTask, Task, TaskKind, TaskRecord, TaskReport, TaskStatus};
use crate::error::DispatchError;
use crate::registry::ProcessRegistry;

/// Queue slot. Higher priority first, then submission order.
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: u32,
    seq: u64,
    task_id: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Queued>,
    /// Pending and executing tasks.
    tasks: HashMap<String, Task>,
    waiters: HashMap<String, oneshot::Sender<TaskReport>>,
    /// Terminal tasks, newest first.
    history: VecDeque<TaskRecord>,
}

struct Inner {
    registry: Arc<ProcessRegistry>,
    config: SchedulerConfig,
    pool: ExecutionPool,
    statuses: AgentStatusTable,
    state: Mutex<SchedulerState>,
    wake: Notify,
    dispatching: AtomicBool,
    next_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Handle to a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    agent_id: String,
    kind: TaskKind,
    rx: oneshot::Receiver<TaskReport>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the terminal report.
    ///
    /// If the scheduler goes away without reporting, the task is reported as
    /// a [`DispatchError::Shutdown`] failure.
    pub async fn wait(self) -> TaskReport {
        match self.rx.await {
            Ok(report) => report,
            Err(_) => TaskReport {
                task_id: self.task_id,
                agent_id: self.agent_id,
                kind: self.kind,
                status: TaskStatus::Failed,
                retry_count: 0,
                elapsed: Duration::ZERO,
                outcome: Err(DispatchError::Shutdown),
            },
        }
    }
}

/// Priority scheduler dispatching tasks to registered workers.
pub struct TaskScheduler {
    inner: Arc<Inner>,
    dispatch_loop: Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    pub fn new(registry: Arc<ProcessRegistry>, config: SchedulerConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let statuses = AgentStatusTable::new(
            config.degraded_failure_threshold,
            config.unavailable_failure_threshold,
        );
        Self {
            inner: Arc::new(Inner {
                registry,
                pool: ExecutionPool::new(config.max_concurrent),
                statuses,
                config,
                state: Mutex::new(SchedulerState::default()),
                wake: Notify::new(),
                dispatching: AtomicBool::new(false),
                next_seq: AtomicU64::new(0),
                shutdown,
            }),
            dispatch_loop: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut slot = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || *self.inner.shutdown.borrow() {
            return;
        }
        info!(
            max_concurrent = self.inner.pool.max_concurrency(),
            poll_interval_ms = self.inner.config.poll_interval_ms,
            "Starting dispatch loop"
        );
        *slot = Some(tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        )));
    }

    /// Queue a task.
    ///
    /// Permanent problems (invalid payload, unknown agent, undeclared tool)
    /// fail the task right here without queueing it.
    pub async fn submit(&self, new: NewTask) -> TaskHandle {
        let inner = &self.inner;
        let task_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle {
            task_id: task_id.clone(),
            agent_id: new.agent_id.clone(),
            kind: new.kind,
            rx,
        };

        let precheck = self.precheck(&new).await;
        let mut task = Task::from_new(task_id, new, &inner.config);

        if let Err(err) = precheck {
            warn!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                kind = %task.kind,
                error = %err,
                "Task rejected"
            );
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            task.last_error = Some(err.to_string());
            let mut state = inner.lock_state();
            push_history(&mut state, &task, inner.config.history_limit);
            drop(state);
            let _ = tx.send(TaskReport::from_task(&task, Err(err)));
            return handle;
        }

        debug!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            kind = %task.kind,
            priority = task.priority,
            "Task submitted"
        );
        let seq = inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let mut state = inner.lock_state();
        if *inner.shutdown.borrow() {
            // Shutdown won the race.
            fail_shutdown(&mut task);
            push_history(&mut state, &task, inner.config.history_limit);
            drop(state);
            let _ = tx.send(TaskReport::from_task(&task, Err(DispatchError::Shutdown)));
            return handle;
        }
        state.queue.push(Queued {
            priority: task.priority,
            seq,
            task_id: task.id.clone(),
        });
        state.waiters.insert(task.id.clone(), tx);
        state.tasks.insert(task.id.clone(), task);
        drop(state);

        inner.wake.notify_one();
        handle
    }

    async fn precheck(&self, new: &NewTask) -> Result<(), DispatchError> {
        if *self.inner.shutdown.borrow() {
            return Err(DispatchError::Shutdown);
        }
        new.validate()?;
        let registry = &self.inner.registry;
        if !registry.contains(&new.agent_id).await {
            return Err(DispatchError::UnknownAgent {
                agent_id: new.agent_id.clone(),
            });
        }
        if new.kind == TaskKind::ToolCall
            && let Some(tool) = new.tool_name()
        {
            registry.ensure_tool(&new.agent_id, tool).await?;
        }
        Ok(())
    }

    /// Tasks waiting for a slot.
    pub fn queue_depth(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Tasks currently executing.
    pub fn active_count(&self) -> usize {
        self.inner
            .lock_state()
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Executing)
            .count()
    }

    /// Executing tasks with how long they have been running.
    pub async fn running(&self) -> Vec<RunningTask> {
        self.inner.pool.running().await
    }

    /// Execution slots not currently taken.
    pub fn free_slots(&self) -> usize {
        self.inner.pool.available_permits()
    }

    /// Terminal tasks, newest first.
    pub fn history(&self, limit: usize) -> Vec<TaskRecord> {
        self.inner
            .lock_state()
            .history
            .iter()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn agent_status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.inner.statuses.get(agent_id)
    }

    pub fn agent_statuses(&self) -> Vec<AgentStatus> {
        self.inner.statuses.list()
    }

    pub(crate) fn statuses(&self) -> &AgentStatusTable {
        &self.inner.statuses
    }

    /// Stop the loop and fail every unfinished task, running or queued.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        let handle = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }

        let aborted = inner.pool.abort_all().await.len();

        let mut state = inner.lock_state();
        let queued = state.queue.len();
        state.queue.clear();
        let mut unfinished: Vec<Task> = state.tasks.drain().map(|(_, task)| task).collect();
        unfinished.sort_by_key(|task| task.created_at);
        let mut reports = Vec::with_capacity(unfinished.len());
        for mut task in unfinished {
            if task.status == TaskStatus::Executing {
                inner.statuses.record_abandoned(&task.agent_id);
            }
            fail_shutdown(&mut task);
            push_history(&mut state, &task, inner.config.history_limit);
            if let Some(tx) = state.waiters.remove(&task.id) {
                reports.push((tx, TaskReport::from_task(&task, Err(DispatchError::Shutdown))));
            }
        }
        state.waiters.clear();
        drop(state);
        for (tx, report) in reports {
            let _ = tx.send(report);
        }

        info!(aborted, queued, "Scheduler shut down");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self
            .dispatch_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pop the highest-priority pending task and mark it executing.
    fn admit_next(&self) -> Option<Task> {
        let mut state = self.lock_state();
        while let Some(slot) = state.queue.pop() {
            let Some(task) = state.tasks.get_mut(&slot.task_id) else {
                continue;
            };
            task.status = TaskStatus::Executing;
            task.started_at = Some(Utc::now());
            return Some(task.clone());
        }
        None
    }

    /// Move a task to its next state after an attempt.
    fn finish(&self, task_id: &str, result: Result<Value, DispatchError>, latency: Duration) {
        let mut state = self.lock_state();
        let Some(mut task) = state.tasks.remove(task_id) else {
            // Already failed by shutdown.
            return;
        };

        let outcome = match result {
            Ok(value) => {
                self.statuses.record_success(&task.agent_id, latency);
                task.status = TaskStatus::Completed;
                task.completed_at = Some(Utc::now());
                info!(
                    task_id = %task.id,
                    agent_id = %task.agent_id,
                    latency_ms = duration_ms(latency),
                    retries = task.retry_count,
                    "Task completed"
                );
                Ok(value)
            }
            Err(err) if err.is_retryable() && task.retry_count < task.max_retries => {
                self.statuses.record_failure(&task.agent_id, latency);
                task.reset_for_retry();
                warn!(
                    task_id = %task.id,
                    agent_id = %task.agent_id,
                    error = %err,
                    attempt = task.retry_count,
                    max_retries = task.max_retries,
                    priority = task.priority,
                    "Task failed, retrying"
                );
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                state.queue.push(Queued {
                    priority: task.priority,
                    seq,
                    task_id: task.id.clone(),
                });
                state.tasks.insert(task.id.clone(), task);
                return;
            }
            Err(err) => {
                self.statuses.record_failure(&task.agent_id, latency);
                let err = if err.is_retryable() {
                    DispatchError::RetryExhausted {
                        task_id: task.id.clone(),
                        attempts: task.retry_count + 1,
                        last: Box::new(err),
                    }
                } else {
                    err
                };
                task.status = if err.is_timeout() {
                    TaskStatus::TimedOut
                } else {
                    TaskStatus::Failed
                };
                task.completed_at = Some(Utc::now());
                task.last_error = Some(err.to_string());
                warn!(
                    task_id = %task.id,
                    agent_id = %task.agent_id,
                    error = %err,
                    retries = task.retry_count,
                    "Task failed"
                );
                Err(err)
            }
        };

        push_history(&mut state, &task, self.config.history_limit);
        let waiter = state.waiters.remove(&task.id);
        drop(state);
        if let Some(tx) = waiter {
            let _ = tx.send(TaskReport::from_task(&task, outcome));
        }
    }
}

fn fail_shutdown(task: &mut Task) {
    task.status = TaskStatus::Failed;
    task.completed_at = Some(Utc::now());
    task.last_error = Some(DispatchError::Shutdown.to_string());
}

fn push_history(state: &mut SchedulerState, task: &Task, limit: usize) {
    state.history.push_front(task.record());
    state.history.truncate(limit);
}

async fn run_loop(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = inner.wake.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        dispatch(&inner).await;
    }
    debug!("Dispatch loop stopped");
}

/// Clears the re-entrancy flag when an admission pass ends or is dropped.
struct DispatchPass<'a>(&'a AtomicBool);

impl Drop for DispatchPass<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Admit queued tasks while slots are free.
async fn dispatch(inner: &Arc<Inner>) {
    if inner.dispatching.swap(true, Ordering::SeqCst) {
        return;
    }
    let _pass = DispatchPass(&inner.dispatching);
    while !*inner.shutdown.borrow() {
        let Some(permit) = inner.pool.try_acquire() else {
            break;
        };
        let Some(task) = inner.admit_next() else {
            break;
        };
        inner.statuses.record_start(&task.agent_id);
        debug!(
            task_id = %task.id,
            agent_id = %task.agent_id,
            priority = task.priority,
            attempt = task.retry_count,
            "Task admitted"
        );
        let worker = Arc::clone(inner);
        let task_id = task.id.clone();
        let agent_id = task.agent_id.clone();
        inner
            .pool
            .spawn(&task_id, &agent_id, permit, execute(worker, task))
            .await;
    }
}

async fn execute(inner: Arc<Inner>, task: Task) {
    let started = Instant::now();
    let window = inner.config.task_timeout();
    let result = match tokio::time::timeout(window, run_task(&inner.registry, &task)).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Timeout {
            agent_id: task.agent_id.clone(),
            after: window,
        }),
    };
    inner.pool.release(&task.id).await;
    inner.finish(&task.id, result, started.elapsed());
    inner.wake.notify_one();
}

/// Shape the task into a worker request and await the answer.
async fn run_task(registry: &ProcessRegistry, task: &Task) -> Result<Value, DispatchError> {
    match task.kind {
        TaskKind::Message => {
            let params = json!({ "message": task.payload, "context": task.context });
            registry.send_message(&task.agent_id, params).await
        }
        TaskKind::ToolCall => {
            let tool = task
                .payload
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| DispatchError::InvalidTask {
                    reason: "tool call requires a tool name".to_string(),
                })?;
            let arguments = task.payload.get("arguments").cloned().unwrap_or(Value::Null);
            registry.execute_tool(&task.agent_id, tool, arguments).await
        }
        TaskKind::Analysis => {
            let mut params = task.payload.clone();
            if let Some(map) = params.as_object_mut() {
                map.insert("context".to_string(), task.context.clone());
            }
            registry.request(&task.agent_id, METHOD_ANALYZE, params).await
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use switchyard_core::config::RegistryConfig;
    use switchyard_core::protocol::{ErrorObject, METHOD_INITIALIZE, Message, Request};

    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::{LaunchSpec, MemoryLauncher, Reply};

    fn scheduler_config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent,
            poll_interval_ms: 10,
            task_timeout_ms: 2_000,
            ..SchedulerConfig::default()
        }
    }

    async fn setup(
        launcher: &MemoryLauncher,
        config: SchedulerConfig,
    ) -> TaskScheduler {
        let registry = Arc::new(ProcessRegistry::new(
            Arc::new(launcher.clone()),
            RegistryConfig {
                request_timeout_ms: 1_000,
                handshake_timeout_ms: 500,
                ..RegistryConfig::default()
            },
        ));
        registry
            .register("w", LaunchSpec::new("memory").with_tools(["search"]))
            .await
            .unwrap();
        let scheduler = TaskScheduler::new(registry, config);
        scheduler.start();
        scheduler
    }

    fn handshake_then(f: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> MemoryLauncher {
        MemoryLauncher::new(move |_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({}))
            } else {
                f(req)
            }
        })
    }

    fn requests(launcher: &MemoryLauncher, method: &str) -> Vec<Value> {
        launcher
            .received("w")
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(r) if r.method == method => Some(r.params),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn message_round_trip() {
        let launcher = MemoryLauncher::echo();
        let scheduler = setup(&launcher, scheduler_config(2)).await;
        let report = scheduler
            .submit(NewTask::message("w", "ping", json!({"user": "u1"})))
            .await
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(
            report.outcome.unwrap(),
            json!({"message": "ping", "context": {"user": "u1"}})
        );
        assert_eq!(report.retry_count, 0);

        let history = scheduler.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, TaskStatus::Completed);
        assert!(history[0].started_at.is_some());
        let status = scheduler.agent_status("w").unwrap();
        assert_eq!(status.successes, 1);
        assert_eq!(status.active_tasks, 0);
    }

    #[tokio::test]
    async fn higher_priority_is_admitted_first() {
        let launcher = handshake_then(|r| {
            if r.params["message"] == json!("blocker") {
                Reply::Ok(json!({})).after(Duration::from_millis(150))
            } else {
                Reply::Ok(json!({}))
            }
        });
        let scheduler = setup(&launcher, scheduler_config(1)).await;

        let blocker = scheduler.submit(NewTask::message("w", "blocker", Value::Null)).await;
        while scheduler.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let low = scheduler
            .submit(NewTask::message("w", "low", Value::Null).with_priority(1))
            .await;
        let high = scheduler
            .submit(NewTask::message("w", "high", Value::Null).with_priority(9))
            .await;
        assert_eq!(scheduler.queue_depth(), 2);

        assert!(blocker.wait().await.is_success());
        assert!(low.wait().await.is_success());
        assert!(high.wait().await.is_success());

        let order: Vec<Value> = requests(&launcher, METHOD_MESSAGE)
            .into_iter()
            .map(|p| p["message"].clone())
            .collect();
        assert_eq!(order, vec![json!("blocker"), json!("high"), json!("low")]);
    }

    #[tokio::test]
    async fn concurrency_cap_holds() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let launcher = handshake_then(|_| Reply::Ok(json!("done")).after(Duration::from_millis(40)));
        let scheduler = setup(&launcher, scheduler_config(3)).await;

        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(
                scheduler
                    .submit(NewTask::message("w", &format!("m{i}"), Value::Null))
                    .await,
            );
        }

        let sampler = {
            let in_flight = Arc::clone(&in_flight);
            let inner = Arc::clone(&scheduler.inner);
            tokio::spawn(async move {
                loop {
                    let active = inner
                        .lock_state()
                        .tasks
                        .values()
                        .filter(|t| t.status == TaskStatus::Executing)
                        .count();
                    in_flight.fetch_max(active, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            })
        };

        for handle in handles {
            assert_eq!(handle.wait().await.status, TaskStatus::Completed);
        }
        sampler.abort();

        let peak = in_flight.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak} exceeded the cap");
        assert!(peak >= 2, "tasks never overlapped (peak {peak})");
        assert_eq!(scheduler.queue_depth(), 0);
        assert_eq!(scheduler.agent_status("w").unwrap().successes, 10);
    }

    #[tokio::test]
    async fn retryable_failures_exhaust_budget_with_decay() {
        let launcher = handshake_then(|_| Reply::Err(ErrorObject::new(-32000, "flaky")));
        let scheduler = setup(&launcher, scheduler_config(2)).await;

        let report = scheduler
            .submit(NewTask::message("w", "hi", Value::Null))
            .await
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.retry_count, 2);
        let err = report.outcome.unwrap_err();
        assert!(matches!(err, DispatchError::RetryExhausted { attempts: 3, .. }));
        assert_eq!(err.root_kind(), ErrorKind::Remote);

        assert_eq!(requests(&launcher, METHOD_MESSAGE).len(), 3);
        let record = &scheduler.history(1)[0];
        assert_eq!(record.priority, 3);
        assert_eq!(record.retry_count, 2);
        assert_eq!(scheduler.agent_status("w").unwrap().failures, 3);
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let launcher = handshake_then(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Reply::Err(ErrorObject::new(-1, "warming up"))
            } else {
                Reply::Ok(json!("ok"))
            }
        });
        let scheduler = setup(&launcher, scheduler_config(1)).await;
        let report = scheduler
            .submit(NewTask::message("w", "hi", Value::Null))
            .await
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Completed);
        assert_eq!(report.retry_count, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn outer_timeout_marks_timed_out() {
        let launcher = handshake_then(|_| Reply::Silent);
        let config = SchedulerConfig {
            task_timeout_ms: 150,
            ..scheduler_config(1)
        };
        let scheduler = setup(&launcher, config).await;
        let started = Instant::now();
        let report = scheduler
            .submit(NewTask::message("w", "hi", Value::Null).with_max_retries(0))
            .await
            .wait()
            .await;
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert_eq!(report.status, TaskStatus::TimedOut);
        assert!(report.outcome.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn unknown_agent_fails_immediately() {
        let launcher = MemoryLauncher::echo();
        let scheduler = setup(&launcher, scheduler_config(1)).await;
        let report = scheduler
            .submit(NewTask::message("ghost", "hi", Value::Null))
            .await
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.retry_count, 0);
        assert!(matches!(
            report.outcome,
            Err(DispatchError::UnknownAgent { .. })
        ));
        assert_eq!(scheduler.queue_depth(), 0);
        assert_eq!(scheduler.history(5).len(), 1);
    }

    #[tokio::test]
    async fn undeclared_tool_fails_without_retry() {
        let launcher = MemoryLauncher::echo();
        let scheduler = setup(&launcher, scheduler_config(1)).await;
        let report = scheduler
            .submit(NewTask::tool_call("w", "rm_rf", json!({})))
            .await
            .wait()
            .await;
        assert_eq!(report.retry_count, 0);
        assert!(matches!(report.outcome, Err(DispatchError::Capability { .. })));
        assert!(requests(&launcher, "tools/call").is_empty());

        let report = scheduler
            .submit(NewTask::tool_call("w", "search", json!({"q": "x"})))
            .await
            .wait()
            .await;
        assert_eq!(
            report.outcome.unwrap(),
            json!({"name": "search", "arguments": {"q": "x"}})
        );
    }

    #[tokio::test]
    async fn analysis_carries_kind_and_context() {
        let launcher = MemoryLauncher::echo();
        let scheduler = setup(&launcher, scheduler_config(1)).await;
        let report = scheduler
            .submit(NewTask::analysis("w", json!([1, 2, 3]), "trend", json!({"k": 1})))
            .await
            .wait()
            .await;
        assert_eq!(
            report.outcome.unwrap(),
            json!({"data": [1, 2, 3], "kind": "trend", "context": {"k": 1}})
        );
    }

    #[tokio::test]
    async fn crash_fails_pending_tasks_through_retry_path() {
        let launcher = handshake_then(|_| Reply::Silent);
        let scheduler = setup(&launcher, scheduler_config(4)).await;

        let handles = vec![
            scheduler.submit(NewTask::message("w", "a", Value::Null)).await,
            scheduler.submit(NewTask::message("w", "b", Value::Null)).await,
        ];
        while scheduler.active_count() < 2 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        launcher.exit("w", Some(1)).await;

        for handle in handles {
            let report = handle.wait().await;
            assert_eq!(report.status, TaskStatus::Failed);
            assert_eq!(report.retry_count, 2);
            assert_eq!(report.outcome.unwrap_err().root_kind(), ErrorKind::Process);
        }
    }

    #[tokio::test]
    async fn shutdown_fails_active_and_queued_tasks() {
        let launcher = handshake_then(|_| Reply::Silent);
        let scheduler = setup(&launcher, scheduler_config(1)).await;

        let active = scheduler.submit(NewTask::message("w", "a", Value::Null)).await;
        while scheduler.active_count() == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let queued = scheduler.submit(NewTask::message("w", "b", Value::Null)).await;
        let queued_id = queued.task_id().to_string();
        assert_eq!(scheduler.queue_depth(), 1);
        assert_eq!(scheduler.free_slots(), 0);
        let running = scheduler.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].task_id, active.task_id());
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.shutdown().await;
        let report = active.wait().await;
        assert!(matches!(report.outcome, Err(DispatchError::Shutdown)));
        assert_eq!(report.status, TaskStatus::Failed);
        let report = queued.wait().await;
        assert!(matches!(report.outcome, Err(DispatchError::Shutdown)));
        assert_eq!(report.status, TaskStatus::Failed);
        assert!(report.elapsed >= Duration::from_millis(20));

        assert_eq!(scheduler.queue_depth(), 0);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.agent_status("w").unwrap().active_tasks, 0);
        let history = scheduler.history(5);
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|r| r.id == queued_id));
        assert!(
            history
                .iter()
                .all(|r| r.error.as_deref() == Some("service shutdown")
                    && r.status == TaskStatus::Failed)
        );

        let late = scheduler
            .submit(NewTask::message("w", "c", Value::Null))
            .await
            .wait()
            .await;
        assert!(matches!(late.outcome, Err(DispatchError::Shutdown)));
    }

    #[tokio::test]
    async fn task_timeout_leaves_no_pending_requests() {
        let launcher = handshake_then(|_| Reply::Silent);
        let config = SchedulerConfig {
            task_timeout_ms: 150,
            ..scheduler_config(3)
        };
        // The registry waits up to 1s per request, well past the task timeout.
        let scheduler = setup(&launcher, config).await;

        let mut handles = Vec::new();
        for i in 0..3 {
            handles.push(
                scheduler
                    .submit(NewTask::message("w", &format!("m{i}"), Value::Null).with_max_retries(0))
                    .await,
            );
        }
        for handle in handles {
            assert_eq!(handle.wait().await.status, TaskStatus::TimedOut);
        }

        let registry = &scheduler.inner.registry;
        assert!(registry.pending("w").await.unwrap().is_empty());
        assert_eq!(registry.status("w").await.unwrap().pending_requests, 0);
        assert_eq!(requests(&launcher, METHOD_MESSAGE).len(), 3);
    }

    #[tokio::test]
    async fn dropped_dispatch_pass_does_not_wedge_admission() {
        let launcher = MemoryLauncher::echo();
        let scheduler = setup(&launcher, scheduler_config(1)).await;

        // Simulate a pass cancelled while it held the flag.
        let flag = &scheduler.inner.dispatching;
        assert!(!flag.swap(true, Ordering::SeqCst));
        drop(DispatchPass(flag));
        assert!(!flag.load(Ordering::SeqCst));

        let report = scheduler
            .submit(NewTask::message("w", "after", Value::Null))
            .await
            .wait()
            .await;
        assert_eq!(report.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn history_is_bounded_and_newest_first() {
        let launcher = MemoryLauncher::echo();
        let config = SchedulerConfig {
            history_limit: 3,
            ..scheduler_config(1)
        };
        let scheduler = setup(&launcher, config).await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let handle = scheduler
                .submit(NewTask::message("w", &format!("m{i}"), Value::Null))
                .await;
            ids.push(handle.task_id().to_string());
            handle.wait().await;
        }
        let history = scheduler.history(10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].id, ids[4]);
        assert_eq!(history[2].id, ids[2]);
        assert_eq!(scheduler.history(1).len(), 1);
    }

    #[test]
    fn queue_orders_by_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        for (priority, seq) in [(5, 0), (9, 1), (5, 2), (1, 3), (9, 4)] {
            heap.push(Queued {
                priority,
                seq,
                task_id: format!("{priority}-{seq}"),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| heap.pop().map(|q| q.task_id)).collect();
        assert_eq!(order, vec!["9-1", "9-4", "5-0", "5-2", "1-3"]);
    }
}
