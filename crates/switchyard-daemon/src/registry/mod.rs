//! Worker process registry.
//!
//! [`ProcessRegistry`] owns every registered worker:
//! - launches it through a [`Launcher`] and runs the `initialize` handshake
//! - decodes its output and routes responses to the [`PendingTable`]
//! - publishes notifications and lifecycle changes as [`RegistryEvent`]s
//! - fails outstanding requests when the worker exits
//! - stops workers (shutdown notification, SIGTERM, then SIGKILL after grace)

pub mod pending;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use switchyard_core::config::RegistryConfig;
use switchyard_core::protocol::{
    self, FrameDecoder, METHOD_INITIALIZE, METHOD_MESSAGE, METHOD_SHUTDOWN, METHOD_TOOL_CALL,
    Message, Notification, PROTOCOL_VERSION, Request, Response,
};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::transport::{ExitInfo, LaunchSpec, Launcher, Transport, TransportEvent};

pub use pending::{PendingInfo, PendingTable};

/// Broadcast channel buffer size for registry events.
const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Lifecycle state of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// Launched, handshake not yet complete.
    Starting,
    /// Handshake done; accepts requests.
    Ready,
    /// Handshake failed.
    Error,
    /// Exited or stopped.
    Stopped,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Something observable happened to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    StateChanged {
        agent_id: String,
        state: ProcessState,
    },
    Notification {
        agent_id: String,
        method: String,
        params: Value,
    },
    Exited {
        agent_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub agent_id: String,
    pub instance_id: String,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub tools: Vec<String>,
    pub pending_requests: usize,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub exit: Option<ExitInfo>,
    pub last_error: Option<String>,
    pub server_info: Option<Value>,
}

struct Lifecycle {
    state: ProcessState,
    tools: Vec<String>,
    last_activity: DateTime<Utc>,
    exit: Option<ExitInfo>,
    last_error: Option<String>,
    server_info: Option<Value>,
}

struct ProcessInstance {
    agent_id: String,
    instance_id: Uuid,
    transport: Arc<dyn Transport>,
    pending: PendingTable,
    started_at: DateTime<Utc>,
    lifecycle: Mutex<Lifecycle>,
}

impl ProcessInstance {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ProcessState {
        self.lifecycle().state
    }

    fn touch(&self) {
        self.lifecycle().last_activity = Utc::now();
    }

    fn has_tool(&self, tool: &str) -> bool {
        self.lifecycle().tools.iter().any(|t| t == tool)
    }

    fn status(&self) -> ServerStatus {
        let pending_requests = self.pending.len();
        let life = self.lifecycle();
        ServerStatus {
            agent_id: self.agent_id.clone(),
            instance_id: self.instance_id.to_string(),
            state: life.state,
            pid: self.transport.pid(),
            tools: life.tools.clone(),
            pending_requests,
            started_at: self.started_at,
            last_activity: life.last_activity,
            exit: life.exit,
            last_error: life.last_error.clone(),
            server_info: life.server_info.clone(),
        }
    }
}

/// Registry of worker processes keyed by agent id.
pub struct ProcessRegistry {
    launcher: Arc<dyn Launcher>,
    config: RegistryConfig,
    processes: RwLock<HashMap<String, Arc<ProcessInstance>>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ProcessRegistry {
    pub fn new(launcher: Arc<dyn Launcher>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            launcher,
            config,
            processes: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Subscribe to notifications and lifecycle events of all workers.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Launch a worker and complete its handshake.
    ///
    /// An agent whose previous instance is `stopped` or `error` is replaced.
    #[allow(clippy::significant_drop_tightening)]
    pub async fn register(
        &self,
        agent_id: &str,
        spec: LaunchSpec,
    ) -> Result<ServerStatus, DispatchError> {
        if agent_id.trim().is_empty() {
            return Err(DispatchError::InvalidTask {
                reason: "agent id must not be empty".to_string(),
            });
        }

        let instance = {
            let mut processes = self.processes.write().await;
            if let Some(existing) = processes.get(agent_id) {
                match existing.state() {
                    ProcessState::Starting | ProcessState::Ready => {
                        return Err(DispatchError::AlreadyRegistered {
                            agent_id: agent_id.to_string(),
                        });
                    }
                    stale => {
                        info!(agent_id, state = %stale, "Replacing stale worker registration");
                    }
                }
            }

            let connection = self
                .launcher
                .launch(agent_id, &spec)
                .await
                .map_err(|e| DispatchError::from_transport(agent_id, &e))?;

            let now = Utc::now();
            let instance = Arc::new(ProcessInstance {
                agent_id: agent_id.to_string(),
                instance_id: Uuid::new_v4(),
                transport: connection.transport,
                pending: PendingTable::new(agent_id),
                started_at: now,
                lifecycle: Mutex::new(Lifecycle {
                    state: ProcessState::Starting,
                    tools: spec.declared_tools.clone(),
                    last_activity: now,
                    exit: None,
                    last_error: None,
                    server_info: None,
                }),
            });
            processes.insert(agent_id.to_string(), Arc::clone(&instance));

            tokio::spawn(run_reader(
                Arc::clone(&instance),
                connection.events,
                self.events.clone(),
                self.config.max_frame_bytes,
            ));
            instance
        };
        self.publish_state(&instance, ProcessState::Starting);

        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "switchyard",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "declaredTools": spec.declared_tools,
        });
        match call(
            &instance,
            METHOD_INITIALIZE,
            params,
            self.config.handshake_timeout(),
            true,
        )
        .await
        {
            Ok(result) => {
                {
                    let mut life = instance.lifecycle();
                    merge_tools(&mut life.tools, &result);
                    life.server_info = result.get("serverInfo").cloned();
                    if life.state == ProcessState::Starting {
                        life.state = ProcessState::Ready;
                    }
                }
                if instance.state() != ProcessState::Ready {
                    return Err(DispatchError::process(agent_id, "process exited"));
                }
                info!(agent_id, instance_id = %instance.instance_id, "Worker ready");
                self.publish_state(&instance, ProcessState::Ready);
                Ok(instance.status())
            }
            Err(e) => {
                error!(agent_id, error = %e, "Worker handshake failed");
                {
                    let mut life = instance.lifecycle();
                    life.state = ProcessState::Error;
                    life.last_error = Some(e.to_string());
                }
                self.publish_state(&instance, ProcessState::Error);
                let transport = Arc::clone(&instance.transport);
                let grace = self.config.terminate_grace();
                tokio::spawn(async move { transport.shutdown(grace).await });
                Err(e)
            }
        }
    }

    /// Send a request and wait for its response, bounded by the request timeout.
    pub async fn request(
        &self,
        agent_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, DispatchError> {
        self.request_with_timeout(agent_id, method, params, self.config.request_timeout())
            .await
    }

    pub async fn request_with_timeout(
        &self,
        agent_id: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, DispatchError> {
        let instance = self.instance(agent_id).await?;
        call(&instance, method, params, timeout, false).await
    }

    /// Send a notification. Only `shutdown` may reach a worker that is not ready.
    pub async fn notify(
        &self,
        agent_id: &str,
        method: &str,
        params: Value,
    ) -> Result<(), DispatchError> {
        let instance = self.instance(agent_id).await?;
        notify(&instance, method, params).await
    }

    /// Send any protocol message.
    ///
    /// Requests wait for their response; other messages return `None` once
    /// written.
    pub async fn send(
        &self,
        agent_id: &str,
        message: Message,
    ) -> Result<Option<Value>, DispatchError> {
        let instance = self.instance(agent_id).await?;
        match message {
            Message::Request(req) => call(
                &instance,
                &req.method,
                req.params,
                self.config.request_timeout(),
                false,
            )
            .await
            .map(Some),
            Message::Notification(note) => notify(&instance, &note.method, note.params)
                .await
                .map(|()| None),
            Message::Response(resp) => {
                ensure_ready(&instance)?;
                write(&instance, &Message::Response(resp)).await.map(|()| None)
            }
        }
    }

    /// Deliver a chat payload to a worker.
    pub async fn send_message(&self, agent_id: &str, payload: Value) -> Result<Value, DispatchError> {
        self.request(agent_id, METHOD_MESSAGE, payload).await
    }

    /// Invoke a declared tool.
    pub async fn execute_tool(
        &self,
        agent_id: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<Value, DispatchError> {
        self.ensure_tool(agent_id, tool).await?;
        self.request(
            agent_id,
            METHOD_TOOL_CALL,
            json!({ "name": tool, "arguments": arguments }),
        )
        .await
    }

    /// Tools a worker declared at registration or advertised in its handshake.
    pub async fn list_tools(&self, agent_id: &str) -> Result<Vec<String>, DispatchError> {
        let instance = self.instance(agent_id).await?;
        let tools = instance.lifecycle().tools.clone();
        Ok(tools)
    }

    /// Fail with a capability error unless `tool` is declared by the agent.
    pub async fn ensure_tool(&self, agent_id: &str, tool: &str) -> Result<(), DispatchError> {
        let instance = self.instance(agent_id).await?;
        if instance.has_tool(tool) {
            Ok(())
        } else {
            Err(DispatchError::Capability {
                agent_id: agent_id.to_string(),
                tool: tool.to_string(),
            })
        }
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.processes.read().await.contains_key(agent_id)
    }

    pub async fn state(&self, agent_id: &str) -> Option<ProcessState> {
        self.processes
            .read()
            .await
            .get(agent_id)
            .map(|instance| instance.state())
    }

    pub async fn status(&self, agent_id: &str) -> Option<ServerStatus> {
        let instance = self.processes.read().await.get(agent_id).cloned()?;
        Some(instance.status())
    }

    /// Status of every registered worker, ordered by agent id.
    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<ServerStatus> = self
            .processes
            .read()
            .await
            .values()
            .map(|instance| instance.status())
            .collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    /// Outstanding requests of one worker.
    pub async fn pending(&self, agent_id: &str) -> Result<Vec<PendingInfo>, DispatchError> {
        let instance = self.instance(agent_id).await?;
        Ok(instance.pending.snapshot())
    }

    /// Stop a worker and remove its registration.
    pub async fn stop(&self, agent_id: &str) -> Result<(), DispatchError> {
        let instance = self
            .processes
            .write()
            .await
            .remove(agent_id)
            .ok_or_else(|| DispatchError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })?;
        self.stop_instance(&instance).await;
        Ok(())
    }

    /// Stop every worker.
    pub async fn close(&self) {
        let instances: Vec<Arc<ProcessInstance>> =
            self.processes.write().await.drain().map(|(_, i)| i).collect();
        if instances.is_empty() {
            return;
        }
        info!(count = instances.len(), "Stopping all workers");

        let grace = self.config.terminate_grace();
        let mut set = JoinSet::new();
        for instance in instances {
            let events = self.events.clone();
            set.spawn(async move { shutdown_instance(&instance, grace, &events).await });
        }
        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker stop task failed");
            }
        }
    }

    async fn stop_instance(&self, instance: &Arc<ProcessInstance>) {
        shutdown_instance(instance, self.config.terminate_grace(), &self.events).await;
    }

    async fn instance(&self, agent_id: &str) -> Result<Arc<ProcessInstance>, DispatchError> {
        self.processes
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownAgent {
                agent_id: agent_id.to_string(),
            })
    }

    fn publish_state(&self, instance: &ProcessInstance, state: ProcessState) {
        let _ = self.events.send(RegistryEvent::StateChanged {
            agent_id: instance.agent_id.clone(),
            state,
        });
    }
}

async fn shutdown_instance(
    instance: &Arc<ProcessInstance>,
    grace: Duration,
    events: &broadcast::Sender<RegistryEvent>,
) {
    let agent_id = instance.agent_id.as_str();
    info!(agent_id, "Stopping worker");
    if instance.state() == ProcessState::Ready
        && let Err(e) = notify(instance, METHOD_SHUTDOWN, Value::Null).await
    {
        debug!(agent_id, error = %e, "Shutdown notification not delivered");
    }

    instance.transport.shutdown(grace).await;

    let previous = {
        let mut life = instance.lifecycle();
        std::mem::replace(&mut life.state, ProcessState::Stopped)
    };
    instance
        .pending
        .reject_all(&DispatchError::process(agent_id, "process stopped"));
    if previous != ProcessState::Stopped {
        let _ = events.send(RegistryEvent::StateChanged {
            agent_id: agent_id.to_string(),
            state: ProcessState::Stopped,
        });
    }
}

fn ensure_ready(instance: &ProcessInstance) -> Result<(), DispatchError> {
    match instance.state() {
        ProcessState::Ready => Ok(()),
        ProcessState::Starting => Err(DispatchError::process(
            &instance.agent_id,
            "process not ready (handshake pending)",
        )),
        ProcessState::Error => Err(DispatchError::process(
            &instance.agent_id,
            "process failed its handshake",
        )),
        ProcessState::Stopped => Err(DispatchError::process(&instance.agent_id, "process exited")),
    }
}

async fn write(instance: &ProcessInstance, message: &Message) -> Result<(), DispatchError> {
    let frame = protocol::encode(message).map_err(|e| DispatchError::Protocol {
        reason: e.to_string(),
    })?;
    instance
        .transport
        .send(frame)
        .await
        .map_err(|e| DispatchError::from_transport(&instance.agent_id, &e))?;
    instance.touch();
    Ok(())
}

async fn notify(
    instance: &ProcessInstance,
    method: &str,
    params: Value,
) -> Result<(), DispatchError> {
    if method == METHOD_SHUTDOWN {
        if instance.state() == ProcessState::Stopped {
            return Err(DispatchError::process(&instance.agent_id, "process exited"));
        }
    } else {
        ensure_ready(instance)?;
    }
    write(instance, &Message::Notification(Notification::new(method, params))).await
}

/// Write a request and wait for the matching response.
///
/// `handshake` lets the `initialize` request through before the worker is ready.
async fn call(
    instance: &ProcessInstance,
    method: &str,
    params: Value,
    timeout: Duration,
    handshake: bool,
) -> Result<Value, DispatchError> {
    if handshake {
        if instance.state() != ProcessState::Starting {
            return Err(DispatchError::process(
                &instance.agent_id,
                "handshake only allowed while starting",
            ));
        }
    } else {
        ensure_ready(instance)?;
    }

    let id = instance.pending.next_id();
    let frame = protocol::encode(&Message::Request(Request::new(id.clone(), method, params)))
        .map_err(|e| DispatchError::Protocol {
            reason: e.to_string(),
        })?;
    let rx = instance.pending.register(id.clone(), method)?;
    // Removes the entry however this future ends, including being dropped
    // by an enclosing timeout.
    let _entry = instance.pending.guard(id.clone());

    // An exit between the readiness check and registration would have
    // missed this entry.
    if instance.state() == ProcessState::Stopped {
        return Err(DispatchError::process(&instance.agent_id, "process exited"));
    }

    if let Err(e) = instance.transport.send(frame).await {
        return Err(DispatchError::from_transport(&instance.agent_id, &e));
    }
    instance.touch();
    debug!(agent_id = %instance.agent_id, request_id = %id, method, "Request sent");

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => Err(DispatchError::process(
            &instance.agent_id,
            "pending request dropped",
        )),
        Err(_) => {
            warn!(
                agent_id = %instance.agent_id,
                request_id = %id,
                method,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "Request timed out"
            );
            Err(DispatchError::Timeout {
                agent_id: instance.agent_id.clone(),
                after: timeout,
            })
        }
    }
}

/// Consume a worker's output until it exits.
async fn run_reader(
    instance: Arc<ProcessInstance>,
    mut events: mpsc::Receiver<TransportEvent>,
    bus: broadcast::Sender<RegistryEvent>,
    max_frame_bytes: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut exit = ExitInfo::default();
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Data(bytes) => {
                instance.touch();
                for message in decoder.push(&bytes) {
                    handle_message(&instance, message, &bus).await;
                }
            }
            TransportEvent::Exited(info) => {
                exit = info;
                break;
            }
        }
    }
    if let Some(message) = decoder.finish() {
        handle_message(&instance, message, &bus).await;
    }
    on_exit(&instance, exit, &bus);
}

async fn handle_message(
    instance: &ProcessInstance,
    message: Message,
    bus: &broadcast::Sender<RegistryEvent>,
) {
    match message {
        Message::Response(response) => {
            instance.pending.resolve(response);
        }
        Message::Notification(note) => {
            debug!(agent_id = %instance.agent_id, method = %note.method, "Worker notification");
            let _ = bus.send(RegistryEvent::Notification {
                agent_id: instance.agent_id.clone(),
                method: note.method,
                params: note.params,
            });
        }
        Message::Request(request) => {
            debug!(
                agent_id = %instance.agent_id,
                method = %request.method,
                "Acknowledging worker-originated request"
            );
            let ack = Message::Response(Response::success(
                request.id,
                json!({ "acknowledged": true }),
            ));
            if let Err(e) = write(instance, &ack).await {
                warn!(agent_id = %instance.agent_id, error = %e, "Failed to acknowledge request");
            }
        }
    }
}

fn on_exit(instance: &ProcessInstance, exit: ExitInfo, bus: &broadcast::Sender<RegistryEvent>) {
    let previous = {
        let mut life = instance.lifecycle();
        let previous = life.state;
        if previous != ProcessState::Error {
            life.state = ProcessState::Stopped;
        }
        life.exit = Some(exit);
        previous
    };

    if previous == ProcessState::Ready {
        warn!(
            agent_id = %instance.agent_id,
            code = ?exit.code,
            signal = ?exit.signal,
            "Worker exited unexpectedly"
        );
    } else {
        info!(agent_id = %instance.agent_id, code = ?exit.code, "Worker exited");
    }

    let reason = match (exit.code, exit.signal) {
        (Some(code), _) => format!("process exited (code {code})"),
        (None, Some(signal)) => format!("process exited (signal {signal})"),
        (None, None) => "process exited".to_string(),
    };
    instance
        .pending
        .reject_all(&DispatchError::process(&instance.agent_id, reason));

    if previous != ProcessState::Stopped && previous != ProcessState::Error {
        let _ = bus.send(RegistryEvent::StateChanged {
            agent_id: instance.agent_id.clone(),
            state: ProcessState::Stopped,
        });
    }
    let _ = bus.send(RegistryEvent::Exited {
        agent_id: instance.agent_id.clone(),
        code: exit.code,
        signal: exit.signal,
    });
}

/// Add tools advertised in a handshake result (strings or `{name}` objects).
fn merge_tools(tools: &mut Vec<String>, handshake: &Value) {
    let Some(advertised) = handshake.get("tools").and_then(Value::as_array) else {
        return;
    };
    for entry in advertised {
        let name = entry
            .as_str()
            .or_else(|| entry.get("name").and_then(Value::as_str));
        if let Some(name) = name
            && !tools.iter().any(|t| t == name)
        {
            tools.push(name.to_string());
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Instant;

    use switchyard_core::protocol::{ErrorObject, RequestId};

    use super::*;
    use crate::transport::{MemoryLauncher, Reply};

    fn fast_config() -> RegistryConfig {
        RegistryConfig {
            request_timeout_ms: 300,
            handshake_timeout_ms: 300,
            terminate_grace_secs: 1,
            ..RegistryConfig::default()
        }
    }

    fn registry_with(launcher: &MemoryLauncher) -> ProcessRegistry {
        ProcessRegistry::new(Arc::new(launcher.clone()), fast_config())
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::new("memory").with_tools(["search"])
    }

    #[tokio::test]
    async fn register_completes_handshake() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        let status = registry.register("echo", spec()).await.unwrap();
        assert_eq!(status.state, ProcessState::Ready);
        assert_eq!(status.tools, vec!["search"]);
        assert!(status.server_info.is_some());

        let sent = launcher.received("echo");
        let Message::Request(init) = &sent[0] else {
            panic!("expected handshake request");
        };
        assert_eq!(init.method, METHOD_INITIALIZE);
        assert_eq!(init.params["declaredTools"], json!(["search"]));
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("echo", spec()).await.unwrap();
        let err = registry.register("echo", spec()).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyRegistered { .. }));
    }

    #[tokio::test]
    async fn handshake_failure_sets_error_state() {
        let launcher = MemoryLauncher::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Err(ErrorObject::new(-1, "unsupported protocol"))
            } else {
                Reply::Ok(Value::Null)
            }
        });
        let registry = registry_with(&launcher);
        let err = registry.register("bad", spec()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Remote { .. }));
        let status = registry.status("bad").await.unwrap();
        assert_eq!(status.state, ProcessState::Error);
        assert!(status.last_error.unwrap().contains("unsupported protocol"));

        // A failed worker can be registered again.
        let err = registry.register("bad", spec()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Remote { .. }));
    }

    #[tokio::test]
    async fn handshake_timeout_sets_error_state() {
        let launcher = MemoryLauncher::new(|_, _| Reply::Silent);
        let registry = registry_with(&launcher);
        let err = registry.register("mute", spec()).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(registry.state("mute").await, Some(ProcessState::Error));
    }

    #[tokio::test]
    async fn handshake_advertised_tools_are_merged() {
        let launcher = MemoryLauncher::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({"tools": ["search", {"name": "fetch"}, 42]}))
            } else {
                Reply::Ok(Value::Null)
            }
        });
        let registry = registry_with(&launcher);
        registry.register("w", spec()).await.unwrap();
        assert_eq!(
            registry.list_tools("w").await.unwrap(),
            vec!["search", "fetch"]
        );
    }

    #[tokio::test]
    async fn unknown_agent_is_rejected() {
        let registry = registry_with(&MemoryLauncher::echo());
        let err = registry
            .request("nobody", METHOD_MESSAGE, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAgent { .. }));
    }

    #[tokio::test]
    async fn request_round_trip() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("echo", spec()).await.unwrap();
        let result = registry
            .send_message("echo", json!({"message": "ping"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"message": "ping"}));
        assert!(registry.pending("echo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undeclared_tool_is_a_capability_error() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("echo", spec()).await.unwrap();
        let err = registry
            .execute_tool("echo", "delete_everything", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Capability { .. }));
        // Nothing beyond the handshake was written.
        assert_eq!(launcher.received("echo").len(), 1);

        let ok = registry
            .execute_tool("echo", "search", json!({"q": "rust"}))
            .await
            .unwrap();
        assert_eq!(ok, json!({"name": "search", "arguments": {"q": "rust"}}));
    }

    #[tokio::test]
    async fn silent_worker_times_out_after_window() {
        let launcher = MemoryLauncher::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({}))
            } else {
                Reply::Silent
            }
        });
        let registry = registry_with(&launcher);
        registry.register("mute", spec()).await.unwrap();

        let window = Duration::from_millis(200);
        let started = Instant::now();
        let err = registry
            .request_with_timeout("mute", METHOD_MESSAGE, json!({}), window)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, DispatchError::Timeout { .. }));
        assert!(elapsed >= window, "timed out early: {elapsed:?}");
        assert!(elapsed < window + Duration::from_millis(150), "timed out late: {elapsed:?}");
        assert_eq!(registry.status("mute").await.unwrap().pending_requests, 0);
    }

    #[tokio::test]
    async fn abandoned_request_leaves_no_pending_entry() {
        let launcher = MemoryLauncher::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({}))
            } else {
                Reply::Silent
            }
        });
        let registry = registry_with(&launcher);
        registry.register("mute", spec()).await.unwrap();

        for _ in 0..3 {
            let call = registry.request_with_timeout(
                "mute",
                METHOD_MESSAGE,
                json!({}),
                Duration::from_secs(10),
            );
            assert!(
                tokio::time::timeout(Duration::from_millis(50), call)
                    .await
                    .is_err()
            );
        }
        assert!(registry.pending("mute").await.unwrap().is_empty());
        assert_eq!(registry.status("mute").await.unwrap().pending_requests, 0);
        assert_eq!(launcher.received("mute").len(), 4);
    }

    #[tokio::test]
    async fn exit_rejects_all_pending_requests() {
        let launcher = MemoryLauncher::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({}))
            } else {
                Reply::Silent
            }
        });
        let registry = Arc::new(registry_with(&launcher));
        registry.register("w", spec()).await.unwrap();
        let mut bus = registry.subscribe();

        let mut calls = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            calls.push(tokio::spawn(async move {
                registry
                    .request_with_timeout("w", METHOD_MESSAGE, json!({}), Duration::from_secs(10))
                    .await
            }));
        }
        while registry.status("w").await.unwrap().pending_requests < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        launcher.exit("w", Some(137)).await;
        for call in calls {
            let err = call.await.unwrap().unwrap_err();
            assert!(matches!(err, DispatchError::Process { .. }));
            assert!(err.to_string().contains("code 137"));
        }

        let status = registry.status("w").await.unwrap();
        assert_eq!(status.state, ProcessState::Stopped);
        assert_eq!(status.pending_requests, 0);
        assert_eq!(status.exit.unwrap().code, Some(137));

        let mut saw_exit = false;
        while let Ok(event) = bus.try_recv() {
            if let RegistryEvent::Exited { agent_id, code, .. } = event {
                assert_eq!(agent_id, "w");
                assert_eq!(code, Some(137));
                saw_exit = true;
            }
        }
        assert!(saw_exit);

        let err = registry
            .request("w", METHOD_MESSAGE, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Process { .. }));
    }

    #[tokio::test]
    async fn notifications_are_published_and_requests_acknowledged() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("w", spec()).await.unwrap();
        let mut bus = registry.subscribe();

        launcher
            .inject(
                "w",
                b"{\"type\":\"notification\",\"method\":\"progress\",\"params\":{\"pct\":50}}\ngarbage\n{\"type\":\"request\",\"id\":\"w-1\",\"method\":\"ping\"}\n",
            )
            .await;

        let event = tokio::time::timeout(Duration::from_secs(1), bus.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            RegistryEvent::Notification {
                agent_id: "w".into(),
                method: "progress".into(),
                params: json!({"pct": 50}),
            }
        );

        // The ack is written back to the worker.
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            let acked = launcher.received("w").iter().any(|m| {
                matches!(m, Message::Response(r) if r.id == RequestId::from("w-1")
                    && r.result == Some(json!({"acknowledged": true})))
            });
            if acked {
                break;
            }
            assert!(Instant::now() < deadline, "request was never acknowledged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.state("w").await, Some(ProcessState::Ready));
    }

    #[tokio::test]
    async fn stop_sends_shutdown_and_removes_registration() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("w", spec()).await.unwrap();
        registry.stop("w").await.unwrap();

        assert!(!registry.contains("w").await);
        let sent = launcher.received("w");
        assert!(sent.iter().any(|m| matches!(
            m,
            Message::Notification(n) if n.method == METHOD_SHUTDOWN
        )));
        assert!(matches!(
            registry.stop("w").await,
            Err(DispatchError::UnknownAgent { .. })
        ));
        // Registration is free again.
        registry.register("w", spec()).await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_everything() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("a", spec()).await.unwrap();
        registry.register("b", spec()).await.unwrap();
        assert_eq!(registry.statuses().await.len(), 2);
        registry.close().await;
        assert!(registry.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn generic_send_handles_each_message_kind() {
        let launcher = MemoryLauncher::echo();
        let registry = registry_with(&launcher);
        registry.register("w", spec()).await.unwrap();

        let reply = registry
            .send(
                "w",
                Message::Request(Request::new(0_u64, "analyze", json!({"data": [1, 2]}))),
            )
            .await
            .unwrap();
        assert_eq!(reply, Some(json!({"data": [1, 2]})));

        let none = registry
            .send(
                "w",
                Message::Notification(Notification::new("progress", Value::Null)),
            )
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn merge_tools_deduplicates() {
        let mut tools = vec!["a".to_string()];
        merge_tools(&mut tools, &json!({"tools": ["a", "b", {"name": "b"}]}));
        assert_eq!(tools, vec!["a", "b"]);
        merge_tools(&mut tools, &json!({"other": 1}));
        assert_eq!(tools.len(), 2);
    }
}
