//! In-memory workers.
//!
//! A [`MemoryLauncher`] answers requests through a responder closure
//! instead of a real process, so registry and scheduler behaviour can be
//! exercised deterministically. Tests can also inject raw bytes into a
//! worker's output stream and simulate crashes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use switchyard_core::protocol::{
    self, ErrorObject, METHOD_INITIALIZE, METHOD_SHUTDOWN, Message, Request, RequestId, Response,
};
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connection, ExitInfo, LaunchSpec, Launcher, Transport, TransportError, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What an in-memory worker does with a request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Answer with a result.
    Ok(Value),
    /// Answer with an error response.
    Err(ErrorObject),
    /// Never answer.
    Silent,
    /// Exit with the given code instead of answering.
    Exit(Option<i32>),
    /// Wait, then do the inner reply.
    After(Duration, Box<Self>),
}

impl Reply {
    #[must_use]
    pub fn after(self, delay: Duration) -> Self {
        Self::After(delay, Box::new(self))
    }
}

type Responder = Arc<dyn Fn(&str, &Request) -> Reply + Send + Sync>;

struct WorkerHandle {
    events: mpsc::Sender<TransportEvent>,
    exited: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<Message>>>,
}

/// Launches in-memory workers.
#[derive(Clone)]
pub struct MemoryLauncher {
    responder: Responder,
    workers: Arc<Mutex<HashMap<String, WorkerHandle>>>,
}

impl MemoryLauncher {
    /// Build a launcher whose workers answer with `responder(agent_id, request)`.
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&str, &Request) -> Reply + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Workers that complete the handshake and echo every request's params.
    pub fn echo() -> Self {
        Self::new(|_, req| {
            if req.method == METHOD_INITIALIZE {
                Reply::Ok(json!({ "serverInfo": { "name": "memory-echo" } }))
            } else {
                Reply::Ok(req.params.clone())
            }
        })
    }

    /// Push raw bytes into a worker's output stream.
    pub async fn inject(&self, agent_id: &str, bytes: &[u8]) -> bool {
        let Some(events) = self.events_for(agent_id) else {
            return false;
        };
        events
            .send(TransportEvent::Data(bytes.to_vec()))
            .await
            .is_ok()
    }

    /// Make a worker exit as if it crashed.
    pub async fn exit(&self, agent_id: &str, code: Option<i32>) {
        let handle = self.lock_workers().get(agent_id).map(|w| {
            (w.events.clone(), Arc::clone(&w.exited))
        });
        if let Some((events, exited)) = handle {
            emit_exit(&events, &exited, code).await;
        }
    }

    /// Every frame the worker has received so far.
    pub fn received(&self, agent_id: &str) -> Vec<Message> {
        self.lock_workers()
            .get(agent_id)
            .and_then(|w| w.received.lock().ok().map(|r| r.clone()))
            .unwrap_or_default()
    }

    fn events_for(&self, agent_id: &str) -> Option<mpsc::Sender<TransportEvent>> {
        self.lock_workers().get(agent_id).map(|w| w.events.clone())
    }

    fn lock_workers(&self) -> std::sync::MutexGuard<'_, HashMap<String, WorkerHandle>> {
        self.workers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Launcher for MemoryLauncher {
    async fn launch(&self, agent_id: &str, spec: &LaunchSpec) -> Result<Connection, TransportError> {
        if spec.command.trim().is_empty() {
            return Err(TransportError::SpawnFailed {
                reason: "empty command".to_string(),
            });
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(Vec::new()));

        self.lock_workers().insert(
            agent_id.to_string(),
            WorkerHandle {
                events: events_tx.clone(),
                exited: Arc::clone(&exited),
                received: Arc::clone(&received),
            },
        );

        let transport = MemoryTransport {
            agent_id: agent_id.to_string(),
            responder: Arc::clone(&self.responder),
            events: events_tx,
            exited,
            received,
        };

        Ok(Connection {
            transport: Arc::new(transport),
            events: events_rx,
        })
    }
}

struct MemoryTransport {
    agent_id: String,
    responder: Responder,
    events: mpsc::Sender<TransportEvent>,
    exited: Arc<AtomicBool>,
    received: Arc<Mutex<Vec<Message>>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let Ok(message) = protocol::decode_line(&frame) else {
            debug!(agent_id = %self.agent_id, "memory worker ignoring malformed frame");
            return Ok(());
        };
        if let Ok(mut log) = self.received.lock() {
            log.push(message.clone());
        }

        match message {
            Message::Request(request) => {
                let reply = (self.responder)(self.agent_id.as_str(), &request);
                let events = self.events.clone();
                let exited = Arc::clone(&self.exited);
                if matches!(reply, Reply::After(..)) {
                    tokio::spawn(async move {
                        deliver(&events, &exited, request.id, reply).await;
                    });
                } else {
                    deliver(&events, &exited, request.id, reply).await;
                }
            }
            Message::Notification(note) if note.method == METHOD_SHUTDOWN => {
                emit_exit(&self.events, &self.exited, Some(0)).await;
            }
            Message::Notification(_) | Message::Response(_) => {}
        }
        Ok(())
    }

    async fn shutdown(&self, _grace: Duration) {
        emit_exit(&self.events, &self.exited, Some(0)).await;
    }
}

async fn deliver(
    events: &mpsc::Sender<TransportEvent>,
    exited: &AtomicBool,
    id: RequestId,
    mut reply: Reply,
) {
    loop {
        let response = match reply {
            Reply::After(delay, inner) => {
                tokio::time::sleep(delay).await;
                reply = *inner;
                continue;
            }
            Reply::Silent => return,
            Reply::Exit(code) => {
                emit_exit(events, exited, code).await;
                return;
            }
            Reply::Ok(value) => Response::success(id, value),
            Reply::Err(err) => Response::failure(id, err),
        };
        if exited.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(frame) = protocol::encode(&Message::Response(response)) {
            let _ = events.send(TransportEvent::Data(frame.into_bytes())).await;
        }
        return;
    }
}

async fn emit_exit(events: &mpsc::Sender<TransportEvent>, exited: &AtomicBool, code: Option<i32>) {
    if exited.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = events
        .send(TransportEvent::Exited(ExitInfo { code, signal: None }))
        .await;
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn next_message(events: &mut mpsc::Receiver<TransportEvent>) -> Message {
        match events.recv().await.unwrap() {
            TransportEvent::Data(bytes) => {
                protocol::decode_line(std::str::from_utf8(&bytes).unwrap()).unwrap()
            }
            TransportEvent::Exited(info) => panic!("unexpected exit: {info:?}"),
        }
    }

    #[tokio::test]
    async fn echo_worker_answers_with_params() {
        let launcher = MemoryLauncher::echo();
        let Connection {
            transport,
            mut events,
        } = launcher
            .launch("echo", &LaunchSpec::new("memory"))
            .await
            .unwrap();

        let req = Message::Request(Request::new(1_u64, "message", json!({"message": "ping"})));
        transport
            .send(protocol::encode(&req).unwrap())
            .await
            .unwrap();

        let Message::Response(resp) = next_message(&mut events).await else {
            panic!("expected response");
        };
        assert_eq!(resp.id, RequestId::Number(1));
        assert_eq!(resp.into_outcome().unwrap(), json!({"message": "ping"}));
        assert_eq!(launcher.received("echo").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_notification_exits_once() {
        let launcher = MemoryLauncher::echo();
        let Connection {
            transport,
            mut events,
        } = launcher
            .launch("w", &LaunchSpec::new("memory"))
            .await
            .unwrap();

        let note = Message::Notification(protocol::Notification::new(METHOD_SHUTDOWN, Value::Null));
        transport
            .send(protocol::encode(&note).unwrap())
            .await
            .unwrap();
        transport.shutdown(Duration::from_millis(10)).await;

        assert!(matches!(
            events.recv().await,
            Some(TransportEvent::Exited(ExitInfo { code: Some(0), .. }))
        ));
        assert!(events.try_recv().is_err());
        assert!(matches!(
            transport.send("{}\n".to_string()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn inject_reaches_event_stream() {
        let launcher = MemoryLauncher::echo();
        let Connection { mut events, .. } = launcher
            .launch("w", &LaunchSpec::new("memory"))
            .await
            .unwrap();
        assert!(launcher.inject("w", b"partial").await);
        assert!(!launcher.inject("missing", b"x").await);
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Data(b"partial".to_vec()))
        );
    }
}
