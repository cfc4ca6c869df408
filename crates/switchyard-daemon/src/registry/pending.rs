//! Pending-request table.
//!
//! Tracks requests written to one worker that are still awaiting a
//! response. Entries are keyed by correlation id and resolved exactly once:
//! by the matching response, by the worker exiting, or by the caller giving
//! up (its [`PendingGuard`] is dropped).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use switchyard_core::protocol::{RequestId, Response};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::DispatchError;

/// Outcome delivered to a waiting caller.
pub type PendingResult = Result<Value, DispatchError>;

struct PendingEntry {
    method: String,
    created_at: Instant,
    tx: oneshot::Sender<PendingResult>,
}

/// Snapshot of one outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub id: RequestId,
    pub method: String,
    pub age: Duration,
}

/// Per-worker map from correlation id to waiting caller.
pub struct PendingTable {
    agent_id: String,
    entries: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicU64,
}

impl PendingTable {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh correlation id. Ids are never reused.
    pub fn next_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Add a waiting entry and return the receiver its outcome arrives on.
    pub fn register(
        &self,
        id: RequestId,
        method: &str,
    ) -> Result<oneshot::Receiver<PendingResult>, DispatchError> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(DispatchError::Protocol {
                reason: format!("correlation id {id} is already pending"),
            });
        }
        entries.insert(
            id.clone(),
            PendingEntry {
                method: method.to_string(),
                created_at: Instant::now(),
                tx,
            },
        );
        drop(entries);
        debug!(agent_id = %self.agent_id, request_id = %id, method, "Added pending request");
        Ok(rx)
    }

    /// Deliver a response to its waiting caller.
    ///
    /// Returns `false` when no entry matches (late or unsolicited response).
    pub fn resolve(&self, response: Response) -> bool {
        let Some(entry) = self.lock().remove(&response.id) else {
            warn!(
                agent_id = %self.agent_id,
                request_id = %response.id,
                "Response for unknown correlation id"
            );
            return false;
        };

        let outcome = response.into_outcome().map_err(|err| DispatchError::Remote {
            agent_id: self.agent_id.clone(),
            code: err.code,
            message: err.message,
        });
        debug!(
            agent_id = %self.agent_id,
            method = %entry.method,
            elapsed_ms = u64::try_from(entry.created_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            ok = outcome.is_ok(),
            "Resolved pending request"
        );
        // The caller may have given up already; nothing to do then.
        let _ = entry.tx.send(outcome);
        true
    }

    /// Drop an entry without resolving it.
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Tie the entry for `id` to the returned guard's lifetime.
    pub const fn guard(&self, id: RequestId) -> PendingGuard<'_> {
        PendingGuard { table: self, id }
    }

    /// Reject every outstanding entry with `error`. Returns how many there were.
    pub fn reject_all(&self, error: &DispatchError) -> usize {
        let drained: Vec<PendingEntry> = self
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            warn!(agent_id = %self.agent_id, count, error = %error, "Rejected pending requests");
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Outstanding requests, oldest first.
    pub fn snapshot(&self) -> Vec<PendingInfo> {
        let mut infos: Vec<PendingInfo> = self
            .lock()
            .iter()
            .map(|(id, entry)| PendingInfo {
                id: id.clone(),
                method: entry.method.clone(),
                age: entry.created_at.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }
}

/// Removes its entry when dropped, whether or not it was answered.
///
/// Held by the caller across the wait so that a caller cancelled from the
/// outside (e.g. by an enclosing timeout) leaves nothing behind.
pub struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.table.cancel(&self.id) {
            debug!(agent_id = %self.table.agent_id, request_id = %self.id, "Abandoned pending request");
        }
    }
}
