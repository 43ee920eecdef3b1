//! Request/reply correlation for outbound calls
//!
//! Every outbound invoke registers a pending entry keyed by a fresh reply
//! id. The entry is removed exactly once: by a matching reply, when its
//! connection goes away, or when the caller's [`PendingReply`] is dropped
//! (deadline, cancellation, or the caller giving up).

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default time to wait for a reply
pub const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Call errors
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    #[error("No reply within {0:?}")]
    Timeout(Duration),
    #[error("Call cancelled")]
    Cancelled,
    #[error("Connection closed before reply")]
    ConnectionClosed,
    #[error("{0}")]
    Remote(String),
    #[error("Malformed reply: {0}")]
    MalformedReply(String),
    #[error("Failed to receive reply resources: {0}")]
    Resource(String),
}

/// Outcome delivered to a waiting caller
pub type CallOutcome = Result<Value, CallError>;

/// Per-call options
#[derive(Clone, Debug, Default)]
pub struct CallOptions {
    /// Overrides the engine's default timeout
    pub timeout: Option<Duration>,
    /// Cancels the call when triggered
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

struct PendingCall {
    connection: u64,
    tx: oneshot::Sender<CallOutcome>,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Handle to one pending call.
///
/// Dropping the handle removes the call from the table, so a caller that
/// stops waiting never leaves an entry behind.
pub struct PendingReply {
    reply_id: String,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<CallOutcome>,
    table: PendingTable,
}

impl PendingReply {
    pub fn reply_id(&self) -> &str {
        &self.reply_id
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.lock().remove(&self.reply_id);
    }
}

/// Table of outstanding calls
pub struct Correlator {
    pending: PendingTable,
    default_timeout: Duration,
}

impl Correlator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    /// Register a call bound to `connection`
    pub fn register(&self, connection: u64, timeout: Option<Duration>) -> PendingReply {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;
        let (tx, rx) = oneshot::channel();

        let mut pending = self.pending.lock();
        let reply_id = loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(reply_id.clone(), PendingCall { connection, tx });

        PendingReply {
            reply_id,
            deadline,
            timeout,
            rx,
            table: Arc::clone(&self.pending),
        }
    }

    /// Connection a pending call was sent on
    pub fn connection_of(&self, reply_id: &str) -> Option<u64> {
        self.pending.lock().get(reply_id).map(|call| call.connection)
    }

    /// Complete a call with a reply that arrived on `connection`.
    /// Returns false if no entry matched.
    pub fn resolve(&self, reply_id: &str, connection: u64, outcome: CallOutcome) -> bool {
        let call = {
            let mut pending = self.pending.lock();
            match pending.get(reply_id) {
                Some(call) if call.connection == connection => pending.remove(reply_id),
                Some(call) => {
                    debug!(
                        "Dropping reply {} on connection {}, call was sent on {}",
                        reply_id, connection, call.connection
                    );
                    return false;
                }
                None => None,
            }
        };

        match call {
            Some(call) => {
                // the caller may have stopped waiting
                let _ = call.tx.send(outcome);
                true
            }
            None => {
                debug!("Dropping reply for unknown call {}", reply_id);
                false
            }
        }
    }

    /// Fail every call bound to `connection`
    pub fn reject_connection(&self, connection: u64) -> usize {
        let calls: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, call)| call.connection == connection)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };

        let count = calls.len();
        for call in calls {
            let _ = call.tx.send(Err(CallError::ConnectionClosed));
        }
        count
    }

    /// Fail every outstanding call
    pub fn reject_all(&self) -> usize {
        let calls: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        let count = calls.len();
        for call in calls {
            let _ = call.tx.send(Err(CallError::ConnectionClosed));
        }
        count
    }

    pub fn contains(&self, reply_id: &str) -> bool {
        self.pending.lock().contains_key(reply_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Wait for the reply, the deadline or cancellation, whichever is first
    pub async fn wait(
        &self,
        mut pending: PendingReply,
        cancel: Option<CancellationToken>,
    ) -> CallOutcome {
        let cancel = cancel.unwrap_or_default();
        let (deadline, timeout) = (pending.deadline, pending.timeout);

        tokio::select! {
            outcome = &mut pending.rx => {
                outcome.unwrap_or(Err(CallError::ConnectionClosed))
            }
            _ = tokio::time::sleep_until(deadline) => Err(CallError::Timeout(timeout)),
            _ = cancel.cancelled() => Err(CallError::Cancelled),
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new(DEFAULT_INVOKE_TIMEOUT)
    }
}
