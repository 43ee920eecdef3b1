//! A live connection to one remote peer

use crate::transport::TransportError;
use parking_lot::RwLock;
use parley_core::{Metadata, PeerId};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Opening,
    Open,
    Closed,
}

/// Connection to a peer
pub struct Connection {
    /// Process-unique connection id
    id: u64,
    /// Peer this connection was dialed to or accepted from
    peer_id: PeerId,
    /// Metadata the remote asserted on open
    metadata: RwLock<Option<Metadata>>,
    state: RwLock<ConnectionState>,
    /// Send channel; taken on close so the transport sees the hangup
    tx: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    closed: CancellationToken,
}

impl Connection {
    /// Create a connection in the `Opening` state
    pub fn new(peer_id: PeerId, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_id,
            metadata: RwLock::new(None),
            state: RwLock::new(ConnectionState::Opening),
            tx: RwLock::new(Some(tx)),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Transport-level peer id
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Identifier the remote asserted, falling back to the transport peer id
    pub fn remote_id(&self) -> PeerId {
        self.metadata
            .read()
            .as_ref()
            .map(|m| m.id.clone())
            .unwrap_or_else(|| self.peer_id.clone())
    }

    pub fn metadata(&self) -> Option<Metadata> {
        self.metadata.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if connection is open
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Record the remote metadata and move to `Open`.
    ///
    /// Returns false if the connection was already closed.
    pub fn mark_open(&self, metadata: Metadata) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        *self.metadata.write() = Some(metadata);
        *state = ConnectionState::Open;
        true
    }

    /// Send bytes to this peer
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        let tx = self
            .tx
            .read()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;
        tx.send(bytes)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Close the connection.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let mut state = self.state.write();
        if *state == ConnectionState::Closed {
            return false;
        }
        *state = ConnectionState::Closed;
        self.tx.write().take();
        self.closed.cancel();
        true
    }

    /// Resolves once the connection is closed locally
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("state", &self.state())
            .finish()
    }
}
