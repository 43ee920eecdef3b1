//! Connection registry
//!
//! Owns one [`Connection`] per remote peer and a driver task per connection
//! that feeds link events into the protocol. Concurrent `connect` calls for
//! the same peer share a single dial.

use crate::connection::Connection;
use crate::protocol::{PeerEvent, Protocol};
use crate::transport::{Link, LinkEvent, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use parley_core::{Metadata, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tracing::{debug, info, warn};

/// Registry configuration
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How long a dialed link may take to report open
    pub open_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            open_timeout: Duration::from_secs(15),
        }
    }
}

type DialCell = Arc<OnceCell<Arc<Connection>>>;

/// Registry of live connections
pub struct ConnectionRegistry {
    transport: Arc<dyn Transport>,
    protocol: Arc<Protocol>,
    /// Open connections by the id their metadata asserted
    by_peer: RwLock<HashMap<PeerId, Arc<Connection>>>,
    /// Every connection with a running driver, by connection id
    live: RwLock<HashMap<u64, Arc<Connection>>>,
    /// In-flight dials
    dialing: Mutex<HashMap<PeerId, DialCell>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        protocol: Arc<Protocol>,
        config: RegistryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            protocol,
            by_peer: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
            dialing: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    /// Get the open connection for a peer, by asserted or transport id
    pub fn get_by_peer_id(&self, peer: &PeerId) -> Option<Arc<Connection>> {
        if let Some(conn) = self.by_peer.read().get(peer).filter(|c| c.is_open()) {
            return Some(Arc::clone(conn));
        }
        self.by_peer
            .read()
            .values()
            .find(|c| c.peer_id() == peer && c.is_open())
            .cloned()
    }

    /// List connected peers
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .by_peer
            .read()
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(id, _)| id.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of connections with a running driver
    pub fn live_count(&self) -> usize {
        self.live.read().len()
    }

    /// Connect to a peer, reusing an open connection or an in-flight dial
    pub async fn connect(
        self: &Arc<Self>,
        peer: &PeerId,
        metadata: &Metadata,
    ) -> Result<Arc<Connection>, TransportError> {
        if let Some(conn) = self.get_by_peer_id(peer) {
            return Ok(conn);
        }

        let cell: DialCell = Arc::clone(
            self.dialing
                .lock()
                .entry(peer.clone())
                .or_insert_with(|| Arc::new(OnceCell::new())),
        );

        let result = cell
            .get_or_try_init(|| self.dial(peer, metadata))
            .await
            .map(Arc::clone);

        {
            let mut dialing = self.dialing.lock();
            if dialing.get(peer).map_or(false, |c| Arc::ptr_eq(c, &cell)) {
                dialing.remove(peer);
            }
        }

        match result {
            // the shared dial may have completed before a teardown
            Ok(conn) if !conn.is_open() => Err(TransportError::ConnectionClosed),
            other => other,
        }
    }

    async fn dial(
        self: &Arc<Self>,
        peer: &PeerId,
        metadata: &Metadata,
    ) -> Result<Arc<Connection>, TransportError> {
        info!("Connecting to {}", peer);
        let link = self.transport.connect(peer, metadata).await?;
        let (conn, opened) = self.spawn_driver(link);

        match tokio::time::timeout(self.config.open_timeout, opened).await {
            Ok(Ok(())) => Ok(conn),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                warn!("Connection to {} did not open in {:?}", peer, self.config.open_timeout);
                self.teardown(&conn);
                Err(TransportError::OpenTimeout(peer.clone()))
            }
        }
    }

    /// Adopt an inbound link
    pub fn register(self: &Arc<Self>, link: Link) -> Arc<Connection> {
        debug!("Accepted link from {}", link.remote);
        let (conn, _opened) = self.spawn_driver(link);
        conn
    }

    fn spawn_driver(self: &Arc<Self>, link: Link) -> (Arc<Connection>, oneshot::Receiver<()>) {
        let Link {
            remote,
            outbound,
            events,
        } = link;
        let conn = Arc::new(Connection::new(remote, outbound));
        let (opened_tx, opened_rx) = oneshot::channel();

        self.live.write().insert(conn.id(), Arc::clone(&conn));
        tokio::spawn(Arc::clone(self).drive(Arc::clone(&conn), events, opened_tx));

        (conn, opened_rx)
    }

    async fn drive(
        self: Arc<Self>,
        conn: Arc<Connection>,
        mut events: mpsc::Receiver<LinkEvent>,
        opened: oneshot::Sender<()>,
    ) {
        let mut opened = Some(opened);

        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = conn.closed() => None,
            };

            match event {
                Some(LinkEvent::Open(metadata)) => {
                    if !conn.mark_open(metadata.clone()) {
                        break;
                    }
                    self.index(&conn, &metadata);
                    info!("Peer {} connected (connection {})", metadata.id, conn.id());
                    self.protocol.emit(PeerEvent::PeerConnected {
                        peer: metadata.id.clone(),
                        metadata,
                    });
                    if let Some(tx) = opened.take() {
                        let _ = tx.send(());
                    }
                }
                Some(LinkEvent::Data(bytes)) => {
                    if let Err(e) = self.protocol.handle_frame(&conn, &bytes).await {
                        warn!("Dropping message from {}: {}", conn.remote_id(), e);
                    }
                }
                Some(LinkEvent::Error(e)) => {
                    warn!("Connection to {} failed: {}", conn.remote_id(), e);
                    break;
                }
                Some(LinkEvent::Close) | None => break,
            }
        }

        self.teardown(&conn);
    }

    fn index(&self, conn: &Arc<Connection>, metadata: &Metadata) {
        let previous = self
            .by_peer
            .write()
            .insert(metadata.id.clone(), Arc::clone(conn));
        if let Some(previous) = previous.filter(|p| p.id() != conn.id()) {
            debug!(
                "Connection {} replaces {} for {}",
                conn.id(),
                previous.id(),
                metadata.id
            );
        }
    }

    /// Close a connection, drop it from the registry and fail its calls
    fn teardown(&self, conn: &Arc<Connection>) {
        let was_open = conn.is_open();
        conn.close();

        if self.live.write().remove(&conn.id()).is_none() {
            return;
        }

        let peer = conn.remote_id();
        {
            let mut by_peer = self.by_peer.write();
            if by_peer.get(&peer).map_or(false, |c| c.id() == conn.id()) {
                by_peer.remove(&peer);
            }
        }

        let rejected = self.protocol.correlator().reject_connection(conn.id());
        if rejected > 0 {
            debug!("Rejected {} pending calls to {}", rejected, peer);
        }

        if was_open {
            info!("Peer {} disconnected", peer);
            self.protocol.emit(PeerEvent::PeerDisconnected { peer });
        }
    }

    /// Close one peer's connection
    pub fn disconnect(&self, peer: &PeerId) -> bool {
        match self.get_by_peer_id(peer) {
            Some(conn) => {
                self.teardown(&conn);
                true
            }
            None => false,
        }
    }

    /// Close every connection
    pub fn close_all(&self) -> usize {
        let conns: Vec<Arc<Connection>> = self.live.read().values().cloned().collect();
        for conn in &conns {
            self.teardown(conn);
        }
        conns.len()
    }
}
