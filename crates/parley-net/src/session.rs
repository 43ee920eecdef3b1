//! Session: the local endpoint and the application facade
//!
//! The session opens the local endpoint, adopts inbound links and keeps the
//! endpoint alive across transient failures:
//!
//! ```text
//! Disconnected --start--> Connecting --open--> Connected
//!                              ^                   |
//!                              |  transient error  |
//!                              +---- backoff ------+
//!                                        |
//!                              retries exhausted --> Error
//! ```

use crate::connection::Connection;
use crate::correlation::CallOptions;
use crate::protocol::{PeerEvent, Protocol, ProtocolConfig, ProtocolError};
use crate::registry::{ConnectionRegistry, RegistryConfig};
use crate::transport::{Directory, EndpointError, EndpointEvent, Transport, TransportError};
use parking_lot::{Mutex, RwLock};
use parley_core::{FileStore, Metadata, PayloadCipher, PeerId};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(PeerId),
    #[error("Session destroyed")]
    Destroyed,
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Protocol(e) if e.is_timeout())
    }
}

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Halted after a fatal error or exhausted retries
    Error,
}

/// Session configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Identity presented to peers
    pub local: Metadata,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Delay unit; attempt `n` waits `backoff_base * 2^n`
    pub backoff_base: Duration,
    pub protocol: ProtocolConfig,
    pub registry: RegistryConfig,
}

impl SessionConfig {
    pub fn new(local: Metadata) -> Self {
        Self {
            local,
            max_retries: 5,
            backoff_base: Duration::from_secs(1),
            protocol: ProtocolConfig::default(),
            registry: RegistryConfig::default(),
        }
    }

    /// Delay before reconnect attempt `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Why an endpoint run ended
enum EndpointExit {
    Closed,
    Failed(EndpointError),
}

/// A local endpoint plus its connections
pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn Directory>,
    protocol: Arc<Protocol>,
    registry: Arc<ConnectionRegistry>,
    state: watch::Sender<SessionState>,
    retry_count: AtomicU32,
    address: RwLock<Option<String>>,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
    runner: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn Directory>,
        cipher: Arc<PayloadCipher>,
        store: Arc<dyn FileStore>,
    ) -> Result<Arc<Self>, SessionError> {
        let protocol = Arc::new(Protocol::new(
            config.local.id.clone(),
            cipher,
            store,
            config.protocol.clone(),
        )?);
        let registry = ConnectionRegistry::new(
            Arc::clone(&transport),
            Arc::clone(&protocol),
            config.registry.clone(),
        );
        let (state, _) = watch::channel(SessionState::Disconnected);

        Ok(Arc::new(Self {
            config,
            transport,
            directory,
            protocol,
            registry,
            state,
            retry_count: AtomicU32::new(0),
            address: RwLock::new(None),
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            runner: Mutex::new(None),
        }))
    }

    pub fn local(&self) -> &Metadata {
        &self.config.local
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    /// Address assigned when the endpoint opened
    pub fn address(&self) -> Option<String> {
        self.address.read().clone()
    }

    pub fn protocol(&self) -> &Arc<Protocol> {
        &self.protocol
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("Session state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    /// Open the local endpoint. A no-op while connecting or connected.
    pub fn start(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(SessionError::Destroyed);
        }

        let mut runner = self.runner.lock();
        if runner.as_ref().map_or(false, |h| !h.is_finished()) {
            return Ok(());
        }

        self.retry_count.store(0, Ordering::SeqCst);
        self.set_state(SessionState::Connecting);
        *runner = Some(tokio::spawn(Arc::clone(self).run()));
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            let exit = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                exit = self.run_endpoint() => exit,
            };

            let err = match exit {
                EndpointExit::Closed => {
                    info!("Endpoint closed");
                    self.address.write().take();
                    self.set_state(SessionState::Disconnected);
                    self.protocol.emit(PeerEvent::ServerClosed);
                    return;
                }
                EndpointExit::Failed(err) => err,
            };

            if !err.is_transient() {
                error!("Endpoint failed: {}", err);
                self.set_state(SessionState::Error);
                return;
            }

            let retry = self.retry_count.load(Ordering::SeqCst);
            if retry >= self.config.max_retries {
                error!("Giving up after {} reconnect attempts: {}", retry, err);
                self.set_state(SessionState::Error);
                return;
            }

            let retry = retry + 1;
            self.retry_count.store(retry, Ordering::SeqCst);
            let delay = self.config.backoff(retry);
            warn!(
                "Endpoint error ({}), reconnect {}/{} in {:?}",
                err, retry, self.config.max_retries, delay
            );

            self.set_state(SessionState::Connecting);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run the endpoint until it closes or fails transiently
    async fn run_endpoint(&self) -> EndpointExit {
        let mut events = match self.transport.open(&self.config.local).await {
            Ok(events) => events,
            Err(e) => {
                let err = EndpointError::from(&e);
                self.protocol.emit(PeerEvent::ServerError(err.clone()));
                return EndpointExit::Failed(err);
            }
        };

        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::Open { address } => {
                    info!("Endpoint open at {}", address);
                    self.retry_count.store(0, Ordering::SeqCst);
                    *self.address.write() = Some(address.clone());
                    self.set_state(SessionState::Connected);
                    self.protocol.emit(PeerEvent::ServerOpen { address });
                }
                EndpointEvent::Connection(link) => {
                    self.registry.register(link);
                }
                EndpointEvent::Error(err) => {
                    self.protocol.emit(PeerEvent::ServerError(err.clone()));
                    if err.is_transient() {
                        return EndpointExit::Failed(err);
                    }
                    warn!("Endpoint error: {}", err);
                }
                EndpointEvent::Closed => break,
            }
        }
        EndpointExit::Closed
    }

    /// Tear down the endpoint and every connection
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying session {}", self.config.local.id);

        self.shutdown.cancel();
        let runner = self.runner.lock().take();
        if let Some(runner) = runner {
            runner.abort();
        }

        let closed = self.registry.close_all();
        let rejected = self.protocol.correlator().reject_all();
        debug!("Closed {} connections, rejected {} calls", closed, rejected);

        self.transport.shutdown().await;
        self.address.write().take();
        self.set_state(SessionState::Disconnected);
        self.protocol.emit(PeerEvent::ServerClosed);
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(SessionError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Connect to a reachable peer
    pub async fn connect(&self, peer: &PeerId) -> Result<Arc<Connection>, SessionError> {
        self.ensure_live()?;
        if let Some(conn) = self.registry.get_by_peer_id(peer) {
            return Ok(conn);
        }
        if !self.directory.is_reachable(peer).await? {
            return Err(SessionError::PeerUnreachable(peer.clone()));
        }
        Ok(self.registry.connect(peer, &self.config.local).await?)
    }

    /// Connect to `peer` if the directory lists it
    pub async fn search_peer(&self, peer: &PeerId) -> Result<Option<Arc<Connection>>, SessionError> {
        match self.connect(peer).await {
            Ok(conn) => Ok(Some(conn)),
            Err(SessionError::PeerUnreachable(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Call a handler on `peer`
    pub async fn invoke(
        &self,
        peer: &PeerId,
        name: &str,
        argv: Vec<Value>,
    ) -> Result<Value, SessionError> {
        self.invoke_with(peer, name, argv, CallOptions::default())
            .await
    }

    pub async fn invoke_with(
        &self,
        peer: &PeerId,
        name: &str,
        argv: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, SessionError> {
        let conn = self.connect(peer).await?;
        Ok(self.protocol.invoke_with(&conn, name, argv, options).await?)
    }

    /// Send encrypted JSON to `peer`
    pub async fn send_json(&self, peer: &PeerId, data: &Value) -> Result<(), SessionError> {
        let conn = self.connect(peer).await?;
        Ok(self.protocol.send_json(&conn, data).await?)
    }

    /// Send raw bytes to `peer`
    pub async fn send_binary(&self, peer: &PeerId, data: Vec<u8>) -> Result<(), SessionError> {
        let conn = self.connect(peer).await?;
        Ok(self.protocol.send_binary(&conn, data).await?)
    }

    /// Register an RPC handler. Returns true if one was replaced.
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F) -> bool
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.protocol.handlers().register(name, handler)
    }

    pub fn unregister_handler(&self, name: &str) -> bool {
        self.protocol.handlers().unregister(name)
    }

    /// Subscribe to session and peer events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.protocol.subscribe()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.registry.connected_peers()
    }
}
