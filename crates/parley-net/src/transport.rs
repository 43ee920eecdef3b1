//! Transport collaborator interface
//!
//! A transport opens the local endpoint, dials remote peers and hands back
//! one [`Link`] per connection. Each link is a pair of channels: bytes go
//! out through `outbound`, lifecycle and data events come in through
//! `events`. Dropping the outbound sender closes the link.

use crate::framing::FrameError;
use async_trait::async_trait;
use parley_core::{Metadata, PeerId};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(PeerId),
    #[error("Timed out opening connection to {0}")]
    OpenTimeout(PeerId),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Endpoint error: {0}")]
    Endpoint(EndpointError),
    #[error("Endpoint not open")]
    NotOpen,
}

/// Error category reported by the local endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointErrorKind {
    SocketError,
    ServerError,
    Network,
    PeerUnavailable,
    UnavailableId,
    InvalidId,
    Other,
}

impl EndpointErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SocketError => "socket-error",
            Self::ServerError => "server-error",
            Self::Network => "network",
            Self::PeerUnavailable => "peer-unavailable",
            Self::UnavailableId => "unavailable-id",
            Self::InvalidId => "invalid-id",
            Self::Other => "other",
        }
    }
}

/// Error event from the local endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointError {
    pub kind: EndpointErrorKind,
    pub message: String,
}

impl EndpointError {
    pub fn new(kind: EndpointErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Connectivity failures that a reconnect may fix
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            EndpointErrorKind::SocketError
                | EndpointErrorKind::ServerError
                | EndpointErrorKind::Network
        )
    }
}

impl fmt::Display for EndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for EndpointError {}

impl From<&TransportError> for EndpointError {
    fn from(err: &TransportError) -> Self {
        let kind = match err {
            TransportError::Endpoint(e) => return e.clone(),
            TransportError::Io(_) => EndpointErrorKind::SocketError,
            TransportError::PeerUnavailable(_) => EndpointErrorKind::PeerUnavailable,
            TransportError::ConnectionClosed | TransportError::OpenTimeout(_) => {
                EndpointErrorKind::Network
            }
            _ => EndpointErrorKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}

/// Event from the local endpoint
#[derive(Debug)]
pub enum EndpointEvent {
    /// Endpoint registered; carries the address assigned by the rendezvous side
    Open { address: String },
    /// A remote peer connected to us
    Connection(Link),
    /// Endpoint-level failure
    Error(EndpointError),
    /// Endpoint shut down
    Closed,
}

/// Event on a single peer link
#[derive(Debug)]
pub enum LinkEvent {
    /// Link is usable; carries the metadata the remote asserted
    Open(Metadata),
    /// Bytes from the remote
    Data(Vec<u8>),
    /// Remote or transport closed the link
    Close,
    /// Link-level failure
    Error(String),
}

/// A raw connection handed out by a transport
#[derive(Debug)]
pub struct Link {
    /// Peer this link was dialed to or accepted from
    pub remote: PeerId,
    /// Outgoing bytes
    pub outbound: mpsc::Sender<Vec<u8>>,
    /// Incoming events
    pub events: mpsc::Receiver<LinkEvent>,
}

/// Local endpoint plus dialing
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the local endpoint as `local.id`.
    ///
    /// `local` is presented to every peer that connects to us. Endpoint
    /// events are delivered on the returned channel until the endpoint
    /// shuts down.
    async fn open(&self, local: &Metadata) -> Result<mpsc::Receiver<EndpointEvent>, TransportError>;

    /// Dial a remote peer, presenting `metadata`
    async fn connect(&self, peer: &PeerId, metadata: &Metadata) -> Result<Link, TransportError>;

    /// Tear down the local endpoint
    async fn shutdown(&self);
}

/// Rendezvous directory of reachable peers
#[async_trait]
pub trait Directory: Send + Sync {
    async fn list_reachable_peers(&self) -> Result<Vec<PeerId>, TransportError>;

    async fn is_reachable(&self, peer: &PeerId) -> Result<bool, TransportError> {
        Ok(self.list_reachable_peers().await?.contains(peer))
    }
}
