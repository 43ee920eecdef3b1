//! Networking layer for the parley peer protocol
//!
//! This crate provides:
//! - Transport and directory collaborator traits
//! - Envelope dispatch and RPC handlers
//! - Request/reply correlation with timeouts and cancellation
//! - A connection registry with deduplicated dialing
//! - Sessions with exponential-backoff reconnect
//! - Loopback and TCP transports, and a directory-backed file store

pub mod connection;
pub mod correlation;
pub mod framing;
pub mod loopback;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod tcp;
pub mod transport;

pub use connection::{Connection, ConnectionState};
pub use correlation::{CallError, CallOptions, Correlator};
pub use framing::{Frame, FrameCodec};
pub use loopback::{LoopbackHub, LoopbackTransport};
pub use protocol::{HandlerTable, PeerEvent, Protocol, ProtocolConfig, ProtocolError};
pub use registry::{ConnectionRegistry, RegistryConfig};
pub use session::{Session, SessionConfig, SessionError, SessionState};
pub use store::DirStore;
pub use tcp::{PeerBook, TcpTransport};
pub use transport::{
    Directory, EndpointError, EndpointErrorKind, EndpointEvent, Link, LinkEvent, Transport,
    TransportError,
};
pub use tokio_util::sync::CancellationToken;
