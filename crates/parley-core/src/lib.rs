//! parley core library
//!
//! This crate provides the pieces of the parley peer protocol that do not
//! touch the network:
//!
//! - [`types`]: peer identity, connection metadata and resource buffers
//! - [`crypto`]: passphrase-derived payload encryption
//! - [`resource`]: out-of-band file transfer for JSON payloads
//! - [`envelope`]: the tagged wire envelope exchanged between peers
//! - [`error`]: Error types

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod resource;
pub mod types;

pub use crypto::PayloadCipher;
pub use envelope::{Body, Envelope, EnvelopeKind, Payload};
pub use error::{Error, Result};
pub use resource::FileStore;
pub use types::*;
