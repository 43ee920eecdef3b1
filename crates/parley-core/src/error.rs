//! Error types for parley

use crate::crypto::CryptoError;
use crate::resource::ResourceError;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// parley core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Envelope serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// JSON payload could not be encoded or parsed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encryption or decryption failure
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Resource read/upload failure
    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Envelope was produced by an incompatible wire version
    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u8),

    /// Zero-length envelope
    #[error("empty envelope")]
    Empty,
}
