//! Core data types shared by every parley component

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque identifier of a peer endpoint, stable across sessions
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Profile information a peer presents about itself
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Stable user identifier
    pub uuid: String,
    /// Display name
    pub name: String,
    /// Contact address
    pub email: Option<String>,
    /// Raw avatar image bytes
    pub avatar: Option<Vec<u8>>,
}

/// Identity exchanged when a connection opens.
///
/// Metadata belongs to the connection, never to individual envelopes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identifier the peer asserts for itself
    pub id: PeerId,
    /// Profile details
    pub info: Profile,
}

impl Metadata {
    pub fn new(id: impl Into<PeerId>, info: Profile) -> Self {
        Self {
            id: id.into(),
            info,
        }
    }

    /// Metadata carrying only an identifier
    pub fn anonymous(id: impl Into<PeerId>) -> Self {
        Self::new(id, Profile::default())
    }
}

/// A materialized file carried alongside a payload
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBuffer {
    pub bytes: Vec<u8>,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
}

impl ResourceBuffer {
    pub fn new(bytes: Vec<u8>, name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let size = bytes.len() as u64;
        Self {
            bytes,
            name: name.into(),
            mime_type: mime_type.into(),
            size,
        }
    }
}

impl fmt::Debug for ResourceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceBuffer")
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Resources keyed by the path string they stand in for
pub type ResourceMap = BTreeMap<String, ResourceBuffer>;

/// Current wall-clock time in unix millis
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
