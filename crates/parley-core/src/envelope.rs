//! Wire envelope exchanged between peers
//!
//! Wire format:
//! - 1 byte: wire version
//! - N bytes: postcard-encoded [`Envelope`]
//!
//! JSON values inside an envelope travel as embedded UTF-8 JSON text, since
//! postcard is not self-describing.

use crate::crypto::PayloadCipher;
use crate::error::{Error, Result};
use crate::types::ResourceMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Current envelope wire version
pub const WIRE_VERSION: u8 = 1;

/// One unit of protocol data
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender's client id (sealed with the session cipher)
    pub id: String,
    /// Send time (unix millis)
    pub timestamp: u64,
    /// Variant-specific content
    pub body: Body,
}

/// Envelope variants
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Body {
    /// Encrypted application JSON
    Json {
        data: Vec<u8>,
        resource: Option<ResourceMap>,
    },
    /// Raw application bytes
    Binary { data: Vec<u8> },
    /// Remote procedure call
    Invoke {
        name: String,
        argv: Payload,
        reply_id: String,
        resource: Option<ResourceMap>,
    },
    /// Answer to an [`Body::Invoke`]
    Reply {
        reply_id: String,
        result: Option<Payload>,
        error: Option<String>,
        resource: Option<ResourceMap>,
    },
}

/// An RPC argument list or result, encrypted or in the clear
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Sealed(Vec<u8>),
    Plain(#[serde(with = "json_bytes")] Value),
}

impl Payload {
    /// Wrap a value, sealing it when a cipher is given
    pub fn wrap(value: &Value, cipher: Option<&PayloadCipher>) -> Result<Self> {
        match cipher {
            Some(cipher) => Ok(Self::Sealed(cipher.seal_value(value)?)),
            None => Ok(Self::Plain(value.clone())),
        }
    }

    /// Recover the value
    pub fn unwrap_with(self, cipher: &PayloadCipher) -> Result<Value> {
        match self {
            Self::Sealed(bytes) => Ok(cipher.open_value(&bytes)?),
            Self::Plain(value) => Ok(value),
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Sealed(_))
    }
}

/// Envelope discriminator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Json,
    Binary,
    Invoke,
    Reply,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
            Self::Invoke => "invoke",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Body {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Json { .. } => EnvelopeKind::Json,
            Self::Binary { .. } => EnvelopeKind::Binary,
            Self::Invoke { .. } => EnvelopeKind::Invoke,
            Self::Reply { .. } => EnvelopeKind::Reply,
        }
    }

    /// Attached resources, if any
    pub fn resource(&self) -> Option<&ResourceMap> {
        match self {
            Self::Json { resource, .. }
            | Self::Invoke { resource, .. }
            | Self::Reply { resource, .. } => resource.as_ref(),
            Self::Binary { .. } => None,
        }
    }
}

impl Envelope {
    pub fn new(id: impl Into<String>, timestamp: u64, body: Body) -> Self {
        Self {
            id: id.into(),
            timestamp,
            body,
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = vec![WIRE_VERSION];
        out.extend_from_slice(&postcard::to_allocvec(self)?);
        Ok(out)
    }

    /// Decode from wire bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&version, rest) = bytes.split_first().ok_or(Error::Empty)?;
        if version != WIRE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        Ok(postcard::from_bytes(rest)?)
    }
}

/// Serde adapter storing a JSON value as its encoded bytes
mod json_bytes {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        let bytes = serde_json::to_vec(value).map_err(S::Error::custom)?;
        bytes.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        serde_json::from_slice(&bytes).map_err(D::Error::custom)
    }
}
