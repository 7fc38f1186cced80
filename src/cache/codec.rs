//! Value Codec
//!
//! Every value enters the tiers as a [`CacheValue`] envelope serialised to
//! JSON and then compressed. The envelope records which kind of payload the
//! caller stored, so a typed read can tell a string from a document from a
//! binary blob. Binary payloads travel as base64 text inside the JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::compression::{CompressionConfig, CompressionManager};
use crate::error::{Error, Result};

/// Value envelope stored in every tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum CacheValue {
    /// Plain text
    Text(String),
    /// Structured document
    Json(serde_json::Value),
    /// Opaque bytes
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
}

impl CacheValue {
    /// Serialise any document into a `Json` value
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(CacheValue::Json(serde_json::to_value(value)?))
    }

    /// Short name of the payload kind
    pub fn kind(&self) -> &'static str {
        match self {
            CacheValue::Text(_) => "text",
            CacheValue::Json(_) => "json",
            CacheValue::Binary(_) => "binary",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CacheValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            CacheValue::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Deserialise a `Json` value into `T`
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T> {
        match self {
            CacheValue::Json(doc) => Ok(serde_json::from_value(doc)?),
            other => Err(mismatch("json", &other)),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            CacheValue::Text(s) => Ok(s),
            other => Err(mismatch("text", &other)),
        }
    }

    pub fn into_binary(self) -> Result<Vec<u8>> {
        match self {
            CacheValue::Binary(b) => Ok(b),
            other => Err(mismatch("binary", &other)),
        }
    }
}

fn mismatch(wanted: &str, found: &CacheValue) -> Error {
    Error::Codec(format!("expected {wanted} value, found {}", found.kind()))
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::Text(s)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::Text(s.to_string())
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(doc: serde_json::Value) -> Self {
        CacheValue::Json(doc)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(b: Vec<u8>) -> Self {
        CacheValue::Binary(b)
    }
}

impl From<&[u8]> for CacheValue {
    fn from(b: &[u8]) -> Self {
        CacheValue::Binary(b.to_vec())
    }
}

impl From<Bytes> for CacheValue {
    fn from(b: Bytes) -> Self {
        CacheValue::Binary(b.to_vec())
    }
}

mod base64_bytes {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

/// Envelope → JSON → compressed frame, and back
#[derive(Default)]
pub struct ValueCodec {
    compression: CompressionManager,
}

impl ValueCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_compression(config: CompressionConfig) -> Self {
        Self {
            compression: CompressionManager::with_config(config),
        }
    }

    /// Encode a value for storage
    pub fn encode(&self, value: &CacheValue) -> Result<Bytes> {
        let json = serde_json::to_vec(value)?;
        Ok(self.compression.seal(&json))
    }

    /// Decode bytes read from a tier
    pub fn decode(&self, raw: &[u8]) -> Result<CacheValue> {
        let json = self
            .compression
            .open(raw)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(serde_json::from_slice(&json)?)
    }
}
