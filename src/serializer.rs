//! Pluggable payload serialization.
//!
//! Connections carry opaque bytes; typed send/receive helpers go through a
//! [`PayloadSerializer`] chosen per session. The strategy is object safe so
//! it can live in [`SessionConfig`](crate::config::SessionConfig) behind an
//! `Arc`; typed values cross it as `serde_json::Value`.

use std::fmt::Debug;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Failure converting between typed values and payload bytes.
#[derive(Debug, Error)]
pub enum SerializerError {
    #[error("failed to serialize payload: {0}")]
    Encode(String),

    #[error("failed to deserialize payload: {0}")]
    Decode(String),
}

/// Strategy turning structured values into payload bytes and back.
pub trait PayloadSerializer: Send + Sync + Debug {
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, SerializerError>;

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value, SerializerError>;
}

impl dyn PayloadSerializer {
    /// Serialize any `Serialize` value.
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        let value = serde_json::to_value(value).map_err(|e| SerializerError::Encode(e.to_string()))?;
        self.to_bytes(&value)
    }

    /// Deserialize payload bytes into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        let value = self.from_bytes(bytes)?;
        serde_json::from_value(value).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

/// UTF-8 JSON payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>, SerializerError> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value, SerializerError> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}
