//! Pluggable JSON codec.
//!
//! The pipeline never calls `serde_json` for wire bodies directly; it goes
//! through a [`JsonCodec`] so callers can swap in a codec with different
//! number handling or size limits. Typed values cross the codec as
//! `serde_json::Value`.

use crate::error::{PeerError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Encodes and decodes JSON wire bodies.
pub trait JsonCodec: Send + Sync {
    /// Encode a JSON value to bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes to a JSON value.
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// [`JsonCodec`] backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeJsonCodec;

impl JsonCodec for SerdeJsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Serialize a typed value through a codec.
pub fn encode_typed<T: Serialize + ?Sized>(codec: &dyn JsonCodec, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    codec.encode(&value)
}

/// Deserialize a typed value through a codec.
pub fn decode_typed<T: DeserializeOwned>(codec: &dyn JsonCodec, bytes: &[u8]) -> Result<T> {
    let value = codec.decode(bytes)?;
    from_value(value)
}

/// Convert an already-decoded value into `T`.
pub fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| PeerError::Json {
        message: format!("Result does not match the requested type: {}", e),
        source: Some(e),
    })
}
