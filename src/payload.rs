//! Outbound payloads.
//!
//! Everything handed to [`Client::send`](crate::Client::send) is either bytes
//! or text. Text is encoded as UTF-8 before it reaches a transport.

// ============================================================================
// Imports
// ============================================================================

use bytes::Bytes;
use serde_json::Value;

use crate::error::{Error, Result};

// ============================================================================
// Payload
// ============================================================================

/// Data accepted by `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw bytes, sent as-is.
    Binary(Bytes),
    /// Text, sent as UTF-8.
    Text(String),
}

impl Payload {
    /// Converts the payload into the bytes a transport writes.
    #[inline]
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => Bytes::from(text),
        }
    }

    /// Returns the encoded length in bytes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
        }
    }

    /// Returns `true` if the payload is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Untyped values are accepted only as a string or an array of bytes.
impl TryFrom<Value> for Payload {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::String(text) => Ok(Self::Text(text)),
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(|| {
                            Error::invalid_payload("array elements must be bytes (0..=255)")
                        })
                })
                .collect::<Result<Vec<u8>>>()
                .map(Self::from),
            other => Err(Error::invalid_payload(format!(
                "data must be bytes or string, got {}",
                value_kind(&other)
            ))),
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// Tests
// ============================================================================
