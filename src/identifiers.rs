//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing a client id with a handler id at
//! compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ClientId
// ============================================================================

/// Unique identifier of a [`Client`](crate::Client) instance.
///
/// Used as the key of a server's active client set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Generates a new random client ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// HandlerId
// ============================================================================

/// Global counter for handler registrations.
static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier returned by every `on_*` registration.
///
/// Pass it to the matching `off_*` method to unregister the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    /// Allocates the next handler ID.
    #[inline]
    #[must_use]
    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_unique() {
        assert_ne!(ClientId::generate(), ClientId::generate());
    }

    #[test]
    fn test_client_id_serializes_as_uuid() {
        let id = ClientId::generate();
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{}\"", id.as_uuid()));
    }

    #[test]
    fn test_handler_id_monotonic() {
        let first = HandlerId::next();
        let second = HandlerId::next();
        assert!(second > first);
        assert_eq!(second.to_string(), second.as_u64().to_string());
    }
}
