//! Error types for sockwrap.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use sockwrap::{Client, ConnectOptions, Result};
//!
//! fn example(client: &Client) -> Result<()> {
//!     client.send("hello")?;
//!     client.disconnect();
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::InvalidConfig`], [`Error::MisconfiguredListener`] |
//! | Misuse | [`Error::AlreadyBound`], [`Error::NotConnected`], [`Error::Closed`], [`Error::InvalidPayload`] |
//! | Transport | [`Error::Connection`], [`Error::Io`], [`Error::WebSocket`] |
//! | External | [`Error::Json`] |
//!
//! Transport failures that happen after a connection is up are never
//! returned from these calls; they arrive through the `error` event.

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid connect or listen configuration.
    ///
    /// Raised at construction time. Never recoverable in place.
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the offending option.
        message: String,
    },

    /// A listener accepted a transport but has no transport factory set.
    #[error("Listener has no transport factory for accepted connections")]
    MisconfiguredListener,

    // ========================================================================
    // Misuse Errors
    // ========================================================================
    /// `connect()` called on a client that already has a transport.
    #[error("Reconnect not allowed: transport already bound")]
    AlreadyBound,

    /// Payload is neither bytes nor text.
    #[error("Invalid payload: {message}")]
    InvalidPayload {
        /// Description of the rejected payload.
        message: String,
    },

    /// `send()` called before any transport was attached.
    #[error("Not connected")]
    NotConnected,

    /// `send()` called after the client disconnected.
    #[error("Socket is closed, cannot send")]
    Closed,

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Transport driver failure.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the driver failure.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    // ========================================================================
    // External Errors
    // ========================================================================
    /// JSON parse error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates an invalid configuration error.
    #[inline]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates an invalid payload error.
    #[inline]
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a configuration error.
    #[inline]
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::MisconfiguredListener | Self::Json(_)
        )
    }

    /// Returns `true` if the caller used the API out of order.
    #[inline]
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::AlreadyBound | Self::NotConnected | Self::Closed | Self::InvalidPayload { .. }
        )
    }

    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Io(_) | Self::WebSocket(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
