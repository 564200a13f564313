//! Transport drivers.
//!
//! A driver owns the raw transport and reports what happens on it through
//! the signal handles it is given. [`Client`](crate::Client) and
//! [`Server`](crate::Server) never touch sockets themselves.
//!
//! # Driver Contract
//!
//! ```text
//! Client ──initiate_connect──► Transport ──connected/error──► ClientSignals
//!        ──install_hooks─────►           ──data/error/closed─►
//!        ──initiate_send─────►
//!        ──initiate_disconnect►          ──closed───────────►
//!
//! Server ──create_listening_handle──► Acceptor ──accepted(raw)──► ServerSignals
//!        ──bind_and_accept──────────►          ──error/closed───►
//!        ──close_listening_handle───►
//! ```
//!
//! Drivers must never block the caller: completion is always reported
//! through the signals, usually from a spawned tokio task.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `tcp` | Stream socket client transport and acceptor |
//! | `websocket` | Message socket client transport and acceptor |
//! | `virtual_pair` | In-process paired transport with simulated latency |

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::runtime::Handle;

use crate::client::ClientSignals;
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, ListenOptions};
use crate::server::ServerSignals;

// ============================================================================
// Submodules
// ============================================================================

/// Stream socket transport and acceptor.
pub mod tcp;

/// In-process paired transport.
pub mod virtual_pair;

/// Message socket transport and acceptor.
pub mod websocket;

#[cfg(test)]
pub(crate) mod stub;

// ============================================================================
// Re-exports
// ============================================================================

pub use tcp::{TcpAcceptor, TcpTransport};
pub use virtual_pair::{VirtualClient, VirtualTransport, create_pair};
pub use websocket::{WsAcceptor, WsTransport};

// ============================================================================
// Traits
// ============================================================================

/// Client-side transport driver.
///
/// One instance backs exactly one [`Client`](crate::Client).
pub trait Transport: Send + Sync + 'static {
    /// Creates the raw handle and begins an outbound connection.
    ///
    /// Must eventually call [`ClientSignals::connected`] on success, or
    /// [`ClientSignals::error`] followed by [`ClientSignals::closed`] on
    /// failure.
    fn initiate_connect(&self, options: &ConnectOptions, signals: ClientSignals) -> Result<()>;

    /// Wires native data, error and close notifications to `signals`.
    fn install_hooks(&self, signals: ClientSignals) -> Result<()>;

    /// Writes bytes to the live transport.
    fn initiate_send(&self, data: Bytes) -> Result<()>;

    /// Begins graceful teardown; must eventually result in
    /// [`ClientSignals::closed`].
    fn initiate_disconnect(&self) -> Result<()>;
}

/// Listener-side transport driver.
///
/// One instance backs exactly one [`Server`](crate::Server).
pub trait Acceptor: Send + Sync + Sized + 'static {
    /// Raw accepted connection handed to [`ServerSignals::accepted`].
    type Raw: Send + 'static;

    /// Creates (but does not bind) the listening handle.
    ///
    /// Rejects options this driver cannot honor with [`Error::InvalidConfig`].
    fn create_listening_handle(&self, options: &ListenOptions) -> Result<()>;

    /// Binds and starts accepting; calls [`ServerSignals::accepted`] for
    /// every incoming connection.
    fn bind_and_accept(&self, options: &ListenOptions, signals: ServerSignals<Self>) -> Result<()>;

    /// Closes the listening handle; must eventually result in
    /// [`ServerSignals::closed`].
    fn close_listening_handle(&self) -> Result<()>;

    /// Returns the bound address once listening.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Wraps a raw accepted connection in its client transport.
///
/// The Rust rendition of a listener's client socket type.
pub type TransportFactory<R> = Arc<dyn Fn(R) -> Arc<dyn Transport> + Send + Sync>;

// ============================================================================
// Helpers
// ============================================================================

/// Returns the runtime drivers spawn their tasks on.
pub(crate) fn runtime() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| Error::connection(format!("transport requires a tokio runtime: {e}")))
}
