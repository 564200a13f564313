//! sockwrap - Uniform connection and listener lifecycle over any transport.
//!
//! This library gives stream sockets, message sockets and an in-process
//! virtual transport one callback surface, so callers never care which
//! transport backs a given connection.
//!
//! # Architecture
//!
//! The crate splits every transport into two layers:
//!
//! - **Lifecycle (this crate)**: [`Client`] and [`Server`] state machines
//!   with buffered event dispatch through [`EventHub`]
//! - **Driver**: a [`Transport`] or [`Acceptor`] that owns the raw socket
//!   and reports what happens on it through signal handles
//!
//! Key design principles:
//!
//! - Each [`Client`] owns exactly one transport, never replaced
//! - `data` that arrives before a handler exists is buffered, then replayed
//!   once to the first data handler
//! - Drivers never block the caller; completion arrives as events
//! - A [`Server`] tracks its clients and untracks each on its own
//!   `disconnect` event
//!
//! # Quick Start
//!
//! ```no_run
//! use sockwrap::{Client, ConnectOptions, ListenOptions, Result, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Echo server on an ephemeral port
//!     let server = Server::tcp(ListenOptions::new(0).with_host("127.0.0.1"))?;
//!     server.on_connection(|client| {
//!         let echo = client.clone();
//!         client.on_data(move |data| {
//!             let _ = echo.send(data.clone());
//!         });
//!     });
//!     server.listen()?;
//!
//!     let port = server.local_addr().map_or(0, |addr| addr.port());
//!     let client = Client::tcp(ConnectOptions::new(port).with_host("127.0.0.1"))?;
//!     client.on_data(|data| println!("echo: {data:?}"));
//!     client.connect()?;
//!     client.send("hello")?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | Connection lifecycle: [`Client`], [`ClientSignals`] |
//! | [`server`] | Listener lifecycle: [`Server`], [`ServerSignals`] |
//! | [`event`] | Named-event registry with buffering |
//! | [`options`] | Connect and listen configuration |
//! | [`payload`] | Outbound bytes-or-text payloads |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`transport`] | Driver traits and the bundled drivers |

// ============================================================================
// Modules
// ============================================================================

/// Connection lifecycle.
///
/// [`Client`] wraps one outbound or accepted connection.
pub mod client;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Named-event registration and dispatch.
pub mod event;

/// Type-safe identifiers for clients and handlers.
pub mod identifiers;

/// Connect and listen configuration.
pub mod options;

/// Outbound payloads.
pub mod payload;

/// Listener lifecycle.
///
/// [`Server`] owns a listening handle and the clients accepted on it.
pub mod server;

/// Transport drivers.
///
/// [`Transport`] and [`Acceptor`] traits plus the stream socket, message
/// socket and virtual pair drivers.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Lifecycle types
pub use client::{Client, ClientEvent, ClientEventKind, ClientSignals, ClientState};
pub use server::{Server, ServerEvent, ServerEventKind, ServerSignals};

// Error types
pub use error::{Error, Result};

// Event types
pub use event::{Event, EventHub, Handler};

// Identifier types
pub use identifiers::{ClientId, HandlerId};

// Configuration types
pub use options::{ConnectOptions, ListenOptions, Pem};

// Payload types
pub use payload::Payload;

// Transport types
pub use transport::{
    Acceptor, TcpAcceptor, TcpTransport, Transport, TransportFactory, VirtualClient,
    VirtualTransport, WsAcceptor, WsTransport, create_pair,
};
