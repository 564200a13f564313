//! Listener lifecycle.
//!
//! A [`Server`] owns one listening handle (through its [`Acceptor`]) and the
//! set of [`Client`]s accepted on it.
//!
//! # Client Set
//!
//! Accepted clients enter the set when the acceptor reports them and leave
//! it when their own `disconnect` event fires. Nothing else mutates the set.
//!
//! ```text
//! accepted(raw) ──► factory(raw) ──► Client (Bound) ──► set.insert
//!                                        │
//!                             disconnect event ──► set.remove
//! ```
//!
//! # Events
//!
//! | Event | Payload |
//! |-------|---------|
//! | `connection` | the accepted [`Client`] |
//! | `error` | message |
//! | `close` | none |
//!
//! None of these buffer: a `connection` raised before a handler exists is
//! missed for good.
//!
//! # Example
//!
//! ```no_run
//! use sockwrap::{ListenOptions, Server};
//!
//! # async fn example() -> sockwrap::Result<()> {
//! let server = Server::tcp(ListenOptions::new(9000))?;
//! server.on_connection(|client| {
//!     let echo = client.clone();
//!     client.on_data(move |data| {
//!         let _ = echo.send(data.clone());
//!     });
//! });
//! server.listen()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::event::{Event, EventHub};
use crate::identifiers::{ClientId, HandlerId};
use crate::options::ListenOptions;
use crate::transport::{
    Acceptor, TcpAcceptor, TcpTransport, Transport, TransportFactory, WsAcceptor, WsTransport,
};

// ============================================================================
// ServerEvent
// ============================================================================

/// Event raised by a [`Server`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted.
    Connection(Client),
    /// Listener-level error.
    Error(String),
    /// The listening handle closed.
    Close,
}

/// Names of the events a [`Server`] raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    /// `connection`
    Connection,
    /// `error`
    Error,
    /// `close`
    Close,
}

impl Event for ServerEvent {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::Connection(_) => ServerEventKind::Connection,
            Self::Error(_) => ServerEventKind::Error,
            Self::Close => ServerEventKind::Close,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for a server.
pub(crate) struct ServerInner<A: Acceptor> {
    /// Listen configuration.
    options: ListenOptions,
    /// Listener driver.
    acceptor: A,
    /// Whether the listening handle exists and has not been closed.
    handle_open: AtomicBool,
    /// Wraps accepted raw connections in client transports.
    factory: RwLock<Option<TransportFactory<A::Raw>>>,
    /// Currently tracked clients.
    clients: Mutex<FxHashMap<ClientId, Client>>,
    /// Event registry.
    events: EventHub<ServerEvent>,
}

// ============================================================================
// Server
// ============================================================================

/// Listener that tracks the clients it accepted.
///
/// `Server` is a cheap handle; clones refer to the same listener.
pub struct Server<A: Acceptor> {
    /// Shared inner state.
    inner: Arc<ServerInner<A>>,
}

impl<A: Acceptor> Clone for Server<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: Acceptor> fmt::Debug for Server<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("port", &self.inner.options.port)
            .field("clients", &self.client_count())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Server - Constructors
// ============================================================================

impl<A: Acceptor> Server<A> {
    /// Validates `options` and creates the listening handle.
    ///
    /// No transport factory is set; see [`Server::set_transport_factory`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `options` does not validate or the
    ///   acceptor cannot honor them
    /// - The acceptor's error if the handle cannot be created
    pub fn new(options: ListenOptions, acceptor: A) -> Result<Self> {
        options.validate()?;
        acceptor.create_listening_handle(&options)?;

        debug!(
            host = options.host_or_default(),
            port = options.port,
            secure = options.is_secure(),
            "Listening handle created"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                options,
                acceptor,
                handle_open: AtomicBool::new(true),
                factory: RwLock::new(None),
                clients: Mutex::new(FxHashMap::default()),
                events: EventHub::new(),
            }),
        })
    }

    /// Sets how accepted raw connections become client transports.
    pub fn set_transport_factory<F>(&self, factory: F)
    where
        F: Fn(A::Raw) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        *self.inner.factory.write() = Some(Arc::new(factory));
    }

    /// Builder form of [`Server::set_transport_factory`].
    #[must_use]
    pub fn with_transport_factory<F>(self, factory: F) -> Self
    where
        F: Fn(A::Raw) -> Arc<dyn Transport> + Send + Sync + 'static,
    {
        self.set_transport_factory(factory);
        self
    }

    /// Returns the driver-facing signal handle for this server.
    pub(crate) fn signals(&self) -> ServerSignals<A> {
        ServerSignals {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl Server<TcpAcceptor> {
    /// Creates a stream socket listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid options or when
    /// certificate material is supplied.
    pub fn tcp(options: ListenOptions) -> Result<Self> {
        let server = Self::new(options, TcpAcceptor::new())?;
        server.set_transport_factory(|stream| -> Arc<dyn Transport> {
            Arc::new(TcpTransport::from_stream(stream))
        });
        Ok(server)
    }
}

impl Server<WsAcceptor> {
    /// Creates a message socket listener.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid options or when
    /// certificate material is supplied.
    pub fn websocket(options: ListenOptions) -> Result<Self> {
        let server = Self::new(options, WsAcceptor::new())?;
        server.set_transport_factory(|stream| -> Arc<dyn Transport> {
            Arc::new(WsTransport::from_stream(stream))
        });
        Ok(server)
    }
}

// ============================================================================
// Server - Accessors
// ============================================================================

impl<A: Acceptor> Server<A> {
    /// Returns the listen options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &ListenOptions {
        &self.inner.options
    }

    /// Returns the listener driver.
    #[inline]
    #[must_use]
    pub fn acceptor(&self) -> &A {
        &self.inner.acceptor
    }

    /// Returns `true` if certificate material makes this listener secure.
    #[inline]
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.inner.options.is_secure()
    }

    /// Returns `true` until [`Server::close`] runs.
    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inner.handle_open.load(Ordering::Acquire)
    }

    /// Returns the bound address once listening.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.acceptor.local_addr()
    }

    /// Returns a snapshot of the tracked clients.
    #[must_use]
    pub fn clients(&self) -> Vec<Client> {
        self.inner.clients.lock().values().cloned().collect()
    }

    /// Returns the number of tracked clients.
    #[inline]
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }
}

// ============================================================================
// Server - Lifecycle
// ============================================================================

impl<A: Acceptor> Server<A> {
    /// Binds and starts accepting.
    ///
    /// Accepted connections arrive through the `connection` event.
    ///
    /// # Errors
    ///
    /// - [`Error::Closed`] after [`Server::close`]
    /// - The acceptor's error if accepting cannot start
    pub fn listen(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }

        info!(
            host = self.inner.options.host_or_default(),
            port = self.inner.options.port,
            ipv6_only = self.inner.options.ipv6_only,
            "Listening"
        );

        self.inner
            .acceptor
            .bind_and_accept(&self.inner.options, self.signals())
    }

    /// Closes the listening handle and disconnects every tracked client.
    ///
    /// No-op if already closed. The set is empty afterwards even for
    /// clients that were already disconnected.
    ///
    /// # Errors
    ///
    /// Returns the acceptor's error if the handle cannot be closed; clients
    /// are disconnected regardless.
    pub fn close(&self) -> Result<()> {
        if !self.inner.handle_open.swap(false, Ordering::AcqRel) {
            trace!("Listener already closed");
            return Ok(());
        }

        let closed = self.inner.acceptor.close_listening_handle();
        if let Err(ref e) = closed {
            warn!(error = %e, "Closing listening handle failed");
        }

        let clients: Vec<Client> = self
            .inner
            .clients
            .lock()
            .drain()
            .map(|(_, client)| client)
            .collect();

        debug!(count = clients.len(), "Disconnecting tracked clients");

        for client in &clients {
            client.disconnect();
        }

        closed
    }
}

// ============================================================================
// Server - Events
// ============================================================================

impl<A: Acceptor> Server<A> {
    /// Registers a `connection` handler.
    pub fn on_connection<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.inner.events.register(
            ServerEventKind::Connection,
            Arc::new(move |event: &ServerEvent| {
                if let ServerEvent::Connection(client) = event {
                    handler(client);
                }
            }),
        )
    }

    /// Unregisters a `connection` handler.
    pub fn off_connection(&self, id: HandlerId) -> bool {
        self.inner
            .events
            .unregister(ServerEventKind::Connection, id)
    }

    /// Registers an `error` handler.
    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.events.register(
            ServerEventKind::Error,
            Arc::new(move |event: &ServerEvent| {
                if let ServerEvent::Error(message) = event {
                    handler(message);
                }
            }),
        )
    }

    /// Unregisters an `error` handler.
    pub fn off_error(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ServerEventKind::Error, id)
    }

    /// Registers a `close` handler.
    pub fn on_close<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.register(
            ServerEventKind::Close,
            Arc::new(move |event: &ServerEvent| {
                if let ServerEvent::Close = event {
                    handler();
                }
            }),
        )
    }

    /// Unregisters a `close` handler.
    pub fn off_close(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ServerEventKind::Close, id)
    }
}

// ============================================================================
// ServerSignals
// ============================================================================

/// Driver-facing handle that feeds listener events into a [`Server`].
///
/// Holds a weak reference: signals for a dropped server are ignored.
pub struct ServerSignals<A: Acceptor> {
    inner: Weak<ServerInner<A>>,
}

impl<A: Acceptor> Clone for ServerSignals<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<A: Acceptor> fmt::Debug for ServerSignals<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSignals")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl<A: Acceptor> ServerSignals<A> {
    /// Returns `true` while the server still exists.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Wraps an accepted raw connection in a tracked [`Client`].
    ///
    /// # Errors
    ///
    /// - [`Error::MisconfiguredListener`] if no transport factory is set;
    ///   nothing is tracked
    /// - [`Error::Closed`] if the server was closed or no longer exists;
    ///   the connection is dropped
    /// - The driver's error if hooks cannot be installed; the client is
    ///   untracked again
    pub fn accepted(&self, raw: A::Raw) -> Result<Client> {
        let inner = self.inner.upgrade().ok_or(Error::Closed)?;

        let Some(factory) = inner.factory.read().clone() else {
            warn!(port = inner.options.port, "Accepted connection without a transport factory");
            return Err(Error::MisconfiguredListener);
        };

        let client = Client::bound(factory(raw));
        let id = client.id();

        {
            // `close()` flips the flag before draining under this lock.
            let mut clients = inner.clients.lock();
            if !inner.handle_open.load(Ordering::Acquire) {
                debug!(client_id = %id, "Connection accepted after close, dropping");
                return Err(Error::Closed);
            }
            clients.insert(id, client.clone());
        }

        let server = Weak::clone(&self.inner);
        client.on_disconnect(move |closed| {
            if let Some(server) = server.upgrade()
                && server.clients.lock().remove(&closed.id()).is_some()
            {
                trace!(client_id = %closed.id(), "Client untracked");
            }
        });

        if let Err(e) = client.install_hooks() {
            inner.clients.lock().remove(&id);
            return Err(e);
        }

        debug!(client_id = %id, "Connection accepted");
        inner
            .events
            .emit(ServerEvent::Connection(client.clone()), false);

        Ok(client)
    }

    /// Reports a listener-level error.
    pub fn error(&self, message: impl Into<String>) {
        if let Some(inner) = self.inner.upgrade() {
            let message = message.into();
            debug!(error = %message, "Listener error");
            inner.events.emit(ServerEvent::Error(message), false);
        }
    }

    /// Reports that the listening handle closed.
    pub fn closed(&self) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(port = inner.options.port, "Listener closed");
            inner.events.emit(ServerEvent::Close, false);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::assert_ok;

    use crate::client::ClientState;
    use crate::transport::stub::{StubAcceptor, StubTransport};

    fn stub_server() -> Server<StubAcceptor> {
        Server::new(ListenOptions::new(4000), StubAcceptor::default()).expect("valid options")
    }

    fn with_factory(server: &Server<StubAcceptor>) {
        server.set_transport_factory(|transport: Arc<StubTransport>| -> Arc<dyn Transport> {
            transport
        });
    }

    #[test]
    fn test_new_creates_listening_handle() {
        let server = stub_server();
        assert_eq!(server.acceptor().created(), 1);
        assert!(server.is_open());
        assert!(!server.is_secure());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_new_rejects_key_without_cert() {
        let mut options = ListenOptions::new(4000);
        options.key = Some("key".into());
        let err = Server::new(options, StubAcceptor::default()).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_cert_makes_listener_secure() {
        let options = ListenOptions::new(4000).with_identity("cert", "key");
        let server = Server::new(options, StubAcceptor::default()).expect("valid options");
        assert!(server.is_secure());
    }

    #[test]
    fn test_tcp_rejects_secure() {
        let options = ListenOptions::new(0).with_identity("cert", "key");
        assert!(Server::tcp(options).unwrap_err().is_config_error());
    }

    #[test]
    fn test_listen_binds() {
        let server = stub_server();
        assert_ok!(server.listen());
        assert_eq!(server.acceptor().bound(), 1);
    }

    #[test]
    fn test_accept_without_factory_is_misconfigured() {
        let server = stub_server();
        let err = server
            .signals()
            .accepted(Arc::new(StubTransport::default()))
            .unwrap_err();
        assert!(matches!(err, Error::MisconfiguredListener));
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_accept_tracks_and_emits() {
        let server = stub_server();
        with_factory(&server);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        server.on_connection(move |client| sink.lock().push(client.id()));

        let transport = Arc::new(StubTransport::default());
        let client = server
            .signals()
            .accepted(Arc::clone(&transport))
            .expect("accepted");

        assert_eq!(client.state(), ClientState::Bound);
        assert_eq!(transport.hook_count(), 1);
        assert_eq!(server.client_count(), 1);
        assert_eq!(*seen.lock(), vec![client.id()]);
    }

    #[test]
    fn test_connection_not_buffered() {
        let server = stub_server();
        with_factory(&server);
        server
            .signals()
            .accepted(Arc::new(StubTransport::default()))
            .expect("accepted");

        let count = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&count);
        server.on_connection(move |_| *sink.lock() += 1);
        assert_eq!(*count.lock(), 0);
    }

    #[test]
    fn test_accepted_data_buffers_for_late_handler() {
        let server = stub_server();
        with_factory(&server);
        let transport = Arc::new(StubTransport::default());
        let client = server
            .signals()
            .accepted(Arc::clone(&transport))
            .expect("accepted");

        transport.deliver(b"early");

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        client.on_data(move |data| sink.lock().push(data.clone()));
        assert_eq!(received.lock().len(), 1);
    }

    #[test]
    fn test_client_disconnect_untracks() {
        let server = stub_server();
        with_factory(&server);
        let transport = Arc::new(StubTransport::default());
        server
            .signals()
            .accepted(Arc::clone(&transport))
            .expect("accepted");

        transport.close();
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_hook_failure_untracks() {
        let server = stub_server();
        with_factory(&server);
        let transport = Arc::new(StubTransport::default());
        transport.fail_hooks();

        assert!(server.signals().accepted(transport).is_err());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_close_disconnects_each_client_once() {
        let server = stub_server();
        with_factory(&server);

        let transports: Vec<Arc<StubTransport>> =
            (0..3).map(|_| Arc::new(StubTransport::default())).collect();
        for transport in &transports {
            server
                .signals()
                .accepted(Arc::clone(transport))
                .expect("accepted");
        }

        // One client already closed before the listener goes down.
        transports[0].close();

        assert_ok!(server.close());
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.acceptor().closed(), 1);
        assert_eq!(transports[0].disconnect_count(), 0);
        assert_eq!(transports[1].disconnect_count(), 1);
        assert_eq!(transports[2].disconnect_count(), 1);
    }

    #[test]
    fn test_close_clears_set_when_clients_already_closed_driver_side() {
        let server = stub_server();
        with_factory(&server);
        let transport = Arc::new(StubTransport::default());
        let client = server
            .signals()
            .accepted(Arc::clone(&transport))
            .expect("accepted");

        assert_ok!(server.close());
        transport.close();

        assert!(client.is_disconnected());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_close_reports_disconnect_for_untracked_clients() {
        let server = stub_server();
        with_factory(&server);

        let disconnects = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&disconnects);
        server.on_connection(move |client| {
            let sink = Arc::clone(&sink);
            client.on_disconnect(move |_| *sink.lock() += 1);
        });

        let transport = Arc::new(StubTransport::default());
        let accepted = server.signals().accepted(Arc::clone(&transport));
        drop(accepted);

        assert_ok!(server.close());
        assert_eq!(transport.disconnect_count(), 1);

        transport.close();
        assert_eq!(*disconnects.lock(), 1);
    }

    #[test]
    fn test_accept_after_close_is_rejected() {
        let server = stub_server();
        with_factory(&server);
        let connections = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&connections);
        server.on_connection(move |_| *sink.lock() += 1);

        assert_ok!(server.close());

        let transport = Arc::new(StubTransport::default());
        let err = server
            .signals()
            .accepted(Arc::clone(&transport))
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
        assert_eq!(server.client_count(), 0);
        assert_eq!(transport.hook_count(), 0);
        assert_eq!(*connections.lock(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let server = stub_server();
        assert_ok!(server.close());
        assert_ok!(server.close());
        assert_eq!(server.acceptor().closed(), 1);
        assert!(!server.is_open());
        assert!(matches!(server.listen(), Err(Error::Closed)));
    }

    #[test]
    fn test_error_and_close_events() {
        let server = stub_server();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let closes = Arc::new(Mutex::new(0));

        let sink = Arc::clone(&errors);
        server.on_error(move |message| sink.lock().push(message.to_string()));
        let sink = Arc::clone(&closes);
        let close_id = server.on_close(move || *sink.lock() += 1);

        let signals = server.signals();
        signals.error("EADDRINUSE");
        signals.closed();
        assert!(server.off_close(close_id));
        signals.closed();

        assert_eq!(*errors.lock(), vec!["EADDRINUSE".to_string()]);
        assert_eq!(*closes.lock(), 1);
    }

    #[test]
    fn test_signals_after_drop() {
        let server = stub_server();
        with_factory(&server);
        let signals = server.signals();
        drop(server);

        assert!(!signals.is_alive());
        let err = signals
            .accepted(Arc::new(StubTransport::default()))
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
