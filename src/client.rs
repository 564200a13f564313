//! Connection lifecycle.
//!
//! A [`Client`] wraps exactly one connection, either outbound (created
//! from [`ConnectOptions`] and connected later) or accepted by a
//! [`Server`](crate::Server) (created around an already live transport).
//!
//! # States
//!
//! ```text
//! Unbound ──connect()──► Bound ──closed signal──► Disconnected
//!                          ▲
//! accepted transport ──────┘
//! ```
//!
//! A transport, once attached, is never replaced. `disconnect()` only asks
//! the driver to tear down; the state changes when the driver reports the
//! close. A client with a teardown in flight stays alive until then, even
//! if every handle to it is dropped.
//!
//! # Events
//!
//! | Event | Payload | Buffered |
//! |-------|---------|----------|
//! | `connect` | none | no |
//! | `data` | [`Bytes`] | yes, while no data handler exists (see [`Client::set_buffer_data`]) |
//! | `error` | message | no |
//! | `disconnect` | the [`Client`] | no |
//!
//! Every handler is released once `disconnect` has been dispatched, so a
//! handler capturing its own client does not outlive the connection.
//!
//! # Example
//!
//! ```no_run
//! use sockwrap::{Client, ConnectOptions};
//!
//! # async fn example() -> sockwrap::Result<()> {
//! let client = Client::tcp(ConnectOptions::new(9000).with_host("127.0.0.1"))?;
//! client.on_connect(|| println!("connected"));
//! client.on_data(|data| println!("received {} bytes", data.len()));
//! client.connect()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::event::{Event, EventHub};
use crate::identifiers::{ClientId, HandlerId};
use crate::options::ConnectOptions;
use crate::payload::Payload;
use crate::transport::{TcpTransport, Transport, WsTransport};

// ============================================================================
// ClientState
// ============================================================================

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No transport yet (outbound client before `connect()`).
    Unbound,
    /// Transport attached and hooks installed.
    Bound,
    /// The driver reported the close. Terminal.
    Disconnected,
}

// ============================================================================
// ClientEvent
// ============================================================================

/// Event raised by a [`Client`].
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Outbound connection established.
    Connect,
    /// Bytes received.
    Data(Bytes),
    /// Transport-level error.
    Error(String),
    /// Connection closed; carries the client that closed.
    Disconnect(Client),
}

/// Names of the events a [`Client`] raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    /// `connect`
    Connect,
    /// `data`
    Data,
    /// `error`
    Error,
    /// `disconnect`
    Disconnect,
}

impl Event for ClientEvent {
    type Kind = ClientEventKind;

    fn kind(&self) -> ClientEventKind {
        match self {
            Self::Connect => ClientEventKind::Connect,
            Self::Data(_) => ClientEventKind::Data,
            Self::Error(_) => ClientEventKind::Error,
            Self::Disconnect(_) => ClientEventKind::Disconnect,
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Internal shared state for a client.
pub(crate) struct ClientInner {
    /// Unique identifier.
    id: ClientId,
    /// Connect configuration; `None` for accepted connections.
    options: Option<ConnectOptions>,
    /// Transport driver, exclusively owned.
    transport: Arc<dyn Transport>,
    /// Lifecycle state.
    state: Mutex<ClientState>,
    /// Set between a `disconnect()` request and the driver's close.
    disconnect_requested: AtomicBool,
    /// Self-reference held while a requested teardown is in flight.
    closing: Mutex<Option<Client>>,
    /// Buffer `data` events while no data handler exists.
    buffer_data: AtomicBool,
    /// Event registry.
    events: EventHub<ClientEvent>,
    /// Arbitrary metadata attached by the user.
    user_data: Mutex<FxHashMap<String, Value>>,
}

// ============================================================================
// Client
// ============================================================================

/// One logical connection over any [`Transport`].
///
/// `Client` is a cheap handle; clones refer to the same connection.
#[derive(Clone)]
pub struct Client {
    /// Shared inner state.
    pub(crate) inner: Arc<ClientInner>,
}

// ============================================================================
// Client - Display
// ============================================================================

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PartialEq for Client {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Client {}

// ============================================================================
// Client - Constructors
// ============================================================================

impl Client {
    /// Creates an unbound outbound client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `options` does not validate.
    pub fn new(options: ConnectOptions, transport: Arc<dyn Transport>) -> Result<Self> {
        options.validate()?;
        Ok(Self::build(Some(options), transport, ClientState::Unbound))
    }

    /// Creates an outbound client over a stream socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid options or when a
    /// secure connection is requested.
    pub fn tcp(options: ConnectOptions) -> Result<Self> {
        reject_secure(&options, "TCP")?;
        Self::new(options, Arc::new(TcpTransport::new()))
    }

    /// Creates an outbound client over a message socket.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for invalid options or when a
    /// secure connection is requested.
    pub fn websocket(options: ConnectOptions) -> Result<Self> {
        reject_secure(&options, "WebSocket")?;
        Self::new(options, Arc::new(WsTransport::new()))
    }

    /// Wraps an already live transport (accepted connection).
    ///
    /// The client starts `Bound` with hooks installed. No configuration
    /// is validated.
    ///
    /// # Errors
    ///
    /// Returns the driver's error if hooks cannot be installed.
    pub fn accepted(transport: Arc<dyn Transport>) -> Result<Self> {
        let client = Self::bound(transport);
        client.install_hooks()?;
        Ok(client)
    }

    /// Creates a bound client without installing hooks yet.
    pub(crate) fn bound(transport: Arc<dyn Transport>) -> Self {
        Self::build(None, transport, ClientState::Bound)
    }

    fn build(
        options: Option<ConnectOptions>,
        transport: Arc<dyn Transport>,
        state: ClientState,
    ) -> Self {
        let id = ClientId::generate();
        debug!(client_id = %id, ?state, "Client created");

        Self {
            inner: Arc::new(ClientInner {
                id,
                options,
                transport,
                state: Mutex::new(state),
                disconnect_requested: AtomicBool::new(false),
                closing: Mutex::new(None),
                buffer_data: AtomicBool::new(true),
                events: EventHub::new(),
                user_data: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Hands the driver this client's signals.
    pub(crate) fn install_hooks(&self) -> Result<()> {
        trace!(client_id = %self.inner.id, "Installing transport hooks");
        self.inner.transport.install_hooks(self.signals())
    }
}

// ============================================================================
// Client - Accessors
// ============================================================================

impl Client {
    /// Returns the client ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Returns the connect options; `None` for accepted connections.
    #[inline]
    #[must_use]
    pub fn options(&self) -> Option<&ConnectOptions> {
        self.inner.options.as_ref()
    }

    /// Returns the current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.lock()
    }

    /// Returns `true` once the driver reported the close.
    #[inline]
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.state() == ClientState::Disconnected
    }

    /// Returns whether `data` events are buffered while unhandled.
    #[inline]
    #[must_use]
    pub fn buffers_data(&self) -> bool {
        self.inner.buffer_data.load(Ordering::Acquire)
    }

    /// Enables or disables buffering of unhandled `data` events.
    ///
    /// Enabled by default. Already buffered payloads are kept.
    pub fn set_buffer_data(&self, enabled: bool) {
        self.inner.buffer_data.store(enabled, Ordering::Release);
    }

    /// Returns the number of `data` payloads waiting for a handler.
    #[must_use]
    pub fn buffered_data_count(&self) -> usize {
        self.inner.events.buffered_count(ClientEventKind::Data)
    }

    /// Returns the driver-facing signal handle for this client.
    pub(crate) fn signals(&self) -> ClientSignals {
        ClientSignals {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Queues received bytes without dispatching them.
    ///
    /// Returns `true` when the caller must follow up with
    /// [`Client::dispatch_events`].
    #[must_use]
    pub(crate) fn post_data(&self, data: Bytes) -> bool {
        self.inner
            .events
            .post(ClientEvent::Data(data), self.buffers_data())
    }

    /// Dispatches queued events.
    pub(crate) fn dispatch_events(&self) {
        self.inner.events.drain();
    }
}

// ============================================================================
// Client - Lifecycle
// ============================================================================

impl Client {
    /// Starts the outbound connection.
    ///
    /// Completion is reported through the `connect` or `error` event.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyBound`] if a transport is already attached
    /// - The driver's error if the connection cannot be initiated; the
    ///   client is unbound again
    /// - The driver's error if hooks cannot be installed; the connection is
    ///   torn down and the client is disconnected
    pub fn connect(&self) -> Result<()> {
        let options = {
            let mut state = self.inner.state.lock();
            let options = match (*state, self.inner.options.as_ref()) {
                (ClientState::Unbound, Some(options)) => options,
                _ => return Err(Error::AlreadyBound),
            };
            *state = ClientState::Bound;
            options
        };

        debug!(
            client_id = %self.inner.id,
            host = options.host_or_default(),
            port = options.port,
            "Initiating connection"
        );

        if let Err(e) = self.inner.transport.initiate_connect(options, self.signals()) {
            *self.inner.state.lock() = ClientState::Unbound;
            return Err(e);
        }

        if let Err(e) = self.install_hooks() {
            warn!(client_id = %self.inner.id, error = %e, "Installing hooks failed");
            if let Err(teardown) = self.inner.transport.initiate_disconnect() {
                debug!(client_id = %self.inner.id, error = %teardown, "Teardown failed");
            }
            self.signals().closed();
            return Err(e);
        }

        Ok(())
    }

    /// Sends bytes or text.
    ///
    /// Text is sent as UTF-8. Nothing is queued or retried here.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] if no transport is attached
    /// - [`Error::Closed`] if the client is disconnected
    /// - The driver's error if it refuses the write
    pub fn send(&self, data: impl Into<Payload>) -> Result<()> {
        let data = data.into().into_bytes();

        match self.state() {
            ClientState::Unbound => return Err(Error::NotConnected),
            ClientState::Disconnected => return Err(Error::Closed),
            ClientState::Bound => {}
        }

        trace!(client_id = %self.inner.id, len = data.len(), "Sending");
        self.inner.transport.initiate_send(data)
    }

    /// Sends an untyped value, which must be a string or a byte array.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPayload`] for any other value
    /// - Otherwise as [`Client::send`]
    pub fn send_value(&self, value: Value) -> Result<()> {
        let payload = Payload::try_from(value)?;
        self.send(payload)
    }

    /// Requests teardown.
    ///
    /// No-op when unbound, disconnected, or already disconnecting. The
    /// `disconnect` event fires once the driver reports the close.
    pub fn disconnect(&self) {
        if self.state() != ClientState::Bound {
            return;
        }

        if self.inner.disconnect_requested.swap(true, Ordering::AcqRel) {
            trace!(client_id = %self.inner.id, "Disconnect already requested");
            return;
        }

        debug!(client_id = %self.inner.id, "Disconnect requested");

        // Released by the close signal; drivers only hold weak signals.
        *self.inner.closing.lock() = Some(self.clone());

        if let Err(e) = self.inner.transport.initiate_disconnect() {
            warn!(client_id = %self.inner.id, error = %e, "Disconnect failed");
            self.inner.closing.lock().take();
            self.inner.disconnect_requested.store(false, Ordering::Release);
            self.inner
                .events
                .emit(ClientEvent::Error(e.to_string()), false);
        }
    }
}

// ============================================================================
// Client - Events
// ============================================================================

impl Client {
    /// Registers a `connect` handler.
    pub fn on_connect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.events.register(
            ClientEventKind::Connect,
            Arc::new(move |event: &ClientEvent| {
                if let ClientEvent::Connect = event {
                    handler();
                }
            }),
        )
    }

    /// Unregisters a `connect` handler.
    pub fn off_connect(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ClientEventKind::Connect, id)
    }

    /// Registers a `data` handler.
    ///
    /// The first data handler receives every buffered payload first.
    pub fn on_data<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Bytes) + Send + Sync + 'static,
    {
        self.inner.events.register(
            ClientEventKind::Data,
            Arc::new(move |event: &ClientEvent| {
                if let ClientEvent::Data(data) = event {
                    handler(data);
                }
            }),
        )
    }

    /// Unregisters a `data` handler.
    pub fn off_data(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ClientEventKind::Data, id)
    }

    /// Registers an `error` handler.
    pub fn on_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.events.register(
            ClientEventKind::Error,
            Arc::new(move |event: &ClientEvent| {
                if let ClientEvent::Error(message) = event {
                    handler(message);
                }
            }),
        )
    }

    /// Unregisters an `error` handler.
    pub fn off_error(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ClientEventKind::Error, id)
    }

    /// Registers a `disconnect` handler.
    pub fn on_disconnect<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Client) + Send + Sync + 'static,
    {
        self.inner.events.register(
            ClientEventKind::Disconnect,
            Arc::new(move |event: &ClientEvent| {
                if let ClientEvent::Disconnect(client) = event {
                    handler(client);
                }
            }),
        )
    }

    /// Unregisters a `disconnect` handler.
    pub fn off_disconnect(&self, id: HandlerId) -> bool {
        self.inner.events.unregister(ClientEventKind::Disconnect, id)
    }
}

// ============================================================================
// Client - User Data
// ============================================================================

impl Client {
    /// Attaches a metadata value under `key`, returning the previous one.
    pub fn set_user_data(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.inner.user_data.lock().insert(key.into(), value)
    }

    /// Returns a copy of the metadata value under `key`.
    #[must_use]
    pub fn user_data(&self, key: &str) -> Option<Value> {
        self.inner.user_data.lock().get(key).cloned()
    }

    /// Removes the metadata value under `key`.
    pub fn remove_user_data(&self, key: &str) -> Option<Value> {
        self.inner.user_data.lock().remove(key)
    }
}

// ============================================================================
// ClientSignals
// ============================================================================

/// Driver-facing handle that feeds transport events into a [`Client`].
///
/// Holds a weak reference: signals for a dropped client are ignored.
#[derive(Clone)]
pub struct ClientSignals {
    inner: Weak<ClientInner>,
}

impl fmt::Debug for ClientSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSignals")
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ClientSignals {
    /// Returns `true` while the client still exists.
    #[inline]
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }

    /// Returns the client these signals feed, if it still exists.
    #[inline]
    #[must_use]
    pub fn client(&self) -> Option<Client> {
        self.inner.upgrade().map(|inner| Client { inner })
    }

    /// Reports an established outbound connection.
    pub fn connected(&self) {
        if let Some(client) = self.client() {
            debug!(client_id = %client.inner.id, "Connected");
            client.inner.events.emit(ClientEvent::Connect, false);
        }
    }

    /// Reports received bytes.
    pub fn data(&self, data: Bytes) {
        if let Some(client) = self.client() {
            let buffer = client.buffers_data();
            client.inner.events.emit(ClientEvent::Data(data), buffer);
        }
    }

    /// Reports a transport-level error. Does not close the client.
    pub fn error(&self, message: impl Into<String>) {
        if let Some(client) = self.client() {
            let message = message.into();
            debug!(client_id = %client.inner.id, error = %message, "Transport error");
            client.inner.events.emit(ClientEvent::Error(message), false);
        }
    }

    /// Reports that the transport closed.
    ///
    /// Moves the client to `Disconnected` and raises `disconnect`, at most
    /// once per client. Handlers are dropped afterwards.
    pub fn closed(&self) {
        let Some(client) = self.client() else {
            return;
        };

        {
            let mut state = client.inner.state.lock();
            if *state == ClientState::Disconnected {
                return;
            }
            *state = ClientState::Disconnected;
        }

        debug!(client_id = %client.inner.id, "Disconnected");
        client
            .inner
            .events
            .emit(ClientEvent::Disconnect(client.clone()), false);
        client.inner.events.clear_handlers();

        let keepalive = client.inner.closing.lock().take();
        drop(keepalive);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn reject_secure(options: &ConnectOptions, driver: &str) -> Result<()> {
    if options.secure {
        return Err(Error::invalid_config(format!(
            "the {driver} driver does not provide TLS; supply a secure Transport"
        )));
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
