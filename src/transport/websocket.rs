//! Message socket driver.
//!
//! Same shape as the stream socket driver: one spawned task per connection
//! owns the WebSocket stream and is driven over a command channel.
//!
//! # Framing
//!
//! | Direction | Frames |
//! |-----------|--------|
//! | Outbound | every `send` becomes one binary frame |
//! | Inbound | text and binary frames both surface as `data` bytes |
//! | Inbound | ping/pong are answered by the protocol layer and ignored here |
//! | Inbound | a close frame ends the connection |

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::client::ClientSignals;
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, ListenOptions};
use crate::server::ServerSignals;

use super::tcp::{DriverCommand, ListenHandle, reject_secure};
use super::{Acceptor, Transport, runtime};

// ============================================================================
// WsTransport
// ============================================================================

/// Message socket client transport.
pub struct WsTransport {
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    /// Receiver, taken when the event loop starts.
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverCommand>>>,
    /// Accepted stream waiting for hooks.
    stream: Mutex<Option<WebSocketStream<TcpStream>>>,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new() -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        Self {
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
            stream: Mutex::new(None),
        }
    }

    /// Wraps an accepted, already upgraded stream.
    #[must_use]
    pub fn from_stream(stream: WebSocketStream<TcpStream>) -> Self {
        let transport = Self::new();
        *transport.stream.lock() = Some(stream);
        transport
    }

    /// Takes the command receiver, failing if the event loop already owns it.
    fn take_receiver(&self) -> Result<mpsc::UnboundedReceiver<DriverCommand>> {
        self.command_rx.lock().take().ok_or(Error::AlreadyBound)
    }

    /// Connects, then serves the connection until it closes.
    async fn run_connect(
        url: Url,
        command_rx: mpsc::UnboundedReceiver<DriverCommand>,
        signals: ClientSignals,
    ) {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws_stream, _response)) => {
                info!(%url, "WebSocket connection established");
                signals.connected();
                run_event_loop(ws_stream, command_rx, None).await;
            }
            Err(e) => {
                warn!(%url, error = %e, "WebSocket connect failed");
                signals.error(e.to_string());
                signals.closed();
            }
        }
    }
}

impl Transport for WsTransport {
    fn initiate_connect(&self, options: &ConnectOptions, signals: ClientSignals) -> Result<()> {
        let url = ws_url(options.host_or_default(), options.port)?;
        let handle = runtime()?;
        let command_rx = self.take_receiver()?;

        handle.spawn(Self::run_connect(url, command_rx, signals));
        Ok(())
    }

    fn install_hooks(&self, signals: ClientSignals) -> Result<()> {
        let Some(stream) = self.stream.lock().take() else {
            return self
                .command_tx
                .send(DriverCommand::Hook(signals))
                .map_err(|_| Error::connection("WebSocket event loop has ended"));
        };

        let handle = runtime()?;
        let command_rx = self.take_receiver()?;
        handle.spawn(run_event_loop(stream, command_rx, Some(signals)));
        Ok(())
    }

    fn initiate_send(&self, data: Bytes) -> Result<()> {
        self.command_tx
            .send(DriverCommand::Send(data))
            .map_err(|_| Error::connection("WebSocket event loop has ended"))
    }

    fn initiate_disconnect(&self) -> Result<()> {
        // A finished loop has already reported the close.
        let _ = self.command_tx.send(DriverCommand::Shutdown);
        Ok(())
    }
}

/// Builds `ws://host:port/`, bracketing IPv6 literals.
fn ws_url(host: &str, port: u16) -> Result<Url> {
    let authority = match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{ip}]:{port}"),
        _ => format!("{host}:{port}"),
    };

    Url::parse(&format!("ws://{authority}/"))
        .map_err(|e| Error::invalid_config(format!("invalid WebSocket host {host}: {e}")))
}

/// Event loop that owns a connected WebSocket stream.
async fn run_event_loop<S>(
    ws_stream: WebSocketStream<S>,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    mut hooks: Option<ClientSignals>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            // Incoming frames, only once someone is listening
            message = ws_read.next(), if hooks.is_some() => {
                match message {
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(signals) = &hooks {
                            signals.data(data);
                        }
                    }

                    Some(Ok(Message::Text(text))) => {
                        if let Some(signals) = &hooks {
                            signals.data(Bytes::copy_from_slice(text.as_bytes()));
                        }
                    }

                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "WebSocket closed by remote");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        if let Some(signals) = &hooks {
                            signals.error(e.to_string());
                        }
                        break;
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break;
                    }

                    // Ignore Ping, Pong, Frame
                    _ => {}
                }
            }

            // Commands from the transport handle
            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::Hook(signals)) => {
                        hooks = Some(signals);
                    }

                    Some(DriverCommand::Send(data)) => {
                        trace!(len = data.len(), "Sending binary frame");
                        if let Err(e) = ws_write.send(Message::Binary(data)).await {
                            warn!(error = %e, "WebSocket send failed");
                            if let Some(signals) = &hooks {
                                signals.error(e.to_string());
                            }
                            break;
                        }
                    }

                    Some(DriverCommand::Shutdown) => {
                        debug!("WebSocket shutdown requested");
                        if let Err(e) = ws_write.close().await {
                            trace!(error = %e, "WebSocket close handshake failed");
                        }
                        break;
                    }

                    None => {
                        debug!("WebSocket transport dropped");
                        break;
                    }
                }
            }
        }
    }

    if let Some(signals) = hooks {
        signals.closed();
    }

    debug!("WebSocket event loop terminated");
}

// ============================================================================
// WsAcceptor
// ============================================================================

/// Message socket listener driver.
///
/// Each accepted stream is upgraded on its own task, so a slow handshake
/// never blocks the accept loop.
#[derive(Default)]
pub struct WsAcceptor {
    handle: ListenHandle,
}

impl WsAcceptor {
    /// Creates an acceptor with no listening handle yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept loop; runs until shut down or the server is dropped.
    async fn run_accept_loop(
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
        signals: ServerSignals<Self>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("WebSocket listener shutdown requested");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if !signals.is_alive() {
                                break;
                            }
                            tokio::spawn(Self::upgrade(stream, peer, signals.clone()));
                        }

                        Err(e) => {
                            warn!(error = %e, "TCP accept failed");
                            signals.error(e.to_string());
                        }
                    }
                }
            }
        }

        drop(listener);
        signals.closed();
    }

    /// Completes the WebSocket handshake and hands the stream to the server.
    async fn upgrade(stream: TcpStream, peer: SocketAddr, signals: ServerSignals<Self>) {
        match tokio_tungstenite::accept_async(stream).await {
            Ok(ws_stream) => {
                trace!(%peer, "WebSocket connection accepted");
                if let Err(e) = signals.accepted(ws_stream) {
                    warn!(%peer, error = %e, "Dropping accepted connection");
                }
            }
            Err(e) => {
                debug!(%peer, error = %e, "WebSocket upgrade failed");
                signals.error(format!("WebSocket upgrade failed: {e}"));
            }
        }
    }
}

impl Acceptor for WsAcceptor {
    type Raw = WebSocketStream<TcpStream>;

    fn create_listening_handle(&self, options: &ListenOptions) -> Result<()> {
        reject_secure(options, "WebSocket")?;
        self.handle.create(options)
    }

    fn bind_and_accept(&self, _options: &ListenOptions, signals: ServerSignals<Self>) -> Result<()> {
        match self.handle.bind() {
            Ok((listener, shutdown_rx)) => {
                let handle = runtime()?;
                handle.spawn(Self::run_accept_loop(listener, shutdown_rx, signals));
            }
            Err(e) => {
                warn!(error = %e, "WebSocket bind failed");
                signals.error(e.to_string());
            }
        }
        Ok(())
    }

    fn close_listening_handle(&self) -> Result<()> {
        self.handle.close();
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.handle.local_addr()
    }
}

// ============================================================================
// Tests
// ============================================================================
