//! Stream socket driver.
//!
//! Each live connection is served by one spawned task that owns the
//! socket. The [`TcpTransport`] handle talks to it over an unbounded
//! command channel.
//!
//! # Event Loop
//!
//! The task handles:
//!
//! - Inbound bytes, forwarded as `data` once hooks are installed
//! - Outbound writes queued by `send`
//! - Teardown (write-side shutdown, then `closed`)

// ============================================================================
// Imports
// ============================================================================

use std::net::{SocketAddr, ToSocketAddrs};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::client::ClientSignals;
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, ListenOptions};
use crate::server::ServerSignals;

use super::{Acceptor, Transport, runtime};

// ============================================================================
// Constants
// ============================================================================

/// Read buffer reserved before each read.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Pending connection backlog for listeners.
const LISTEN_BACKLOG: i32 = 1024;

// ============================================================================
// DriverCommand
// ============================================================================

/// Internal commands for a connection event loop.
pub(crate) enum DriverCommand {
    /// Start forwarding inbound traffic to these signals.
    Hook(ClientSignals),
    /// Write bytes.
    Send(Bytes),
    /// Shut the connection down.
    Shutdown,
}

// ============================================================================
// TcpTransport
// ============================================================================

/// Stream socket client transport.
///
/// Outbound transports come from [`TcpTransport::new`]; accepted ones wrap
/// a live stream via [`TcpTransport::from_stream`].
pub struct TcpTransport {
    /// Channel to the event loop.
    command_tx: mpsc::UnboundedSender<DriverCommand>,
    /// Receiver, taken when the event loop starts.
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverCommand>>>,
    /// Accepted stream waiting for hooks.
    stream: Mutex<Option<TcpStream>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
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

    /// Wraps an accepted stream.
    ///
    /// Nothing is read until hooks are installed.
    #[must_use]
    pub fn from_stream(stream: TcpStream) -> Self {
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
        host: String,
        port: u16,
        command_rx: mpsc::UnboundedReceiver<DriverCommand>,
        signals: ClientSignals,
    ) {
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(error = %e, "Failed to set TCP_NODELAY");
                }
                info!(%host, port, "TCP connection established");
                signals.connected();
                run_event_loop(stream, command_rx, None).await;
            }
            Err(e) => {
                warn!(%host, port, error = %e, "TCP connect failed");
                signals.error(e.to_string());
                signals.closed();
            }
        }
    }
}

impl Transport for TcpTransport {
    fn initiate_connect(&self, options: &ConnectOptions, signals: ClientSignals) -> Result<()> {
        let handle = runtime()?;
        let command_rx = self.take_receiver()?;
        let host = options.host_or_default().to_string();

        handle.spawn(Self::run_connect(host, options.port, command_rx, signals));
        Ok(())
    }

    fn install_hooks(&self, signals: ClientSignals) -> Result<()> {
        let Some(stream) = self.stream.lock().take() else {
            return self
                .command_tx
                .send(DriverCommand::Hook(signals))
                .map_err(|_| Error::connection("TCP event loop has ended"));
        };

        let handle = runtime()?;
        let command_rx = self.take_receiver()?;
        handle.spawn(run_event_loop(stream, command_rx, Some(signals)));
        Ok(())
    }

    fn initiate_send(&self, data: Bytes) -> Result<()> {
        self.command_tx
            .send(DriverCommand::Send(data))
            .map_err(|_| Error::connection("TCP event loop has ended"))
    }

    fn initiate_disconnect(&self) -> Result<()> {
        // A finished loop has already reported the close.
        let _ = self.command_tx.send(DriverCommand::Shutdown);
        Ok(())
    }
}

/// Event loop that owns a connected stream.
async fn run_event_loop(
    stream: TcpStream,
    mut command_rx: mpsc::UnboundedReceiver<DriverCommand>,
    mut hooks: Option<ClientSignals>,
) {
    let peer = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    loop {
        buffer.reserve(READ_BUFFER_SIZE);

        tokio::select! {
            // Inbound bytes, only once someone is listening
            read = reader.read_buf(&mut buffer), if hooks.is_some() => {
                match read {
                    Ok(0) => {
                        debug!(?peer, "TCP stream ended by remote");
                        break;
                    }

                    Ok(len) => {
                        trace!(?peer, len, "TCP data received");
                        if let Some(signals) = &hooks {
                            signals.data(buffer.split().freeze());
                        }
                    }

                    Err(e) => {
                        warn!(?peer, error = %e, "TCP read failed");
                        if let Some(signals) = &hooks {
                            signals.error(e.to_string());
                        }
                        break;
                    }
                }
            }

            // Commands from the transport handle
            command = command_rx.recv() => {
                match command {
                    Some(DriverCommand::Hook(signals)) => {
                        hooks = Some(signals);
                    }

                    Some(DriverCommand::Send(data)) => {
                        if let Err(e) = writer.write_all(&data).await {
                            warn!(?peer, error = %e, "TCP write failed");
                            if let Some(signals) = &hooks {
                                signals.error(e.to_string());
                            }
                            break;
                        }
                    }

                    Some(DriverCommand::Shutdown) => {
                        debug!(?peer, "TCP shutdown requested");
                        if let Err(e) = writer.shutdown().await {
                            trace!(?peer, error = %e, "TCP write shutdown failed");
                        }
                        break;
                    }

                    None => {
                        debug!(?peer, "TCP transport dropped");
                        break;
                    }
                }
            }
        }
    }

    if let Some(signals) = hooks {
        signals.closed();
    }

    debug!(?peer, "TCP event loop terminated");
}

// ============================================================================
// ListenHandle
// ============================================================================

/// Listening socket shared by the stream and message socket acceptors.
///
/// Created unbound, bound by [`ListenHandle::bind`], stopped by
/// [`ListenHandle::close`].
#[derive(Default)]
pub(crate) struct ListenHandle {
    /// Created but not yet bound socket, with its target address.
    socket: Mutex<Option<(Socket, SocketAddr)>>,
    /// Stops the accept loop.
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    /// Address actually bound.
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ListenHandle {
    /// Resolves the bind address and creates the socket.
    pub(crate) fn create(&self, options: &ListenOptions) -> Result<()> {
        let host = options.host_or_default();
        let addr = (host, options.port)
            .to_socket_addrs()?
            .find(|addr| !options.ipv6_only || addr.is_ipv6())
            .ok_or_else(|| Error::invalid_config(format!("cannot resolve listen host {host}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        if addr.is_ipv6() {
            socket.set_only_v6(options.ipv6_only)?;
        }
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;

        trace!(%addr, "Listening socket created");
        *self.socket.lock() = Some((socket, addr));
        Ok(())
    }

    /// Binds the socket and returns the async listener plus its shutdown
    /// receiver.
    pub(crate) fn bind(&self) -> Result<(TcpListener, oneshot::Receiver<()>)> {
        let handle = runtime()?;
        let (socket, addr) = self
            .socket
            .lock()
            .take()
            .ok_or_else(|| Error::connection("listening handle is closed or already bound"))?;

        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        let _guard = handle.enter();
        let listener = TcpListener::from_std(socket.into())?;
        let bound = listener.local_addr()?;
        *self.local_addr.lock() = Some(bound);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        debug!(addr = %bound, "Listener bound");
        Ok((listener, shutdown_rx))
    }

    /// Stops the accept loop, or drops the unbound socket.
    pub(crate) fn close(&self) {
        self.socket.lock().take();
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
    }

    /// Returns the bound address.
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

/// Rejects listen options the bundled drivers cannot honor.
pub(crate) fn reject_secure(options: &ListenOptions, driver: &str) -> Result<()> {
    if options.is_secure() {
        return Err(Error::invalid_config(format!(
            "the {driver} driver does not provide TLS; supply a secure Acceptor"
        )));
    }
    Ok(())
}

// ============================================================================
// TcpAcceptor
// ============================================================================

/// Stream socket listener driver.
#[derive(Default)]
pub struct TcpAcceptor {
    handle: ListenHandle,
}

impl TcpAcceptor {
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
                    debug!("TCP listener shutdown requested");
                    break;
                }

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                trace!(error = %e, "Failed to set TCP_NODELAY");
                            }
                            trace!(%peer, "TCP connection accepted");

                            match signals.accepted(stream) {
                                Ok(_) => {}
                                Err(Error::Closed) => break,
                                Err(e) => warn!(%peer, error = %e, "Dropping accepted connection"),
                            }
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
}

impl Acceptor for TcpAcceptor {
    type Raw = TcpStream;

    fn create_listening_handle(&self, options: &ListenOptions) -> Result<()> {
        reject_secure(options, "TCP")?;
        self.handle.create(options)
    }

    fn bind_and_accept(&self, _options: &ListenOptions, signals: ServerSignals<Self>) -> Result<()> {
        match self.handle.bind() {
            Ok((listener, shutdown_rx)) => {
                let handle = runtime()?;
                handle.spawn(Self::run_accept_loop(listener, shutdown_rx, signals));
            }
            Err(e) => {
                warn!(error = %e, "TCP bind failed");
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

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    use crate::client::Client;
    use crate::server::Server;

    const WAIT: Duration = Duration::from_secs(5);

    /// Routes driver logs to the test output; honors `RUST_LOG`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sockwrap=debug")),
            )
            .with_test_writer()
            .try_init();
    }

    async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel open")
    }

    fn listening_server() -> (Server<TcpAcceptor>, SocketAddr) {
        let server =
            Server::tcp(ListenOptions::new(0).with_host("127.0.0.1")).expect("server created");
        server.listen().expect("listen");
        let addr = server.local_addr().expect("bound");
        (server, addr)
    }

    #[test]
    fn test_tcp_acceptor_rejects_cert() {
        let options = ListenOptions::new(0)
            .with_host("127.0.0.1")
            .with_identity("cert", "key");
        let err = TcpAcceptor::new()
            .create_listening_handle(&options)
            .unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_connect_requires_runtime() {
        let client = Client::tcp(ConnectOptions::new(1).with_host("127.0.0.1")).expect("client");
        assert!(client.connect().is_err());
        assert!(client.send("x").is_err());
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let (server, addr) = listening_server();
        assert!(addr.port() > 0);
        assert!(addr.ip().is_loopback());
        server.close().expect("close");
    }

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        init_tracing();
        let (server, addr) = listening_server();

        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        server.on_connection(move |client| {
            let echo = client.clone();
            client.on_data(move |data| {
                let _ = echo.send(data.clone());
            });
            let _ = accepted_tx.send(client.id());
        });

        let client = Client::tcp(ConnectOptions::new(addr.port()).with_host("127.0.0.1"))
            .expect("client");
        let (data_tx, mut data_rx) = mpsc::unbounded_channel();
        let (connect_tx, mut connect_rx) = mpsc::unbounded_channel();
        client.on_connect(move || {
            let _ = connect_tx.send(());
        });
        client.on_data(move |data| {
            let _ = data_tx.send(data.clone());
        });
        client.connect().expect("connect");

        next(&mut connect_rx).await;
        next(&mut accepted_rx).await;
        assert_eq!(server.client_count(), 1);

        client.send("hello").expect("send");

        let mut echoed = Vec::new();
        while echoed.len() < 5 {
            echoed.extend_from_slice(&next(&mut data_rx).await);
        }
        assert_eq!(echoed, b"hello");

        server.close().expect("close");
    }

    #[tokio::test]
    async fn test_disconnect_reports_close_on_both_sides() {
        init_tracing();
        let (server, addr) = listening_server();

        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        server.on_connection(move |client| {
            let _ = accepted_tx.send(client.clone());
        });

        let client = Client::tcp(ConnectOptions::new(addr.port()).with_host("127.0.0.1"))
            .expect("client");
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        client.on_disconnect(move |_| {
            let _ = closed_tx.send(());
        });
        client.connect().expect("connect");

        let accepted = next(&mut accepted_rx).await;
        let (remote_closed_tx, mut remote_closed_rx) = mpsc::unbounded_channel();
        accepted.on_disconnect(move |_| {
            let _ = remote_closed_tx.send(());
        });

        client.disconnect();
        next(&mut closed_rx).await;
        next(&mut remote_closed_rx).await;

        assert!(client.is_disconnected());
        assert!(matches!(client.send("late"), Err(Error::Closed)));
        assert_eq!(server.client_count(), 0);
    }

    #[tokio::test]
    async fn test_server_close_reports_disconnect_on_accepted_side() {
        init_tracing();
        let (server, addr) = listening_server();

        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let (remote_closed_tx, mut remote_closed_rx) = mpsc::unbounded_channel();
        server.on_connection(move |client| {
            let remote_closed_tx = remote_closed_tx.clone();
            client.on_disconnect(move |closed| {
                let _ = remote_closed_tx.send(closed.id());
            });
            let _ = accepted_tx.send(client.id());
        });

        let client = Client::tcp(ConnectOptions::new(addr.port()).with_host("127.0.0.1"))
            .expect("client");
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        client.on_disconnect(move |_| {
            let _ = closed_tx.send(());
        });
        client.connect().expect("connect");

        let accepted_id = next(&mut accepted_rx).await;
        server.close().expect("close");

        assert_eq!(next(&mut remote_closed_rx).await, accepted_id);
        next(&mut closed_rx).await;
        assert_eq!(server.client_count(), 0);
        assert!(client.is_disconnected());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error_then_close() {
        // Grab a free port, then release it.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };

        let client =
            Client::tcp(ConnectOptions::new(port).with_host("127.0.0.1")).expect("client");
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let errors = events_tx.clone();
        client.on_error(move |_| {
            let _ = errors.send("error");
        });
        client.on_disconnect(move |_| {
            let _ = events_tx.send("disconnect");
        });
        client.connect().expect("connect initiated");

        assert_eq!(next(&mut events_rx).await, "error");
        assert_eq!(next(&mut events_rx).await, "disconnect");
    }

    #[tokio::test]
    async fn test_close_emits_close_event() {
        let (server, _) = listening_server();
        let (close_tx, mut close_rx) = mpsc::unbounded_channel();
        server.on_close(move || {
            let _ = close_tx.send(());
        });

        server.close().expect("close");
        next(&mut close_rx).await;
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_error() {
        let (first, addr) = listening_server();
        let server = Server::tcp(ListenOptions::new(addr.port()).with_host("127.0.0.1"))
            .expect("server created");

        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        server.on_error(move |message| sink.lock().push(message.to_string()));

        // Address reuse may let the bind succeed on some platforms.
        server.listen().expect("listen never fails synchronously");
        if server.local_addr().is_none() {
            assert_eq!(errors.lock().len(), 1);
        }

        first.close().expect("close");
    }
}
