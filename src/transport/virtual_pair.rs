//! In-process paired transport.
//!
//! [`create_pair`] returns two bound clients wired to each other instead of
//! to a network peer. Each side owns an outbound FIFO queue and a latency.
//!
//! # Delivery
//!
//! ```text
//! A.send(p) ──► A.queue.push_back(p) ──► after A.latency ──► pop A.queue head ──► B data
//! ```
//!
//! Every send schedules exactly one delivery, and every delivery pops the
//! head of the queue rather than "its own" payload. Timers may fire in any
//! order; the queue alone decides what B sees next.
//!
//! The pop and the hand-off into B's event queue happen under one lock;
//! B's handlers run after it is released.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn example() -> sockwrap::Result<()> {
//! let (a, b) = sockwrap::create_pair();
//! b.on_data(|data| println!("b got {data:?}"));
//! a.set_latency(Duration::from_millis(50));
//! a.send("hello")?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::client::{Client, ClientSignals};
use crate::error::{Error, Result};
use crate::options::ConnectOptions;

use super::{Transport, runtime};

// ============================================================================
// VirtualLink
// ============================================================================

/// One side's delivery state.
#[derive(Default)]
struct VirtualLink {
    /// Signals of the client owning this side.
    own: Mutex<Option<ClientSignals>>,
    /// Signals of the other side's client. Non-owning.
    peer: Mutex<Option<ClientSignals>>,
    /// Delay applied to each outbound payload.
    latency: Mutex<Duration>,
    /// Sent but not yet delivered payloads.
    queue: Mutex<VecDeque<Bytes>>,
}

impl VirtualLink {
    /// Pops the head of the queue and hands it to the peer.
    fn deliver_head(&self) {
        let drainer = {
            let mut queue = self.queue.lock();
            let Some(data) = queue.pop_front() else {
                return;
            };

            let peer = self.peer.lock().as_ref().and_then(ClientSignals::client);
            match peer {
                Some(peer) => {
                    trace!(len = data.len(), "Virtual delivery");
                    peer.post_data(data).then_some(peer)
                }
                None => {
                    trace!("Virtual delivery dropped, no peer");
                    None
                }
            }
        };

        if let Some(peer) = drainer {
            peer.dispatch_events();
        }
    }
}

// ============================================================================
// VirtualTransport
// ============================================================================

/// Transport backing one side of a virtual pair.
pub struct VirtualTransport {
    link: Arc<VirtualLink>,
}

impl fmt::Debug for VirtualTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualTransport")
            .field("latency", &self.latency())
            .field("pending", &self.pending())
            .finish()
    }
}

impl VirtualTransport {
    fn new() -> Self {
        Self {
            link: Arc::new(VirtualLink::default()),
        }
    }

    fn attach(&self, signals: ClientSignals) {
        *self.link.own.lock() = Some(signals);
    }

    fn set_peer(&self, peer: ClientSignals) {
        *self.link.peer.lock() = Some(peer);
    }

    /// Returns the outbound delay.
    #[inline]
    #[must_use]
    pub fn latency(&self) -> Duration {
        *self.link.latency.lock()
    }

    /// Sets the outbound delay. Affects later sends only.
    pub fn set_latency(&self, latency: Duration) {
        *self.link.latency.lock() = latency;
    }

    /// Returns the number of payloads sent but not yet delivered.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.link.queue.lock().len()
    }
}

impl Transport for VirtualTransport {
    fn initiate_connect(&self, _options: &ConnectOptions, _signals: ClientSignals) -> Result<()> {
        Err(Error::AlreadyBound)
    }

    fn install_hooks(&self, signals: ClientSignals) -> Result<()> {
        self.attach(signals);
        Ok(())
    }

    fn initiate_send(&self, data: Bytes) -> Result<()> {
        if self.link.peer.lock().is_none() {
            trace!("Virtual send dropped, no peer");
            return Ok(());
        }

        let latency = self.latency();
        let handle = if latency.is_zero() {
            None
        } else {
            Some(runtime()?)
        };

        self.link.queue.lock().push_back(data);

        match handle {
            None => self.link.deliver_head(),
            Some(handle) => {
                let link = Arc::clone(&self.link);
                handle.spawn(async move {
                    tokio::time::sleep(latency).await;
                    link.deliver_head();
                });
            }
        }

        Ok(())
    }

    fn initiate_disconnect(&self) -> Result<()> {
        let peer = self.link.peer.lock().clone();
        let own = self.link.own.lock().clone();

        debug!("Virtual pair disconnecting");

        if let Some(peer) = peer {
            peer.closed();
        }
        if let Some(own) = own {
            own.closed();
        }
        Ok(())
    }
}

// ============================================================================
// VirtualClient
// ============================================================================

/// One side of a virtual pair.
///
/// Dereferences to [`Client`]; adds latency control.
#[derive(Clone)]
pub struct VirtualClient {
    client: Client,
    transport: Arc<VirtualTransport>,
}

impl fmt::Debug for VirtualClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualClient")
            .field("client", &self.client)
            .field("transport", &self.transport)
            .finish()
    }
}

impl Deref for VirtualClient {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self.client
    }
}

impl VirtualClient {
    fn new() -> Self {
        let transport = Arc::new(VirtualTransport::new());
        let client = Client::bound(Arc::clone(&transport) as Arc<dyn Transport>);
        transport.attach(client.signals());
        Self { client, transport }
    }

    /// Returns the underlying client.
    #[inline]
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Returns the outbound delay.
    #[inline]
    #[must_use]
    pub fn latency(&self) -> Duration {
        self.transport.latency()
    }

    /// Sets the outbound delay for later sends from this side.
    ///
    /// Never reorders relative to earlier sends.
    pub fn set_latency(&self, latency: Duration) {
        self.transport.set_latency(latency);
    }

    /// Returns the number of payloads sent but not yet delivered.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.transport.pending()
    }
}

/// Creates two bound clients wired to each other.
///
/// Both start with zero latency and empty queues. Sends with a non-zero
/// latency need a tokio runtime.
#[must_use]
pub fn create_pair() -> (VirtualClient, VirtualClient) {
    let a = VirtualClient::new();
    let b = VirtualClient::new();

    a.transport.set_peer(b.client.signals());
    b.transport.set_peer(a.client.signals());

    debug!(a = %a.id(), b = %b.id(), "Virtual pair created");
    (a, b)
}

// ============================================================================
// Tests
// ============================================================================
