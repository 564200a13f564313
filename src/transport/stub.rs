//! Recording drivers for lifecycle tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::client::ClientSignals;
use crate::error::{Error, Result};
use crate::options::{ConnectOptions, ListenOptions};
use crate::server::ServerSignals;
use crate::transport::{Acceptor, Transport};

// ============================================================================
// StubTransport
// ============================================================================

/// Client transport that records every call and lets tests drive signals.
#[derive(Default)]
pub(crate) struct StubTransport {
    connects: AtomicUsize,
    hooks: Mutex<Vec<ClientSignals>>,
    sent: Mutex<Vec<Bytes>>,
    disconnects: AtomicUsize,
    fail_connect: AtomicBool,
    fail_hooks: AtomicBool,
    fail_disconnect: AtomicBool,
}

impl StubTransport {
    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn hook_count(&self) -> usize {
        self.hooks.lock().len()
    }

    pub(crate) fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    pub(crate) fn fail_connect(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_hooks(&self) {
        self.fail_hooks.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_disconnect(&self) {
        self.fail_disconnect.store(true, Ordering::SeqCst);
    }

    fn signals(&self) -> Option<ClientSignals> {
        self.hooks.lock().last().cloned()
    }

    /// Feeds inbound bytes through the installed hooks.
    pub(crate) fn deliver(&self, data: &[u8]) {
        if let Some(signals) = self.signals() {
            signals.data(Bytes::copy_from_slice(data));
        }
    }

    /// Raises a transport error through the installed hooks.
    pub(crate) fn fail(&self, message: &str) {
        if let Some(signals) = self.signals() {
            signals.error(message);
        }
    }

    /// Reports the transport as closed.
    pub(crate) fn close(&self) {
        if let Some(signals) = self.signals() {
            signals.closed();
        }
    }
}

impl Transport for StubTransport {
    fn initiate_connect(&self, _options: &ConnectOptions, _signals: ClientSignals) -> Result<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection("connection refused"));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn install_hooks(&self, signals: ClientSignals) -> Result<()> {
        if self.fail_hooks.load(Ordering::SeqCst) {
            return Err(Error::connection("socket gone"));
        }
        self.hooks.lock().push(signals);
        Ok(())
    }

    fn initiate_send(&self, data: Bytes) -> Result<()> {
        self.sent.lock().push(data);
        Ok(())
    }

    fn initiate_disconnect(&self) -> Result<()> {
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(Error::connection("teardown failed"));
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// StubAcceptor
// ============================================================================

/// Listener driver that records calls; raw connections are stub transports.
#[derive(Default)]
pub(crate) struct StubAcceptor {
    created: AtomicUsize,
    bound: AtomicUsize,
    closed: AtomicUsize,
}

impl StubAcceptor {
    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn bound(&self) -> usize {
        self.bound.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Acceptor for StubAcceptor {
    type Raw = Arc<StubTransport>;

    fn create_listening_handle(&self, _options: &ListenOptions) -> Result<()> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bind_and_accept(&self, _options: &ListenOptions, _signals: ServerSignals<Self>) -> Result<()> {
        self.bound.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close_listening_handle(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
