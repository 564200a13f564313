//! Named-event registration and dispatch.
//!
//! [`EventHub`] maps an event kind to an ordered list of handlers and a
//! FIFO buffer of payloads that arrived while nobody was listening.
//!
//! # Buffering
//!
//! A payload is buffered only when its kind has no handler and the caller
//! asked for buffering. The buffer drains in arrival order into the first
//! handler that registers for that kind, then it is gone for good.
//!
//! ```ignore
//! hub.emit(ClientEvent::Data(b"a".into()), true);  // buffered
//! hub.emit(ClientEvent::Data(b"b".into()), true);  // buffered
//! hub.register(ClientEventKind::Data, handler);    // handler sees "a", "b"
//! ```
//!
//! # Dispatch
//!
//! Every emit is appended to one FIFO per hub. The caller that finds the
//! hub idle becomes its drainer and runs handlers, in registration order,
//! until the FIFO is empty; everyone else only enqueues. No lock is held
//! while a handler runs, so a handler may emit on any hub, including its
//! own.
//!
//! A handler that emits on its own hub sees that event dispatched after it
//! returns. An emit racing with another thread's drain is dispatched on
//! that thread.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::HandlerId;

// ============================================================================
// Types
// ============================================================================

/// An event payload that knows which named event it belongs to.
pub trait Event: Send + Sync + 'static {
    /// Event name type.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the event name this payload is dispatched under.
    fn kind(&self) -> Self::Kind;
}

/// Handler callback type.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Per-kind state: active handlers plus undelivered payloads.
struct Slot<E> {
    handlers: Vec<(HandlerId, Handler<E>)>,
    buffered: VecDeque<E>,
}

impl<E> Default for Slot<E> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            buffered: VecDeque::new(),
        }
    }
}

/// Work waiting for the drainer.
enum Pending<E> {
    /// Fan out to the handlers present at dispatch time, or buffer.
    Emit { event: E, buffer_if_idle: bool },
    /// A buffered payload owed to the first handler of its kind.
    Replay { handler: Handler<E>, event: E },
    /// Drop every handler. Buffered payloads stay.
    ClearHandlers,
}

/// Everything behind the hub lock.
struct HubState<E: Event> {
    slots: FxHashMap<E::Kind, Slot<E>>,
    pending: VecDeque<Pending<E>>,
    draining: bool,
}

impl<E: Event> HubState<E> {
    /// Makes the caller the drainer unless someone already is.
    fn claim(&mut self) -> bool {
        !std::mem::replace(&mut self.draining, true)
    }
}

// ============================================================================
// EventHub
// ============================================================================

/// Named-event registry with at-most-one pending batch per event kind.
///
/// Owned by exactly one client or server; dropped with it.
pub struct EventHub<E: Event> {
    state: Mutex<HubState<E>>,
}

impl<E: Event> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EventHub")
            .field("kinds", &state.slots.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

/// Releases the drainer role if a handler unwinds.
struct DrainGuard<'a, E: Event> {
    hub: &'a EventHub<E>,
}

impl<E: Event> Drop for DrainGuard<'_, E> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.hub.state.lock().draining = false;
        }
    }
}

// ============================================================================
// EventHub - Public API
// ============================================================================

impl<E: Event> EventHub<E> {
    /// Creates an empty hub.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                slots: FxHashMap::default(),
                pending: VecDeque::new(),
                draining: false,
            }),
        }
    }

    /// Registers a handler for `kind`.
    ///
    /// If this is the first handler for `kind`, every buffered payload is
    /// delivered to it in arrival order ahead of any later event, and the
    /// buffer is discarded. Called outside a dispatch, the replay is done
    /// when this returns.
    pub fn register(&self, kind: E::Kind, handler: Handler<E>) -> HandlerId {
        let id = HandlerId::next();

        let drain = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let slot = state.slots.entry(kind).or_default();
            let first = slot.handlers.is_empty();
            slot.handlers.push((id, Arc::clone(&handler)));

            if first && !slot.buffered.is_empty() {
                let replay = std::mem::take(&mut slot.buffered);
                trace!(?kind, count = replay.len(), "Replaying buffered events");
                for event in replay.into_iter().rev() {
                    state.pending.push_front(Pending::Replay {
                        handler: Arc::clone(&handler),
                        event,
                    });
                }
                state.claim()
            } else {
                false
            }
        };

        if drain {
            self.drain();
        }
        id
    }

    /// Removes the handler registered under `id`.
    ///
    /// Returns `false` if no such handler exists for `kind`.
    pub fn unregister(&self, kind: E::Kind, id: HandlerId) -> bool {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(&kind) else {
            return false;
        };

        match slot.handlers.iter().position(|(existing, _)| *existing == id) {
            Some(index) => {
                slot.handlers.remove(index);
                true
            }
            None => false,
        }
    }

    /// Dispatches `event` to every handler of its kind.
    ///
    /// With no handlers, the event is buffered when `buffer_if_idle` is
    /// set and dropped otherwise.
    pub fn emit(&self, event: E, buffer_if_idle: bool) {
        if self.post(event, buffer_if_idle) {
            self.drain();
        }
    }

    /// Returns the number of handlers registered for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: E::Kind) -> usize {
        self.state
            .lock()
            .slots
            .get(&kind)
            .map_or(0, |slot| slot.handlers.len())
    }

    /// Returns the number of payloads waiting for a first handler.
    #[must_use]
    pub fn buffered_count(&self, kind: E::Kind) -> usize {
        self.state
            .lock()
            .slots
            .get(&kind)
            .map_or(0, |slot| slot.buffered.len())
    }
}

// ============================================================================
// EventHub - Crate API
// ============================================================================

impl<E: Event> EventHub<E> {
    /// Enqueues `event` without dispatching it.
    ///
    /// Returns `true` when the caller became the drainer and must call
    /// [`EventHub::drain`].
    #[must_use]
    pub(crate) fn post(&self, event: E, buffer_if_idle: bool) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(Pending::Emit {
            event,
            buffer_if_idle,
        });
        state.claim()
    }

    /// Drops every handler once the events queued so far are dispatched.
    pub(crate) fn clear_handlers(&self) {
        let drain = {
            let mut state = self.state.lock();
            state.pending.push_back(Pending::ClearHandlers);
            state.claim()
        };

        if drain {
            self.drain();
        }
    }

    /// Runs queued work until the FIFO is empty, then gives up the drainer
    /// role.
    pub(crate) fn drain(&self) {
        let _guard = DrainGuard { hub: self };

        loop {
            let (event, handlers) = {
                let mut guard = self.state.lock();
                let state = &mut *guard;

                match state.pending.pop_front() {
                    None => {
                        state.draining = false;
                        return;
                    }

                    Some(Pending::Emit {
                        event,
                        buffer_if_idle,
                    }) => {
                        let kind = event.kind();
                        let slot = state.slots.entry(kind).or_default();

                        if slot.handlers.is_empty() {
                            if buffer_if_idle {
                                slot.buffered.push_back(event);
                                trace!(?kind, pending = slot.buffered.len(), "Event buffered");
                            } else {
                                trace!(?kind, "Event dropped, no handler");
                            }
                            continue;
                        }

                        let handlers: Vec<Handler<E>> = slot
                            .handlers
                            .iter()
                            .map(|(_, handler)| Arc::clone(handler))
                            .collect();
                        (event, handlers)
                    }

                    Some(Pending::Replay { handler, event }) => (event, vec![handler]),

                    Some(Pending::ClearHandlers) => {
                        for slot in state.slots.values_mut() {
                            slot.handlers.clear();
                        }
                        continue;
                    }
                }
            };

            for handler in &handlers {
                handler(&event);
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
