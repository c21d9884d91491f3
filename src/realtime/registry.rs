//! Handler registry keyed by envelope type.
//!
//! Dispatch walks a snapshot of the handler list, so handlers may register or
//! unsubscribe from inside a callback. Each entry carries a liveness flag that
//! is checked right before invocation; an unsubscribed handler never runs
//! again, even later in the dispatch that removed it.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::Value;
use tracing::warn;

use crate::realtime::proto::{message_type, Envelope};

type PayloadHandler = dyn Fn(&Value) + Send + Sync;
type EnvelopeHandler = dyn Fn(&Envelope) + Send + Sync;

#[derive(Clone)]
enum Callback {
    Payload(Arc<PayloadHandler>),
    Envelope(Arc<EnvelopeHandler>),
}

#[derive(Clone)]
struct Entry {
    id: u64,
    live: Arc<AtomicBool>,
    callback: Callback,
}

impl Entry {
    fn invoke(&self, envelope: &Envelope, value: impl FnOnce() -> Value) {
        if !self.live.load(Ordering::Acquire) {
            return;
        }
        let outcome = match &self.callback {
            Callback::Payload(handler) => {
                let value = value();
                panic::catch_unwind(AssertUnwindSafe(|| handler(&value)))
            }
            Callback::Envelope(handler) => {
                panic::catch_unwind(AssertUnwindSafe(|| handler(envelope)))
            }
        };
        if outcome.is_err() {
            warn!(
                event = "handler_panicked",
                kind = %envelope.kind,
                handler_id = self.id
            );
        }
    }
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    entries: HashMap<String, Vec<Entry>>,
}

impl Slots {
    fn insert(&mut self, key: String, callback: Callback) -> (u64, Arc<AtomicBool>) {
        self.next_id += 1;
        let id = self.next_id;
        let live = Arc::new(AtomicBool::new(true));
        self.entries.entry(key).or_default().push(Entry {
            id,
            live: Arc::clone(&live),
            callback,
        });
        (id, live)
    }

    fn remove(&mut self, key: &str, id: u64) -> bool {
        let Some(entries) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(index) = entries.iter().position(|entry| entry.id == id) else {
            return false;
        };
        let entry = entries.remove(index);
        entry.live.store(false, Ordering::Release);
        if entries.is_empty() {
            self.entries.remove(key);
        }
        true
    }

    fn snapshot(&self, key: &str) -> Vec<Entry> {
        self.entries.get(key).cloned().unwrap_or_default()
    }
}

/// Ordered callbacks per envelope type, plus the wildcard list.
///
/// Cloning yields another handle onto the same registry.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    slots: Arc<Mutex<Slots>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for envelopes of type `kind`.
    ///
    /// Type-specific handlers receive the payload. Registering under
    /// [`message_type::WILDCARD`] invokes the handler for every envelope with
    /// the full envelope as a JSON object.
    pub fn on<F>(&self, kind: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(kind.into(), Callback::Payload(Arc::new(handler)))
    }

    /// Registers a wildcard handler that receives the decoded envelope.
    pub fn on_envelope<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.register(
            message_type::WILDCARD.to_string(),
            Callback::Envelope(Arc::new(handler)),
        )
    }

    /// Number of handlers currently registered under `kind`.
    pub fn handler_count(&self, kind: &str) -> usize {
        self.slots().entries.get(kind).map_or(0, Vec::len)
    }

    /// Invokes type-specific handlers, then wildcard handlers, in
    /// registration order.
    pub fn dispatch(&self, envelope: &Envelope) {
        if envelope.kind != message_type::WILDCARD {
            let typed = self.slots().snapshot(&envelope.kind);
            for entry in &typed {
                entry.invoke(envelope, || envelope.payload.clone());
            }
        }

        let wildcard = self.slots().snapshot(message_type::WILDCARD);
        if wildcard.is_empty() {
            return;
        }
        let full = envelope.to_value();
        for entry in &wildcard {
            entry.invoke(envelope, || full.clone());
        }
    }

    fn register(&self, key: String, callback: Callback) -> Subscription {
        let (id, live) = self.slots().insert(key.clone(), callback);
        Subscription {
            slots: Arc::downgrade(&self.slots),
            key,
            id,
            live,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // Handlers never run under the lock, so a poisoned guard still holds
        // consistent data.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots();
        let mut counts: Vec<(&str, usize)> = slots
            .entries
            .iter()
            .map(|(key, entries)| (key.as_str(), entries.len()))
            .collect();
        counts.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}

/// Token returned by registration; removes exactly that handler.
pub struct Subscription {
    slots: Weak<Mutex<Slots>>,
    key: String,
    id: u64,
    live: Arc<AtomicBool>,
}

impl Subscription {
    /// Removes the handler. Returns `false` when it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.live.store(false, Ordering::Release);
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let mut slots = slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slots.remove(&self.key, self.id)
    }

    pub fn kind(&self) -> &str {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.key)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
