//! Synchronous multi-listener events
//!
//! A `Signal` invokes every connected listener directly in the emitting
//! thread. Listeners are called after the internal lock is released, so a
//! listener may connect, disconnect or emit again without deadlocking.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifies one connection on one signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

struct Slot<T> {
    id: ConnectionId,
    once: bool,
    listener: Listener<T>,
}

pub struct Signal<T> {
    slots: Mutex<Vec<Slot<T>>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Connect a listener that stays connected until `disconnect`
    pub fn connect<F>(&self, listener: F) -> ConnectionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(listener), false)
    }

    /// Connect a listener that is removed before its first invocation
    pub fn connect_once<F>(&self, listener: F) -> ConnectionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(listener), true)
    }

    /// Returns false if the connection was already gone
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub fn emit(&self, value: &T) {
        let listeners: Vec<Listener<T>> = {
            let mut slots = self.slots.lock();
            let listeners = slots.iter().map(|slot| slot.listener.clone()).collect();
            slots.retain(|slot| !slot.once);
            listeners
        };

        for listener in listeners {
            listener(value);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn insert(&self, listener: Listener<T>, once: bool) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().push(Slot { id, once, listener });
        id
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
