//! One-shot startup rendezvous
//!
//! A worker thread waits here after its setup until the controller has
//! wired every sibling stream and releases it.

use parking_lot::{Condvar, Mutex};

pub struct StartupBarrier {
    decision: Mutex<Option<bool>>,
    released: Condvar,
}

impl StartupBarrier {
    pub fn new() -> Self {
        Self {
            decision: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    /// Release every waiter with `proceed`.
    ///
    /// Only the first call counts; returns false for later calls.
    pub fn release(&self, proceed: bool) -> bool {
        let mut decision = self.decision.lock();
        if decision.is_some() {
            return false;
        }
        *decision = Some(proceed);
        self.released.notify_all();
        true
    }

    /// Block until released; returns the `proceed` decision
    pub fn wait(&self) -> bool {
        let mut decision = self.decision.lock();
        loop {
            if let Some(proceed) = *decision {
                return proceed;
            }
            self.released.wait(&mut decision);
        }
    }

    pub fn is_released(&self) -> bool {
        self.decision.lock().is_some()
    }
}

impl Default for StartupBarrier {
    fn default() -> Self {
        Self::new()
    }
}
