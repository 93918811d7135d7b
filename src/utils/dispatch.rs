//! Execution contexts
//!
//! An `EventLoop` owns a queue of tasks that run in its own thread. Posting
//! through a `ContextHandle` is how work gets delivered asynchronously into
//! another component's context.

use std::thread::{self, JoinHandle};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

type Task = Box<dyn FnOnce() + Send>;

/// Cloneable handle used to post tasks into an event loop
#[derive(Clone)]
pub struct ContextHandle {
    tx: UnboundedSender<Task>,
}

impl ContextHandle {
    /// Queue `task` for the next turn of the owning loop.
    ///
    /// Returns false if the loop is gone and the task was dropped.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(task)).is_ok()
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

/// A run loop driven by its owner
pub struct EventLoop {
    rx: UnboundedReceiver<Task>,
    handle: ContextHandle,
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            handle: ContextHandle { tx },
        }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Run every task queued so far, including tasks queued by those tasks.
    pub fn run_pending(&mut self) -> usize {
        let mut executed = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            executed += 1;
        }
        executed
    }

    /// Run the loop on a dedicated thread until every handle is dropped.
    pub fn spawn(name: &str) -> std::io::Result<(ContextHandle, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let thread_name = name.to_string();
        let join = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            tracing::debug!("Event loop '{}' started", thread_name);
            while let Some(task) = rx.blocking_recv() {
                task();
            }
            tracing::debug!("Event loop '{}' stopped", thread_name);
        })?;

        Ok((ContextHandle { tx }, join))
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
