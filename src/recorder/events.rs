//! Engine events
//!
//! Broadcast to every subscriber, the same way the coordinator publishes
//! its recording events.

use crate::recorder::state::RecordingResult;
use crate::utils::{ErrorKind, SessionError, StreamInitError};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the recording engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A source could not get a stream; other sources continue
    StreamInitializationError { kind: ErrorKind, message: String },
    /// Session-level failure
    SessionError(SessionError),
    /// Header written, every stream is encoding
    EncodingStarted,
    /// Recorded duration in milliseconds
    DurationChanged(i64),
    /// Every source ended while auto-stop was on
    AutoStopped,
    /// Trailer written and container closed
    FinalizationDone(RecordingResult),
}

/// Cloneable event sink shared with the stream threads
#[derive(Clone)]
pub struct EngineReporter {
    tx: broadcast::Sender<EngineEvent>,
    duration_ms: Arc<AtomicI64>,
}

impl EngineReporter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            duration_ms: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    pub fn session_error(&self, error: SessionError) {
        tracing::error!("Session error: {}", error);
        self.emit(EngineEvent::SessionError(error));
    }

    pub fn stream_initialization_error(&self, error: &StreamInitError) {
        tracing::warn!("Stream initialization error: {}", error);
        self.emit(EngineEvent::StreamInitializationError {
            kind: error.kind(),
            message: error.to_string(),
        });
    }

    /// Streams report their progress here; only forward moves are published
    pub fn new_timestamp(&self, time_ms: i64) {
        let previous = self.duration_ms.fetch_max(time_ms, Ordering::SeqCst);
        if time_ms > previous {
            self.emit(EngineEvent::DurationChanged(time_ms));
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms.load(Ordering::SeqCst)
    }
}
