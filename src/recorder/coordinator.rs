//! Recording coordinator
//!
//! Drives one recording engine through a recording: start, pause/resume
//! cycles and stop, and keeps the per-session timing.

use super::codec::{CodecBackend, ContainerWriter};
use super::engine::{EngineState, RecordingEngine};
use super::events::EngineEvent;
use super::settings::RecordingConfig;
use super::state::{RecordingResult, RecordingSession, RecordingState};
use crate::capture::{AudioSource, VideoFrameInput};
use crate::utils::{ContextHandle, EventLoop, RecorderError, RecorderResult};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};

/// Events emitted during recording
#[derive(Debug, Clone)]
pub enum RecordingEvent {
    /// Recording started
    Started,
    /// Recording stopped, on request or because every source ended
    Stopped,
    /// Recording paused
    Paused,
    /// Recording resumed
    Resumed,
    /// Error occurred
    Error(String),
}

/// Manages the engine of the current recording
pub struct RecordingCoordinator {
    /// Current recording state
    state: Arc<RwLock<RecordingState>>,

    /// Engine of the recording in progress
    engine: Option<Arc<RecordingEngine>>,

    /// Context the engine is controlled from
    controller: Option<ContextHandle>,

    /// Recording sessions (one per pause/resume cycle)
    sessions: Arc<RwLock<Vec<RecordingSession>>>,

    /// Current session index
    current_session: usize,

    /// Time when recording started (for process time calculation)
    start_time: Option<Instant>,

    /// Resolved by the engine watch once the container is closed
    finished: Option<oneshot::Receiver<RecordingResult>>,

    /// Event broadcaster
    event_tx: broadcast::Sender<RecordingEvent>,
}

impl RecordingCoordinator {
    /// Create a new recording coordinator
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            state: Arc::new(RwLock::new(RecordingState::Idle)),
            engine: None,
            controller: None,
            sessions: Arc::new(RwLock::new(Vec::new())),
            current_session: 0,
            start_time: None,
            finished: None,
            event_tx,
        }
    }

    /// Get the current recording state
    pub fn state(&self) -> RecordingState {
        *self.state.read()
    }

    pub fn engine_state(&self) -> Option<EngineState> {
        self.engine.as_ref().map(|engine| engine.state())
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.event_tx.subscribe()
    }

    /// Subscribe to the current engine's events
    pub fn engine_events(&self) -> Option<broadcast::Receiver<EngineEvent>> {
        self.engine.as_ref().map(|engine| engine.subscribe())
    }

    pub fn sessions(&self) -> Vec<RecordingSession> {
        self.sessions.read().clone()
    }

    /// Get the current process time in milliseconds
    fn process_time_ms(&self) -> f64 {
        self.start_time
            .map(|t| t.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Start recording.
    ///
    /// Must be called from within a tokio runtime. Engine control runs on a
    /// dedicated controller thread; this returns once initialization has
    /// been handed to it. With `auto_stop` set, the recording stops by
    /// itself once every source has ended.
    pub fn start(
        &mut self,
        config: RecordingConfig,
        audio_sources: Vec<AudioSource>,
        video_sources: Vec<Arc<VideoFrameInput>>,
        backend: Arc<dyn CodecBackend>,
        container: Box<dyn ContainerWriter>,
    ) -> RecorderResult<()> {
        let current_state = *self.state.read();
        if current_state != RecordingState::Idle {
            return Err(RecorderError::InvalidState("already recording".to_string()));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RecorderError::InvalidState("recording needs a tokio runtime".to_string())
        })?;

        tracing::info!(
            "Starting recording with {} audio and {} video sources",
            audio_sources.len(),
            video_sources.len()
        );

        // The loop thread exits once the engine and every source drop their handles
        let (controller, _thread) = EventLoop::spawn("recording-controller")?;

        let engine = RecordingEngine::new(config.settings, backend, container, controller.clone());
        let engine_events = engine.subscribe();
        engine.set_metadata(config.metadata);
        engine.set_auto_stop(config.auto_stop);

        let initializing = engine.clone();
        let posted = controller.post(move || {
            if let Err(e) = initializing.initialize(audio_sources, video_sources) {
                tracing::error!("Engine initialization failed: {}", e);
            }
        });
        if !posted {
            return Err(RecorderError::InvalidState(
                "controller thread is not running".to_string(),
            ));
        }

        let start_time = Instant::now();
        {
            let mut sessions = self.sessions.write();
            sessions.clear();
            // Create first session
            sessions.push(RecordingSession::new(0, 0.0));
        }

        let (finished_tx, finished_rx) = oneshot::channel();
        let watch = EngineWatch {
            engine: Arc::downgrade(&engine),
            controller: controller.clone(),
            state: self.state.clone(),
            sessions: self.sessions.clone(),
            start_time,
            event_tx: self.event_tx.clone(),
            finished: finished_tx,
        };

        self.engine = Some(engine);
        self.controller = Some(controller);
        self.start_time = Some(start_time);
        self.current_session = 0;
        self.finished = Some(finished_rx);

        *self.state.write() = RecordingState::Recording;
        let _ = self.event_tx.send(RecordingEvent::Started);
        runtime.spawn(watch.run(engine_events));

        tracing::info!("Recording started");
        Ok(())
    }

    /// Stop recording and wait for the container to be closed
    pub async fn stop(&mut self) -> RecorderResult<RecordingResult> {
        let current_state = *self.state.read();
        if current_state != RecordingState::Recording && current_state != RecordingState::Paused {
            return Err(RecorderError::InvalidState("not recording".to_string()));
        }

        let (Some(engine), Some(controller)) = (self.engine.take(), self.controller.take()) else {
            return Err(RecorderError::InvalidState("no engine".to_string()));
        };
        let finished = self.finished.take();

        tracing::info!("Stopping recording");

        // End current session
        if current_state == RecordingState::Recording {
            let end_time = self.process_time_ms();
            if let Some(session) = self.sessions.write().last_mut() {
                session.end(end_time);
            }
        }

        // Queued behind initialization so the engine never sees stop first
        let (done_tx, done_rx) = oneshot::channel();
        let finalizing = engine.clone();
        controller.post(move || {
            let _ = done_tx.send(finalizing.finalize());
        });
        let finalized = done_rx.await.unwrap_or_else(|_| {
            Err(RecorderError::InvalidState(
                "controller thread is not running".to_string(),
            ))
        });
        if let Err(e) = finalized {
            // An auto-stop may have begun finalizing first
            if engine.state() != EngineState::Finalization {
                let _ = self.event_tx.send(RecordingEvent::Error(e.to_string()));
                *self.state.write() = RecordingState::Idle;
                return Err(e);
            }
        }

        let result = match finished {
            Some(finished) => finished.await.ok(),
            None => None,
        };
        let Some(result) = result else {
            *self.state.write() = RecordingState::Idle;
            return Err(RecorderError::InvalidState(
                "engine closed before finalization".to_string(),
            ));
        };

        self.start_time = None;
        Ok(result)
    }

    /// Pause recording
    pub fn pause(&mut self) -> RecorderResult<()> {
        let current_state = *self.state.read();
        if current_state != RecordingState::Recording {
            return Err(RecorderError::InvalidState("not recording".to_string()));
        }

        tracing::info!("Pausing recording");

        // End current session
        let end_time = self.process_time_ms();
        if let Some(session) = self.sessions.write().last_mut() {
            session.end(end_time);
        }

        if let Some(engine) = &self.engine {
            engine.set_paused(true);
        }

        *self.state.write() = RecordingState::Paused;
        let _ = self.event_tx.send(RecordingEvent::Paused);

        Ok(())
    }

    /// Resume recording
    pub fn resume(&mut self) -> RecorderResult<()> {
        let current_state = *self.state.read();
        if current_state != RecordingState::Paused {
            return Err(RecorderError::InvalidState("not paused".to_string()));
        }

        tracing::info!("Resuming recording");

        // Create new session
        self.current_session += 1;
        let session = RecordingSession::new(self.current_session, self.process_time_ms());
        self.sessions.write().push(session);

        if let Some(engine) = &self.engine {
            engine.set_paused(false);
        }

        *self.state.write() = RecordingState::Recording;
        let _ = self.event_tx.send(RecordingEvent::Resumed);

        Ok(())
    }

    /// Wall-clock recording time in milliseconds, pauses excluded
    pub fn duration_ms(&self) -> f64 {
        let now = self.process_time_ms();
        self.sessions
            .read()
            .iter()
            .map(|s| {
                if s.is_open() {
                    now - s.process_time_start_ms
                } else {
                    s.duration_ms
                }
            })
            .sum()
    }
}

impl Default for RecordingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Follows one engine's events until its container is closed.
///
/// Finalizes the engine when it auto-stops, and moves the coordinator to
/// its stopped state however finalization was triggered.
struct EngineWatch {
    engine: Weak<RecordingEngine>,
    controller: ContextHandle,
    state: Arc<RwLock<RecordingState>>,
    sessions: Arc<RwLock<Vec<RecordingSession>>>,
    start_time: Instant,
    event_tx: broadcast::Sender<RecordingEvent>,
    finished: oneshot::Sender<RecordingResult>,
}

impl EngineWatch {
    async fn run(self, mut events: broadcast::Receiver<EngineEvent>) {
        loop {
            match events.recv().await {
                Ok(EngineEvent::AutoStopped) => self.finalize_engine(),
                Ok(EngineEvent::SessionError(error)) => {
                    let _ = self.event_tx.send(RecordingEvent::Error(error.to_string()));
                }
                Ok(EngineEvent::FinalizationDone(result)) => {
                    self.complete(result);
                    return;
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    tracing::debug!("Engine dropped before finalization");
                    return;
                }
            }
        }
    }

    fn finalize_engine(&self) {
        tracing::info!("Every source ended, stopping recording");
        let engine = self.engine.clone();
        self.controller.post(move || {
            let Some(engine) = engine.upgrade() else {
                return;
            };
            // Already finalizing when a stop request got there first
            if let Err(e) = engine.finalize() {
                tracing::debug!("Auto-stop finalize skipped: {}", e);
            }
        });
    }

    fn complete(self, result: RecordingResult) {
        let end_time = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let (wall_ms, session_count) = {
            let mut sessions = self.sessions.write();
            if let Some(session) = sessions.last_mut() {
                session.end(end_time);
            }
            (sessions.iter().map(|s| s.duration_ms).sum::<f64>(), sessions.len())
        };

        *self.state.write() = RecordingState::Complete;
        let _ = self.event_tx.send(RecordingEvent::Stopped);
        *self.state.write() = RecordingState::Idle;

        tracing::info!(
            "Recording stopped. Duration: {}ms ({}ms across {} sessions)",
            result.duration_ms,
            wall_ms,
            session_count
        );
        let _ = self.finished.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{AudioBuffer, AudioBufferInput, AudioFormat, SampleFormat};
    use crate::testing::{wait_until, FakeBackend, MemoryContainer};
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn format() -> AudioFormat {
        AudioFormat::new(48_000, 1, SampleFormat::I16)
    }

    #[tokio::test]
    async fn test_record_pause_resume_stop() {
        crate::utils::logging::init();
        let capture_loop = EventLoop::new();
        let input = Arc::new(AudioBufferInput::new(capture_loop.handle(), Some(format())));
        let (container, record) = MemoryContainer::new();

        let mut coordinator = RecordingCoordinator::new();
        let mut events = coordinator.subscribe();
        coordinator
            .start(
                RecordingConfig::default(),
                vec![AudioSource::Buffer(input.clone())],
                Vec::new(),
                Arc::new(FakeBackend::default()),
                Box::new(container),
            )
            .unwrap();
        assert_eq!(coordinator.state(), RecordingState::Recording);
        assert!(wait_until(TIMEOUT, || {
            coordinator.engine_state() == Some(EngineState::Encoding)
        }));
        assert!(wait_until(TIMEOUT, || input.can_push_frame()));

        // 20 ms
        input.push_buffer(AudioBuffer::new(format(), vec![0u8; 1920], 0));

        coordinator.pause().unwrap();
        assert!(!input.can_push_frame());
        input.push_buffer(AudioBuffer::new(format(), vec![0u8; 1920], 0));
        coordinator.resume().unwrap();
        assert_eq!(coordinator.sessions().len(), 2);
        assert!(!coordinator.sessions()[0].is_open());
        assert!(coordinator.sessions()[1].is_open());

        let result = coordinator.stop().await.unwrap();
        assert_eq!(coordinator.state(), RecordingState::Idle);
        assert_eq!(result.duration_ms, 20);
        assert!(result.trailer_written);
        assert!(record.lock().closed);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(format!("{:?}", event));
        }
        assert_eq!(seen, vec!["Started", "Paused", "Resumed", "Stopped"]);
    }

    #[tokio::test]
    async fn test_state_checks() {
        let mut coordinator = RecordingCoordinator::new();
        assert!(coordinator.pause().is_err());
        assert!(coordinator.resume().is_err());
        assert!(coordinator.stop().await.is_err());
        assert_eq!(coordinator.duration_ms(), 0.0);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let capture_loop = EventLoop::new();
        let input = Arc::new(AudioBufferInput::new(capture_loop.handle(), Some(format())));
        let mut coordinator = RecordingCoordinator::new();

        let start = |coordinator: &mut RecordingCoordinator| {
            let (container, _) = MemoryContainer::new();
            coordinator.start(
                RecordingConfig::default(),
                vec![AudioSource::Buffer(input.clone())],
                Vec::new(),
                Arc::new(FakeBackend::default()),
                Box::new(container),
            )
        };

        start(&mut coordinator).unwrap();
        assert!(matches!(
            start(&mut coordinator),
            Err(RecorderError::InvalidState(_))
        ));
        coordinator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_stop_ends_recording_when_sources_end() {
        let capture_loop = EventLoop::new();
        let input = Arc::new(AudioBufferInput::new(capture_loop.handle(), Some(format())));
        let (container, record) = MemoryContainer::new();

        let mut coordinator = RecordingCoordinator::new();
        let mut events = coordinator.subscribe();
        coordinator
            .start(
                RecordingConfig {
                    auto_stop: true,
                    ..RecordingConfig::default()
                },
                vec![AudioSource::Buffer(input.clone())],
                Vec::new(),
                Arc::new(FakeBackend::default()),
                Box::new(container),
            )
            .unwrap();
        assert!(wait_until(TIMEOUT, || input.can_push_frame()));
        assert_eq!(coordinator.state(), RecordingState::Recording);

        input.push_buffer(AudioBuffer::new(format(), vec![0u8; 1920], 0));
        input.push_buffer(AudioBuffer::end_of_stream());

        let mut seen = Vec::new();
        let stopped = tokio::time::timeout(TIMEOUT, async {
            loop {
                match events.recv().await {
                    Ok(RecordingEvent::Stopped) => {
                        seen.push("Stopped".to_string());
                        return;
                    }
                    Ok(event) => seen.push(format!("{:?}", event)),
                    Err(_) => return,
                }
            }
        })
        .await;
        assert!(stopped.is_ok());
        assert_eq!(seen, vec!["Started", "Stopped"]);

        assert_eq!(coordinator.state(), RecordingState::Idle);
        assert!(!coordinator.sessions()[0].is_open());
        let record = record.lock();
        assert!(record.trailer_written);
        assert!(record.closed);
        drop(record);

        // Nothing left to stop
        assert!(coordinator.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_before_sources_end_with_auto_stop() {
        let capture_loop = EventLoop::new();
        let input = Arc::new(AudioBufferInput::new(capture_loop.handle(), Some(format())));
        let (container, record) = MemoryContainer::new();

        let mut coordinator = RecordingCoordinator::new();
        coordinator
            .start(
                RecordingConfig {
                    auto_stop: true,
                    ..RecordingConfig::default()
                },
                vec![AudioSource::Buffer(input.clone())],
                Vec::new(),
                Arc::new(FakeBackend::default()),
                Box::new(container),
            )
            .unwrap();
        // No stream exists yet, so this must not count as every source ending
        assert_eq!(coordinator.state(), RecordingState::Recording);

        let result = coordinator.stop().await.unwrap();
        assert_eq!(result.duration_ms, 0);
        assert!(record.lock().closed);
        assert_eq!(coordinator.state(), RecordingState::Idle);
    }

    #[test]
    fn test_start_needs_runtime() {
        let capture_loop = EventLoop::new();
        let input = Arc::new(AudioBufferInput::new(capture_loop.handle(), Some(format())));
        let (container, _) = MemoryContainer::new();

        let mut coordinator = RecordingCoordinator::new();
        let started = coordinator.start(
            RecordingConfig::default(),
            vec![AudioSource::Buffer(input)],
            Vec::new(),
            Arc::new(FakeBackend::default()),
            Box::new(container),
        );
        assert!(matches!(started, Err(RecorderError::InvalidState(_))));
        assert_eq!(coordinator.state(), RecordingState::Idle);
    }
}
