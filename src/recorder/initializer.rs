//! Session start-up: wait until every source's format is known
//!
//! Sources whose format is known go straight to the engine. The others stay
//! pending until their first sample arrives, they end, fail or are destroyed.
//! Each pending source leaves the set through exactly one of those paths,
//! and the engine is started once the set drains.
//!
//! Source events arrive on the producers' threads and are posted to the
//! controller context, where all bookkeeping happens.

use crate::capture::{
    AdmissionControl, AudioBuffer, AudioBufferInput, AudioDeviceInput, AudioSource, MediaSample,
    MediaSource, SourceCore, SourceId, VideoFrame, VideoFrameInput,
};
use crate::recorder::binding::set_admission_control;
use crate::utils::{ConnectionId, ContextHandle, StreamInitError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// What the initializer needs from the engine
pub trait EncodingTarget: Send + Sync {
    fn add_audio_input(&self, input: &Arc<AudioDeviceInput>);

    /// `first_buffer` is enqueued before the source is wired
    fn add_audio_buffer_input(&self, input: &Arc<AudioBufferInput>, first_buffer: Option<AudioBuffer>);

    fn add_video_source(&self, source: &Arc<VideoFrameInput>, first_frame: Option<VideoFrame>);

    /// Every source is resolved; build and start the streams
    fn handle_formats_initialization(&self);

    fn stream_initialization_error(&self, error: StreamInitError);
}

/// Gate installed on a pending source: lets exactly one sample through
#[derive(Default)]
struct PendingGate {
    sample_seen: AtomicBool,
}

impl AdmissionControl for PendingGate {
    fn can_push_frame(&self) -> bool {
        !self.sample_seen.load(Ordering::SeqCst)
    }
}

enum PendingSource {
    Audio(Weak<AudioBufferInput>),
    Video(Weak<VideoFrameInput>),
}

struct PendingEntry {
    source: PendingSource,
    _gate: Arc<PendingGate>,
    detach: Box<dyn FnOnce() + Send>,
}

/// Posts handlers into the controller context while the initializer lives
#[derive(Clone)]
struct Poster {
    initializer: Weak<SessionInitializer>,
    controller: ContextHandle,
}

impl Poster {
    fn post<F>(&self, handler: F)
    where
        F: FnOnce(&SessionInitializer) + Send + 'static,
    {
        let initializer = self.initializer.clone();
        self.controller.post(move || {
            if let Some(initializer) = initializer.upgrade() {
                handler(&initializer);
            }
        });
    }
}

pub struct SessionInitializer {
    target: Weak<dyn EncodingTarget>,
    controller: ContextHandle,
    pending: Mutex<HashMap<SourceId, PendingEntry>>,
    registration_complete: AtomicBool,
    engine_started: AtomicBool,
}

impl SessionInitializer {
    pub fn new(target: Weak<dyn EncodingTarget>, controller: ContextHandle) -> Arc<Self> {
        Arc::new(Self {
            target,
            controller,
            pending: Mutex::new(HashMap::new()),
            registration_complete: AtomicBool::new(false),
            engine_started: AtomicBool::new(false),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: SourceId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn is_engine_started(&self) -> bool {
        self.engine_started.load(Ordering::SeqCst)
    }

    pub fn start(self: &Arc<Self>, audio_sources: Vec<AudioSource>, video_sources: Vec<Arc<VideoFrameInput>>) {
        let Some(target) = self.target.upgrade() else {
            tracing::warn!("Recording engine gone before initialization");
            return;
        };

        tracing::info!(
            "Initializing {} audio and {} video sources",
            audio_sources.len(),
            video_sources.len()
        );

        for source in audio_sources {
            match source {
                AudioSource::Device(input) => target.add_audio_input(&input),
                AudioSource::Buffer(input) => {
                    if input.audio_format().is_some_and(|format| format.is_valid()) {
                        target.add_audio_buffer_input(&input, None);
                    } else {
                        self.add_pending_audio(input);
                    }
                }
            }
        }

        for source in video_sources {
            if let Some(message) = source.error_string() {
                target.stream_initialization_error(StreamInitError::SourceError {
                    source_id: source.id(),
                    description: VideoFrameInput::DESCRIPTION,
                    message,
                });
            } else if !source.is_active() {
                target.stream_initialization_error(StreamInitError::FormatUnavailable {
                    source_id: source.id(),
                    description: VideoFrameInput::DESCRIPTION,
                });
            } else if source.frame_format().is_some_and(|format| format.is_valid()) {
                target.add_video_source(&source, None);
            } else {
                self.add_pending_video(source);
            }
        }

        self.registration_complete.store(true, Ordering::SeqCst);
        drop(target);

        let pending = self.pending_count();
        if pending > 0 {
            tracing::info!("Waiting for the format of {} sources", pending);
        }
        self.try_start_engine();
    }

    fn poster(self: &Arc<Self>) -> Poster {
        Poster {
            initializer: Arc::downgrade(self),
            controller: self.controller.clone(),
        }
    }

    fn connect_destroyed<S: MediaSample>(self: &Arc<Self>, core: &SourceCore<S>) -> ConnectionId {
        let poster = self.poster();
        core.destroyed().connect(move |id| {
            let id = *id;
            poster.post(move |this| this.on_source_destroyed(id));
        })
    }

    fn install_gate<Src: MediaSource>(source: &Arc<Src>) -> Arc<PendingGate> {
        let gate = Arc::new(PendingGate::default());
        let control: Arc<dyn AdmissionControl> = gate.clone();
        set_admission_control(source, Some(Arc::downgrade(&control)));
        gate
    }

    fn add_pending_audio(self: &Arc<Self>, input: Arc<AudioBufferInput>) {
        let id = input.id();
        let gate = Self::install_gate(&input);

        let poster = self.poster();
        let sample_gate = gate.clone();
        let sample_connection = input.core().new_sample().connect_once(move |buffer| {
            sample_gate.sample_seen.store(true, Ordering::SeqCst);
            let buffer = buffer.clone();
            poster.post(move |this| this.on_first_audio_buffer(id, buffer));
        });
        let destroyed_connection = self.connect_destroyed(input.core());

        let weak = Arc::downgrade(&input);
        let detach = move || {
            if let Some(input) = weak.upgrade() {
                input.core().new_sample().disconnect(sample_connection);
                input.core().destroyed().disconnect(destroyed_connection);
                set_admission_control(&input, None);
            }
        };

        tracing::debug!("{} {} pending format", AudioBufferInput::DESCRIPTION, id);
        self.pending.lock().insert(
            id,
            PendingEntry {
                source: PendingSource::Audio(Arc::downgrade(&input)),
                _gate: gate,
                detach: Box::new(detach),
            },
        );
    }

    fn add_pending_video(self: &Arc<Self>, source: Arc<VideoFrameInput>) {
        let id = source.id();
        let gate = Self::install_gate(&source);

        let poster = self.poster();
        let sample_gate = gate.clone();
        let sample_connection = source.core().new_sample().connect_once(move |frame| {
            sample_gate.sample_seen.store(true, Ordering::SeqCst);
            let frame = frame.clone();
            poster.post(move |this| this.on_first_video_frame(id, frame));
        });

        let poster = self.poster();
        let deactivated_connection = source.connect_deactivated(move || {
            poster.post(move |this| this.on_first_video_frame(id, VideoFrame::end_of_stream()));
        });

        let poster = self.poster();
        let error_connection = source.error_changed().connect(move |error| {
            if let Some(message) = error.clone() {
                poster.post(move |this| this.on_source_error(id, message));
            }
        });

        let destroyed_connection = self.connect_destroyed(source.core());

        let weak = Arc::downgrade(&source);
        let detach = move || {
            if let Some(source) = weak.upgrade() {
                source.core().new_sample().disconnect(sample_connection);
                if let Some(connection) = deactivated_connection {
                    source.disconnect_deactivated(connection);
                }
                source.error_changed().disconnect(error_connection);
                source.core().destroyed().disconnect(destroyed_connection);
                set_admission_control(&source, None);
            }
        };

        tracing::debug!("{} {} pending format", VideoFrameInput::DESCRIPTION, id);
        self.pending.lock().insert(
            id,
            PendingEntry {
                source: PendingSource::Video(Arc::downgrade(&source)),
                _gate: gate,
                detach: Box::new(detach),
            },
        );
    }

    /// Remove `id` and sever its wiring. `None` if it was already removed.
    fn take_pending(&self, id: SourceId) -> Option<PendingSource> {
        let entry = self.pending.lock().remove(&id)?;
        (entry.detach)();
        Some(entry.source)
    }

    fn on_first_audio_buffer(&self, id: SourceId, buffer: AudioBuffer) {
        let Some(PendingSource::Audio(source)) = self.take_pending(id) else {
            return;
        };

        if let (Some(source), Some(target)) = (source.upgrade(), self.target.upgrade()) {
            if buffer.is_valid() {
                tracing::debug!("Audio format of {} resolved: {:?}", id, buffer.format());
                target.add_audio_buffer_input(&source, Some(buffer));
            } else {
                target.stream_initialization_error(StreamInitError::FormatUnavailable {
                    source_id: id,
                    description: AudioBufferInput::DESCRIPTION,
                });
            }
        }

        self.try_start_engine();
    }

    fn on_first_video_frame(&self, id: SourceId, frame: VideoFrame) {
        let Some(PendingSource::Video(source)) = self.take_pending(id) else {
            return;
        };

        if let (Some(source), Some(target)) = (source.upgrade(), self.target.upgrade()) {
            if frame.is_valid() {
                tracing::debug!("Video format of {} resolved: {:?}", id, frame.format());
                target.add_video_source(&source, Some(frame));
            } else {
                target.stream_initialization_error(StreamInitError::FormatUnavailable {
                    source_id: id,
                    description: VideoFrameInput::DESCRIPTION,
                });
            }
        }

        self.try_start_engine();
    }

    fn on_source_error(&self, id: SourceId, message: String) {
        let Some(source) = self.take_pending(id) else {
            return;
        };

        let description = match source {
            PendingSource::Audio(_) => AudioBufferInput::DESCRIPTION,
            PendingSource::Video(_) => VideoFrameInput::DESCRIPTION,
        };
        if let Some(target) = self.target.upgrade() {
            target.stream_initialization_error(StreamInitError::SourceError {
                source_id: id,
                description,
                message,
            });
        }

        self.try_start_engine();
    }

    fn on_source_destroyed(&self, id: SourceId) {
        if self.take_pending(id).is_some() {
            tracing::debug!("Pending source {} destroyed", id);
            self.try_start_engine();
        }
    }

    fn try_start_engine(&self) {
        if !self.registration_complete.load(Ordering::SeqCst) || !self.pending.lock().is_empty() {
            return;
        }
        if self.engine_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(target) = self.target.upgrade() {
            tracing::info!("All source formats resolved, starting engine");
            target.handle_formats_initialization();
        }
    }
}

impl Drop for SessionInitializer {
    fn drop(&mut self) {
        let pending: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, entry)| entry).collect();
        if !pending.is_empty() {
            tracing::debug!("Initializer dropped with {} sources pending", pending.len());
        }
        for entry in pending {
            (entry.detach)();
        }
    }
}
