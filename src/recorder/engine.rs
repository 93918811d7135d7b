//! Recording engine
//!
//! Owns one stream worker per encoded stream plus the muxer. Lifecycle:
//!
//! ```text
//! Idle -> FormatsInitialization -> EncodersInitialization -> Encoding -> Finalization
//! ```
//!
//! Control methods run on the controller context. Worker notifications are
//! posted back there, so engine state is only touched from one place.

use crate::capture::{
    AudioBuffer, AudioBufferInput, AudioDeviceInput, AudioFormat, AudioSource, MediaSample,
    MediaSource, SourceId, VideoFrame, VideoFrameInput, TIME_BASE_US,
};
use crate::recorder::audio::{audio_worker, AudioProcessor, AudioWorker};
use crate::recorder::binding::connect_encoder_to_source;
use crate::recorder::codec::{CodecBackend, ContainerWriter, StreamDescription};
use crate::recorder::events::{EngineEvent, EngineReporter};
use crate::recorder::initializer::{EncodingTarget, SessionInitializer};
use crate::recorder::muxer::Muxer;
use crate::recorder::settings::{EncoderSettings, MediaMetadata};
use crate::recorder::state::RecordingResult;
use crate::recorder::video::{video_worker, VideoProcessor, VideoWorker};
use crate::recorder::worker::EncoderThread;
use crate::utils::{
    ContextHandle, ErrorKind, RecorderError, RecorderResult, SessionError, StreamInitError,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EngineState {
    Idle,
    FormatsInitialization,
    EncodersInitialization,
    Encoding,
    Finalization,
}

struct EngineInner {
    state: EngineState,
    initializer: Option<Arc<SessionInitializer>>,
    workers: Vec<Arc<dyn EncoderThread>>,
    initialized_workers: usize,
    auto_stop: bool,
    metadata: MediaMetadata,
    finalizer: Option<JoinHandle<()>>,
}

pub struct RecordingEngine {
    id: Uuid,
    settings: EncoderSettings,
    backend: Arc<dyn CodecBackend>,
    muxer: Muxer,
    reporter: EngineReporter,
    controller: ContextHandle,
    inner: Mutex<EngineInner>,
    this: Weak<RecordingEngine>,
}

impl RecordingEngine {
    pub fn new(
        settings: EncoderSettings,
        backend: Arc<dyn CodecBackend>,
        container: Box<dyn ContainerWriter>,
        controller: ContextHandle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id: Uuid::new_v4(),
            settings,
            backend,
            muxer: Muxer::new(container),
            reporter: EngineReporter::new(256),
            controller,
            inner: Mutex::new(EngineInner {
                state: EngineState::Idle,
                initializer: None,
                workers: Vec::new(),
                initialized_workers: 0,
                auto_stop: false,
                metadata: MediaMetadata::new(),
                finalizer: None,
            }),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> EngineState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.reporter.subscribe()
    }

    pub fn duration_ms(&self) -> i64 {
        self.reporter.duration_ms()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().workers.len()
    }

    /// A callback that runs `handler` on the controller context while the
    /// engine lives
    fn deferred(&self, handler: fn(&RecordingEngine)) -> impl Fn() + Send + Sync + 'static {
        let engine = self.this.clone();
        let controller = self.controller.clone();
        move || {
            let engine = engine.clone();
            controller.post(move || {
                if let Some(engine) = engine.upgrade() {
                    handler(&engine);
                }
            });
        }
    }

    /// Begin format negotiation for the given sources
    pub fn initialize(
        &self,
        audio_sources: Vec<AudioSource>,
        video_sources: Vec<Arc<VideoFrameInput>>,
    ) -> RecorderResult<()> {
        let initializer = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::Idle {
                return Err(RecorderError::InvalidState(format!(
                    "cannot initialize engine in state {:?}",
                    inner.state
                )));
            }

            let this = self.this.upgrade().ok_or_else(|| {
                RecorderError::InvalidState("engine is being dropped".to_string())
            })?;
            let target: Arc<dyn EncodingTarget> = this;
            let initializer = SessionInitializer::new(Arc::downgrade(&target), self.controller.clone());

            inner.state = EngineState::FormatsInitialization;
            inner.initializer = Some(initializer.clone());
            initializer
        };

        tracing::info!("Initializing recording engine {}", self.id);
        initializer.start(audio_sources, video_sources);
        Ok(())
    }

    fn is_accepting_streams(&self) -> bool {
        let state = self.state();
        if state != EngineState::FormatsInitialization {
            tracing::warn!("Stream offered in state {:?}, ignored", state);
            return false;
        }
        true
    }

    fn register_worker(&self, worker: Arc<dyn EncoderThread>) {
        let on_initialized = self.deferred(Self::handle_encoder_initialization);
        worker.initialized().connect_once(move |_| on_initialized());

        let on_end_of_stream = self.deferred(Self::handle_source_end_of_stream);
        worker.end_of_source_stream().connect(move |_| on_end_of_stream());

        let mut inner = self.inner.lock();
        if inner.auto_stop {
            worker.set_auto_stop(true);
        }
        inner.workers.push(worker);
    }

    fn create_audio_worker(
        &self,
        format: AudioFormat,
        source_id: SourceId,
        description: &'static str,
    ) -> Option<Arc<AudioWorker>> {
        let encoder_error = |message: String| StreamInitError::EncoderUnavailable {
            source_id,
            description,
            message,
        };

        let encoder = match self.backend.audio_encoder(&format, &self.settings) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.reporter.stream_initialization_error(&encoder_error(e.message));
                return None;
            }
        };

        let stream = StreamDescription::Audio {
            codec: self.settings.audio_codec,
            format,
        };
        let stream_index = match self.muxer.container().lock().add_stream(&stream) {
            Ok(index) => index,
            Err(e) => {
                self.reporter.stream_initialization_error(&encoder_error(e.to_string()));
                return None;
            }
        };

        let processor = AudioProcessor::new(
            encoder,
            format,
            stream_index,
            self.muxer.handle(),
            self.reporter.clone(),
        );
        let worker = audio_worker(
            format,
            self.settings.max_audio_queue_duration_us(),
            processor,
        );
        self.register_worker(worker.clone());

        tracing::info!(
            "Audio stream {} for {} {}: {} Hz, {} channels",
            stream_index,
            description,
            source_id,
            format.sample_rate,
            format.channel_count
        );
        Some(worker)
    }

    fn create_video_worker(
        &self,
        source: &VideoFrameInput,
        first_frame: Option<&VideoFrame>,
    ) -> Option<Arc<VideoWorker>> {
        let source_id = source.id();
        let format = match first_frame {
            Some(frame) => Some(*frame.format()),
            None => source.frame_format(),
        };
        let Some(mut format) = format.filter(|format| format.is_valid()) else {
            self.reporter
                .stream_initialization_error(&StreamInitError::FormatUnavailable {
                    source_id,
                    description: VideoFrameInput::DESCRIPTION,
                });
            return None;
        };

        if format.frame_rate <= 0.0 {
            if let Some(frame) = first_frame {
                if let (Some(start), Some(end)) = (frame.start_time(), frame.end_time()) {
                    if end > start {
                        format.frame_rate = TIME_BASE_US as f64 / (end - start) as f64;
                    }
                }
            }
        }

        let frame_rate = self.settings.effective_frame_rate(Some(format.frame_rate));
        if format.frame_rate <= 0.0 && self.settings.video_frame_rate.is_none() {
            tracing::warn!("Invalid frame rate for {}, using {}", source_id, frame_rate);
        }

        let resolution = self.settings.output_resolution(format.resolution);
        let settings = EncoderSettings {
            video_resolution: Some(resolution),
            ..self.settings.clone()
        };

        let encoder = match self.backend.video_encoder(&format, frame_rate, &settings) {
            Ok(encoder) => encoder,
            Err(e) => {
                self.reporter
                    .stream_initialization_error(&StreamInitError::EncoderUnavailable {
                        source_id,
                        description: VideoFrameInput::DESCRIPTION,
                        message: e.message,
                    });
                return None;
            }
        };

        let stream = StreamDescription::Video {
            codec: self.settings.video_codec,
            format,
            resolution,
            frame_rate,
        };
        let stream_index = match self.muxer.container().lock().add_stream(&stream) {
            Ok(index) => index,
            Err(e) => {
                self.reporter
                    .stream_initialization_error(&StreamInitError::EncoderUnavailable {
                        source_id,
                        description: VideoFrameInput::DESCRIPTION,
                        message: e.to_string(),
                    });
                return None;
            }
        };

        let processor = VideoProcessor::new(
            encoder,
            frame_rate,
            stream_index,
            self.muxer.handle(),
            self.reporter.clone(),
        );
        let worker = video_worker(self.settings.max_video_queue_size, processor);
        self.register_worker(worker.clone());

        tracing::info!(
            "Video stream {} for {}: {}x{} {:?} at {:.2} fps",
            stream_index,
            source_id,
            resolution.width,
            resolution.height,
            format.pixel_format,
            frame_rate
        );
        Some(worker)
    }

    /// Every stream thread has finished its setup: write the header and go
    fn handle_encoder_initialization(&self) {
        let workers = {
            let mut inner = self.inner.lock();
            if inner.state == EngineState::Finalization {
                // outdated notification
                return;
            }
            if inner.state != EngineState::EncodersInitialization {
                tracing::warn!("Encoder initialized in state {:?}", inner.state);
                return;
            }

            inner.initialized_workers += 1;
            if inner.initialized_workers < inner.workers.len() {
                return;
            }

            tracing::debug!("Encoders initialized; writing a header");
            let metadata = inner.metadata.clone();
            if let Err(e) = self.muxer.container().lock().write_header(&metadata) {
                tracing::warn!("Could not write header: {}", e);
                drop(inner);
                self.reporter.session_error(SessionError::new(
                    ErrorKind::ResourceError,
                    "Cannot start writing the stream",
                ));
                return;
            }

            if let Err(e) = self.muxer.start() {
                drop(inner);
                self.reporter
                    .session_error(SessionError::new(ErrorKind::ResourceError, e.to_string()));
                return;
            }

            inner.state = EngineState::Encoding;
            inner.workers.clone()
        };

        tracing::info!("Stream header written, encoding {} streams", workers.len());
        self.reporter.emit(EngineEvent::EncodingStarted);
        for worker in &workers {
            worker.start_encoding(true);
        }
    }

    fn handle_source_end_of_stream(&self) {
        let armed = {
            let inner = self.inner.lock();
            // Until formats are resolved the stream set is incomplete
            inner.auto_stop
                && !inner.workers.is_empty()
                && matches!(
                    inner.state,
                    EngineState::EncodersInitialization | EngineState::Encoding
                )
        };
        if armed && self.is_end_of_source_streams() {
            tracing::info!("All sources ended, auto-stopping");
            self.reporter.emit(EngineEvent::AutoStopped);
        }
    }

    pub fn is_end_of_source_streams(&self) -> bool {
        let workers = self.inner.lock().workers.clone();
        workers.iter().all(|worker| worker.is_end_of_source_stream())
    }

    pub fn set_paused(&self, paused: bool) {
        let workers = self.inner.lock().workers.clone();
        for worker in &workers {
            worker.set_paused(paused);
        }
    }

    pub fn set_auto_stop(&self, auto_stop: bool) {
        let workers = {
            let mut inner = self.inner.lock();
            inner.auto_stop = auto_stop;
            inner.workers.clone()
        };
        for worker in &workers {
            worker.set_auto_stop(auto_stop);
        }
        self.handle_source_end_of_stream();
    }

    /// Written with the header; later changes are ignored by the container
    pub fn set_metadata(&self, metadata: MediaMetadata) {
        self.inner.lock().metadata = metadata;
    }

    /// Progress report from a stream, in milliseconds
    pub fn new_timestamp(&self, time_ms: i64) {
        self.reporter.new_timestamp(time_ms);
    }

    /// Stop every stream and close the container on a finalizer thread.
    ///
    /// `FinalizationDone` is emitted when the container is closed.
    pub fn finalize(&self) -> RecorderResult<()> {
        let (initializer, workers, write_trailer) = {
            let mut inner = self.inner.lock();
            match inner.state {
                EngineState::FormatsInitialization
                | EngineState::EncodersInitialization
                | EngineState::Encoding => {}
                state => {
                    return Err(RecorderError::InvalidState(format!(
                        "cannot finalize engine in state {:?}",
                        state
                    )))
                }
            }

            let write_trailer = inner.state == EngineState::Encoding;
            if !write_trailer {
                for worker in &inner.workers {
                    worker.start_encoding(false);
                }
            }
            inner.state = EngineState::Finalization;
            (inner.initializer.take(), inner.workers.clone(), write_trailer)
        };

        tracing::info!("Finalizing recording engine {}", self.id);
        drop(initializer);

        for worker in &workers {
            worker.disconnect_source();
        }

        let this = self
            .this
            .upgrade()
            .ok_or_else(|| RecorderError::InvalidState("engine is being dropped".to_string()))?;
        let handle = std::thread::Builder::new()
            .name("encoding-finalizer".to_string())
            .spawn(move || this.run_finalizer(workers, write_trailer))?;
        self.inner.lock().finalizer = Some(handle);
        Ok(())
    }

    fn run_finalizer(&self, workers: Vec<Arc<dyn EncoderThread>>, write_trailer: bool) {
        for worker in &workers {
            worker.stop_and_join();
        }
        self.muxer.stop();

        let mut trailer_written = false;
        {
            let mut container = self.muxer.container().lock();
            if write_trailer {
                match container.write_trailer() {
                    Ok(()) => trailer_written = true,
                    Err(e) => {
                        tracing::warn!("Could not write trailer: {}", e);
                        self.reporter.session_error(SessionError::new(
                            ErrorKind::FormatError,
                            format!("Cannot write trailer: {}", e),
                        ));
                    }
                }
            }

            // close before announcing completion
            if let Err(e) = container.close() {
                tracing::warn!("Could not close container: {}", e);
            }
        }

        let result = RecordingResult {
            recording_id: self.id,
            finished_at: Utc::now(),
            duration_ms: self.reporter.duration_ms(),
            stream_count: workers.len(),
            packets_written: self.muxer.packets_written(),
            trailer_written,
        };

        tracing::info!(
            "Done finalizing: {} streams, {} packets, {} ms",
            result.stream_count,
            result.packets_written,
            result.duration_ms
        );
        self.reporter.emit(EngineEvent::FinalizationDone(result));
    }

    /// Block until the finalizer thread has exited
    pub fn wait_for_finalization(&self) {
        let handle = self.inner.lock().finalizer.take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Finalizer thread panicked");
            }
        }
    }
}

impl EncodingTarget for RecordingEngine {
    fn add_audio_input(&self, input: &Arc<AudioDeviceInput>) {
        if !self.is_accepting_streams() {
            return;
        }

        let Some(device) = input.device() else {
            self.reporter
                .stream_initialization_error(&StreamInitError::NoAudioDevice);
            return;
        };

        let format = device.preferred_format;
        if !format.is_valid() {
            self.reporter
                .stream_initialization_error(&StreamInitError::InvalidDeviceFormat);
            return;
        }

        let Some(worker) = self.create_audio_worker(format, input.id(), AudioDeviceInput::DESCRIPTION)
        else {
            return;
        };
        if let Err(e) = connect_encoder_to_source(&worker, input) {
            tracing::warn!("Cannot bind {}: {}", input.id(), e);
            return;
        }
        input.set_running(true);
    }

    fn add_audio_buffer_input(&self, input: &Arc<AudioBufferInput>, first_buffer: Option<AudioBuffer>) {
        if !self.is_accepting_streams() {
            return;
        }

        let first_buffer = first_buffer.filter(|buffer| buffer.is_valid());
        let format = match &first_buffer {
            Some(buffer) => Some(*buffer.format()),
            None => input.audio_format(),
        };
        let Some(format) = format.filter(|format| format.is_valid()) else {
            self.reporter
                .stream_initialization_error(&StreamInitError::FormatUnavailable {
                    source_id: input.id(),
                    description: AudioBufferInput::DESCRIPTION,
                });
            return;
        };

        let Some(worker) = self.create_audio_worker(format, input.id(), AudioBufferInput::DESCRIPTION)
        else {
            return;
        };

        // enqueue before wiring so it cannot race with the source
        if let Some(buffer) = first_buffer {
            worker.add_sample(buffer);
        }
        if let Err(e) = connect_encoder_to_source(&worker, input) {
            tracing::warn!("Cannot bind {}: {}", input.id(), e);
        }
    }

    fn add_video_source(&self, source: &Arc<VideoFrameInput>, first_frame: Option<VideoFrame>) {
        if !self.is_accepting_streams() {
            return;
        }

        let first_frame = first_frame.filter(|frame| frame.is_valid());
        let Some(worker) = self.create_video_worker(source, first_frame.as_ref()) else {
            return;
        };

        if let Some(frame) = first_frame {
            worker.add_sample(frame);
        }
        if let Err(e) = connect_encoder_to_source(&worker, source) {
            tracing::warn!("Cannot bind {}: {}", source.id(), e);
        }
    }

    fn handle_formats_initialization(&self) {
        let (initializer, workers) = {
            let mut inner = self.inner.lock();
            if inner.state != EngineState::FormatsInitialization {
                tracing::warn!("Formats resolved in state {:?}, ignored", inner.state);
                return;
            }

            let initializer = inner.initializer.take();
            if inner.workers.is_empty() {
                drop(inner);
                drop(initializer);
                self.reporter.session_error(SessionError::new(
                    ErrorKind::ResourceError,
                    "No valid stream found for encoding",
                ));
                return;
            }

            inner.state = EngineState::EncodersInitialization;
            (initializer, inner.workers.clone())
        };
        drop(initializer);

        tracing::info!("Starting {} stream threads", workers.len());
        for worker in workers {
            let name = worker.name().to_string();
            if let Err(e) = worker.start_thread() {
                self.reporter.session_error(SessionError::new(
                    ErrorKind::ResourceError,
                    format!("Cannot start {}: {}", name, e),
                ));
            }
        }

        // Sources may have ended while others were still resolving
        self.handle_source_end_of_stream();
    }

    fn stream_initialization_error(&self, error: StreamInitError) {
        self.reporter.stream_initialization_error(&error);
    }
}

impl Drop for RecordingEngine {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state == EngineState::Finalization || inner.workers.is_empty() {
            return;
        }

        tracing::warn!("Recording engine {} dropped without finalize", self.id);
        inner.initializer = None;
        for worker in &inner.workers {
            worker.disconnect_source();
            worker.start_encoding(false);
            worker.stop_and_join();
        }
    }
}
