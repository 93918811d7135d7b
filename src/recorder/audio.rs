//! Audio stream: buffer queue and encoding thread body

use crate::capture::{AudioBuffer, AudioFormat};
use crate::recorder::codec::{AudioEncoder, EncodedPacket};
use crate::recorder::events::EngineReporter;
use crate::recorder::muxer::MuxerHandle;
use crate::recorder::worker::{StreamProcessor, StreamQueue, StreamWorker, WorkerPhase};
use crate::utils::{ErrorKind, SessionError};
use std::collections::VecDeque;
use std::sync::Arc;

pub type AudioWorker = StreamWorker<AudioQueue>;

/// Buffers waiting for the audio encoder, bounded by total duration
pub struct AudioQueue {
    buffers: VecDeque<AudioBuffer>,
    queued_duration_us: i64,
    max_duration_us: i64,
}

impl AudioQueue {
    pub fn new(max_duration_us: i64) -> Self {
        Self {
            buffers: VecDeque::new(),
            queued_duration_us: 0,
            max_duration_us,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn queued_duration_us(&self) -> i64 {
        self.queued_duration_us
    }
}

impl StreamQueue for AudioQueue {
    type Sample = AudioBuffer;
    type Item = AudioBuffer;

    fn push(&mut self, buffer: AudioBuffer) -> bool {
        self.queued_duration_us += buffer.duration();
        self.buffers.push_back(buffer);
        true
    }

    fn pop(&mut self) -> Option<AudioBuffer> {
        let buffer = self.buffers.pop_front()?;
        self.queued_duration_us -= buffer.duration();
        Some(buffer)
    }

    fn can_accept(&self, phase: WorkerPhase) -> bool {
        match phase {
            WorkerPhase::Encoding => {
                self.buffers.len() <= 1 || self.queued_duration_us < self.max_duration_us
            }
            WorkerPhase::Starting => self.buffers.is_empty(),
            WorkerPhase::Finished => false,
        }
    }
}

/// Encodes audio buffers; timestamps follow the number of frames written
pub struct AudioProcessor {
    encoder: AudioEncoder,
    format: AudioFormat,
    stream_index: usize,
    muxer: MuxerHandle,
    reporter: EngineReporter,
    frames_written: u64,
}

impl AudioProcessor {
    pub fn new(
        encoder: AudioEncoder,
        format: AudioFormat,
        stream_index: usize,
        muxer: MuxerHandle,
        reporter: EngineReporter,
    ) -> Self {
        Self {
            encoder,
            format,
            stream_index,
            muxer,
            reporter,
            frames_written: 0,
        }
    }

    fn send(&self, packets: Vec<EncodedPacket>) {
        for mut packet in packets {
            packet.stream_index = self.stream_index;
            self.muxer.send(packet);
        }
    }
}

impl StreamProcessor<AudioBuffer> for AudioProcessor {
    fn init(&mut self) -> Result<(), SessionError> {
        self.encoder.open().map_err(|e| {
            let error = SessionError::new(
                ErrorKind::ResourceError,
                format!("Could not open audio encoder: {}", e),
            );
            self.reporter.session_error(error.clone());
            error
        })
    }

    fn process(&mut self, buffer: AudioBuffer) {
        if *buffer.format() != self.format {
            tracing::warn!(
                "Audio buffer format {:?} differs from stream format {:?}, buffer skipped",
                buffer.format(),
                self.format
            );
            return;
        }

        let pts_us = self.format.duration_for_frames(self.frames_written);
        match self.encoder.encode(&buffer, pts_us) {
            Ok(packets) => self.send(packets),
            Err(e) => {
                self.reporter
                    .session_error(SessionError::new(ErrorKind::ResourceError, e.message));
                return;
            }
        }

        self.frames_written += buffer.frame_count();
        let end_us = self.format.duration_for_frames(self.frames_written);
        self.reporter.new_timestamp(end_us / 1_000);
    }

    fn cleanup(&mut self) {
        match self.encoder.flush() {
            Ok(packets) => self.send(packets),
            Err(e) => tracing::warn!("Audio encoder flush failed: {}", e),
        }
    }
}

pub fn audio_worker(
    format: AudioFormat,
    max_queue_duration_us: i64,
    processor: AudioProcessor,
) -> Arc<AudioWorker> {
    let worker = StreamWorker::new(
        format!("audio-encoder-{}hz", format.sample_rate),
        AudioQueue::new(max_queue_duration_us),
    );
    worker.set_processor(Box::new(processor));
    worker
}
