//! Video stream: frame queue, timeline and encoding thread body

use crate::capture::{VideoFrame, TIME_BASE_US};
use crate::recorder::codec::{EncodedPacket, VideoEncoder};
use crate::recorder::events::EngineReporter;
use crate::recorder::muxer::MuxerHandle;
use crate::recorder::worker::{StreamProcessor, StreamQueue, StreamWorker, WorkerPhase};
use crate::utils::{ErrorKind, SessionError};
use std::collections::VecDeque;
use std::sync::Arc;

pub type VideoWorker = StreamWorker<VideoQueue>;

pub struct QueuedFrame {
    pub frame: VideoFrame,

    /// First frame after a pause; the timeline skips the gap before it
    pub adjust_time_base: bool,
}

/// Frames waiting for the video encoder, bounded by count
pub struct VideoQueue {
    frames: VecDeque<QueuedFrame>,
    max_size: usize,
    adjust_next: bool,
}

impl VideoQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_size: max_size.max(1),
            adjust_next: false,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl StreamQueue for VideoQueue {
    type Sample = VideoFrame;
    type Item = QueuedFrame;

    /// Drops the frame when the encoder cannot keep up
    fn push(&mut self, frame: VideoFrame) -> bool {
        if self.frames.len() >= self.max_size {
            return false;
        }

        self.frames.push_back(QueuedFrame {
            frame,
            adjust_time_base: self.adjust_next,
        });
        self.adjust_next = false;
        true
    }

    fn skip_paused(&mut self) {
        self.adjust_next = true;
    }

    fn pop(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    fn can_accept(&self, phase: WorkerPhase) -> bool {
        match phase {
            WorkerPhase::Encoding => self.frames.len() < self.max_size,
            WorkerPhase::Starting => self.frames.is_empty(),
            WorkerPhase::Finished => false,
        }
    }
}

/// Maps source frame times onto the output timeline
#[derive(Debug, Clone)]
pub struct VideoTimeline {
    frame_rate: f64,
    base_time: i64,
    last_frame_end: i64,
}

impl VideoTimeline {
    pub fn new(frame_rate: f64) -> Self {
        Self {
            frame_rate,
            base_time: 0,
            last_frame_end: 0,
        }
    }

    /// Start and end of `frame`, filling in whatever the source left out
    pub fn frame_times(&self, frame: &VideoFrame) -> (i64, i64) {
        let (start, end) = match frame.start_time() {
            Some(start) => (start, frame.end_time()),
            None => (self.last_frame_end, None),
        };

        let end = end.unwrap_or_else(|| {
            let rate = if frame.format().frame_rate > 0.0 {
                frame.format().frame_rate
            } else {
                self.frame_rate
            };
            start + (TIME_BASE_US as f64 / rate).round() as i64
        });

        (start, end)
    }

    /// Output time of `frame` in microseconds
    pub fn advance(&mut self, frame: &VideoFrame, adjust_time_base: bool) -> i64 {
        let (start, end) = self.frame_times(frame);

        if adjust_time_base {
            self.base_time += start - self.last_frame_end;
            tracing::debug!(
                "Adjusting video base time to {} (start {}, last end {})",
                self.base_time,
                start,
                self.last_frame_end
            );
        }

        self.last_frame_end = end;
        start - self.base_time
    }
}

/// Encodes video frames
pub struct VideoProcessor {
    encoder: VideoEncoder,
    stream_index: usize,
    muxer: MuxerHandle,
    reporter: EngineReporter,
    timeline: VideoTimeline,
}

impl VideoProcessor {
    pub fn new(
        encoder: VideoEncoder,
        frame_rate: f64,
        stream_index: usize,
        muxer: MuxerHandle,
        reporter: EngineReporter,
    ) -> Self {
        Self {
            encoder,
            stream_index,
            muxer,
            reporter,
            timeline: VideoTimeline::new(frame_rate),
        }
    }

    fn send(&self, packets: Vec<EncodedPacket>) {
        for mut packet in packets {
            packet.stream_index = self.stream_index;
            self.muxer.send(packet);
        }
    }
}

impl StreamProcessor<QueuedFrame> for VideoProcessor {
    fn init(&mut self) -> Result<(), SessionError> {
        self.encoder.open().map_err(|e| {
            let error = SessionError::new(
                ErrorKind::ResourceError,
                format!("Could not initialize encoder: {}", e),
            );
            self.reporter.session_error(error.clone());
            error
        })
    }

    fn process(&mut self, item: QueuedFrame) {
        let time = self.timeline.advance(&item.frame, item.adjust_time_base);
        self.reporter.new_timestamp(time / 1_000);

        match self.encoder.encode(&item.frame, time) {
            Ok(packets) => self.send(packets),
            Err(e) => {
                tracing::debug!("Error sending frame: {}", e);
                self.reporter
                    .session_error(SessionError::new(ErrorKind::ResourceError, e.message));
            }
        }
    }

    fn cleanup(&mut self) {
        match self.encoder.flush() {
            Ok(packets) => self.send(packets),
            Err(e) => tracing::warn!("Video encoder flush failed: {}", e),
        }
    }
}

pub fn video_worker(max_queue_size: usize, processor: VideoProcessor) -> Arc<VideoWorker> {
    let worker = StreamWorker::new("video-encoder", VideoQueue::new(max_queue_size));
    worker.set_processor(Box::new(processor));
    worker
}
