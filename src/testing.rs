//! In-memory codec backend and container shared by the unit tests

use crate::capture::{AudioBuffer, AudioFormat, Resolution, VideoFrame, VideoFrameFormat};
use crate::recorder::codec::{
    AudioEncoder, CodecBackend, ContainerWriter, EncodedPacket, SampleEncoder, StreamDescription,
    VideoEncoder,
};
use crate::recorder::settings::{EncoderSettings, MediaMetadata};
use crate::utils::{CodecError, RecorderError, RecorderResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Emits one packet per sample and one more on flush
struct PassthroughEncoder {
    last_pts: i64,
}

impl<S> SampleEncoder<S> for PassthroughEncoder {
    fn open(&mut self) -> Result<(), CodecError> {
        Ok(())
    }

    fn encode(&mut self, _sample: &S, pts_us: i64) -> Result<Vec<EncodedPacket>, CodecError> {
        self.last_pts = pts_us;
        Ok(vec![EncodedPacket::new(pts_us, 0, vec![0u8; 4])])
    }

    fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError> {
        Ok(vec![EncodedPacket::new(self.last_pts, 0, Vec::new())])
    }
}

#[derive(Default)]
pub struct FakeBackend {
    video_frame_rates: Mutex<Vec<f64>>,
    video_resolutions: Mutex<Vec<Option<Resolution>>>,
}

impl FakeBackend {
    /// Frame rates video encoders were requested with
    pub fn video_frame_rates(&self) -> Vec<f64> {
        self.video_frame_rates.lock().clone()
    }

    pub fn video_resolutions(&self) -> Vec<Option<Resolution>> {
        self.video_resolutions.lock().clone()
    }
}

impl CodecBackend for FakeBackend {
    fn audio_encoder(
        &self,
        _format: &AudioFormat,
        _settings: &EncoderSettings,
    ) -> Result<AudioEncoder, CodecError> {
        let encoder: Box<dyn SampleEncoder<AudioBuffer>> =
            Box::new(PassthroughEncoder { last_pts: 0 });
        Ok(encoder)
    }

    fn video_encoder(
        &self,
        _format: &VideoFrameFormat,
        frame_rate: f64,
        settings: &EncoderSettings,
    ) -> Result<VideoEncoder, CodecError> {
        self.video_frame_rates.lock().push(frame_rate);
        self.video_resolutions.lock().push(settings.video_resolution);
        let encoder: Box<dyn SampleEncoder<VideoFrame>> =
            Box::new(PassthroughEncoder { last_pts: 0 });
        Ok(encoder)
    }
}

/// Everything written to a [`MemoryContainer`], plus failure switches
#[derive(Debug, Default)]
pub struct ContainerRecord {
    pub streams: Vec<StreamDescription>,
    pub packets: Vec<EncodedPacket>,
    pub header_written: bool,
    pub header_attempts: usize,
    pub trailer_written: bool,
    pub closed: bool,
    pub fail_header: bool,
    pub fail_trailer: bool,
}

pub struct MemoryContainer {
    record: Arc<Mutex<ContainerRecord>>,
}

impl MemoryContainer {
    pub fn new() -> (Self, Arc<Mutex<ContainerRecord>>) {
        let record = Arc::new(Mutex::new(ContainerRecord::default()));
        (
            Self {
                record: record.clone(),
            },
            record,
        )
    }
}

impl ContainerWriter for MemoryContainer {
    fn add_stream(&mut self, description: &StreamDescription) -> RecorderResult<usize> {
        let mut record = self.record.lock();
        record.streams.push(description.clone());
        Ok(record.streams.len() - 1)
    }

    fn write_header(&mut self, _metadata: &MediaMetadata) -> RecorderResult<()> {
        let mut record = self.record.lock();
        record.header_attempts += 1;
        if record.fail_header {
            return Err(RecorderError::Container("header rejected".to_string()));
        }
        record.header_written = true;
        Ok(())
    }

    fn write_packet(&mut self, packet: EncodedPacket) -> RecorderResult<()> {
        self.record.lock().packets.push(packet);
        Ok(())
    }

    fn write_trailer(&mut self) -> RecorderResult<()> {
        let mut record = self.record.lock();
        if record.fail_trailer {
            return Err(RecorderError::Container("trailer rejected".to_string()));
        }
        record.trailer_written = true;
        Ok(())
    }

    fn close(&mut self) -> RecorderResult<()> {
        self.record.lock().closed = true;
        Ok(())
    }
}
