//! Capture type definitions
//!
//! Formats and samples exchanged between capture sources and the encoders.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Microseconds per second, the unit of every sample timestamp
pub const TIME_BASE_US: i64 = 1_000_000;

/// Fallback stream frame rate when neither source nor settings provide one
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

/// Audio sample encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    U8,
    I16,
    I32,
    #[default]
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::I16 => 2,
            SampleFormat::I32 | SampleFormat::F32 => 4,
        }
    }
}

/// Interleaved PCM audio format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub sample_format: SampleFormat,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channel_count: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channel_count,
            sample_format,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.sample_rate > 0 && self.channel_count > 0
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channel_count as usize
    }

    /// Duration of `frames` audio frames in microseconds
    pub fn duration_for_frames(&self, frames: u64) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (frames as i128 * TIME_BASE_US as i128 / self.sample_rate as i128) as i64
    }
}

/// Pixel layout of a video frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgra8,
    Rgba8,
    Nv12,
    Yuv420p,
    Yuyv422,
    Jpeg,
}

/// Video resolution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Format of the frames a video source produces
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFrameFormat {
    pub resolution: Resolution,
    pub pixel_format: PixelFormat,

    /// Frames per second; zero when unknown
    pub frame_rate: f64,
}

impl VideoFrameFormat {
    pub fn new(resolution: Resolution, pixel_format: PixelFormat, frame_rate: f64) -> Self {
        Self {
            resolution,
            pixel_format,
            frame_rate,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.resolution.is_valid()
    }
}

/// Information about an audio device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioDeviceInfo {
    /// Unique device ID
    pub id: String,

    /// Device name
    pub name: String,

    /// Format the device delivers without conversion
    pub preferred_format: AudioFormat,
}

/// A sample travelling from a source to its stream worker.
///
/// An invalid sample is the end-of-stream sentinel.
pub trait MediaSample: Clone + Send + Sync + 'static {
    fn is_valid(&self) -> bool;
}

/// A chunk of interleaved PCM audio
#[derive(Debug, Clone)]
pub struct AudioBuffer {
    format: AudioFormat,
    data: Arc<[u8]>,

    /// Presentation time of the first frame in microseconds
    start_time: i64,
}

impl AudioBuffer {
    pub fn new(format: AudioFormat, data: impl Into<Arc<[u8]>>, start_time: i64) -> Self {
        Self {
            format,
            data: data.into(),
            start_time,
        }
    }

    /// The end-of-stream sentinel
    pub fn end_of_stream() -> Self {
        Self::new(AudioFormat::default(), Vec::<u8>::new(), 0)
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn frame_count(&self) -> u64 {
        match self.format.bytes_per_frame() {
            0 => 0,
            bytes => (self.data.len() / bytes) as u64,
        }
    }

    /// Duration in microseconds
    pub fn duration(&self) -> i64 {
        self.format.duration_for_frames(self.frame_count())
    }
}

impl MediaSample for AudioBuffer {
    fn is_valid(&self) -> bool {
        self.format.is_valid() && !self.data.is_empty()
    }
}

/// One video frame
#[derive(Debug, Clone)]
pub struct VideoFrame {
    format: VideoFrameFormat,
    data: Arc<[u8]>,

    /// Presentation interval in microseconds, if the source stamped it
    start_time: Option<i64>,
    end_time: Option<i64>,
}

impl VideoFrame {
    pub fn new(format: VideoFrameFormat, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            format,
            data: data.into(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_times(mut self, start_time: Option<i64>, end_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    /// The end-of-stream sentinel
    pub fn end_of_stream() -> Self {
        Self::new(VideoFrameFormat::default(), Vec::<u8>::new())
    }

    pub fn format(&self) -> &VideoFrameFormat {
        &self.format
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn start_time(&self) -> Option<i64> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }
}

impl MediaSample for VideoFrame {
    fn is_valid(&self) -> bool {
        self.format.is_valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_buffer_duration() {
        let format = AudioFormat::new(48_000, 2, SampleFormat::I16);
        // 480 frames * 2 channels * 2 bytes
        let buffer = AudioBuffer::new(format, vec![0u8; 1920], 0);

        assert_eq!(buffer.frame_count(), 480);
        assert_eq!(buffer.duration(), 10_000);
        assert!(buffer.is_valid());
    }

    #[test]
    fn test_end_of_stream_sentinels_are_invalid() {
        assert!(!AudioBuffer::end_of_stream().is_valid());
        assert!(!VideoFrame::end_of_stream().is_valid());
    }

    #[test]
    fn test_video_format_validity() {
        let format = VideoFrameFormat::new(Resolution::new(1280, 720), PixelFormat::Nv12, 0.0);
        assert!(format.is_valid());
        assert!(!VideoFrameFormat::default().is_valid());
    }
}
