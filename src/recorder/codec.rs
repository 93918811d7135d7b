//! Codec and container seams
//!
//! Actual compression and bitstream writing live outside this crate. The
//! engine talks to them through these traits.

use crate::capture::{AudioBuffer, AudioFormat, Resolution, VideoFrame, VideoFrameFormat};
use crate::recorder::settings::{AudioCodec, EncoderSettings, MediaMetadata, VideoCodec};
use crate::utils::{CodecError, RecorderResult};
use serde::{Deserialize, Serialize};

/// One compressed packet ready for the container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPacket {
    /// Index returned by `ContainerWriter::add_stream`
    pub stream_index: usize,

    /// Presentation time in microseconds
    pub pts_us: i64,

    pub duration_us: i64,
    pub key_frame: bool,
    pub data: Vec<u8>,
}

impl EncodedPacket {
    pub fn new(pts_us: i64, duration_us: i64, data: Vec<u8>) -> Self {
        Self {
            stream_index: 0,
            pts_us,
            duration_us,
            key_frame: false,
            data,
        }
    }
}

/// Stream declared to the container before the header is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamDescription {
    Audio {
        codec: AudioCodec,
        format: AudioFormat,
    },
    Video {
        codec: VideoCodec,
        format: VideoFrameFormat,
        /// Encoded size; the source size unless settings override it
        resolution: Resolution,
        frame_rate: f64,
    },
}

/// Compresses samples of one stream
pub trait SampleEncoder<S>: Send {
    fn open(&mut self) -> Result<(), CodecError>;

    fn encode(&mut self, sample: &S, pts_us: i64) -> Result<Vec<EncodedPacket>, CodecError>;

    /// Drain packets still buffered in the codec
    fn flush(&mut self) -> Result<Vec<EncodedPacket>, CodecError>;
}

pub type AudioEncoder = Box<dyn SampleEncoder<AudioBuffer>>;
pub type VideoEncoder = Box<dyn SampleEncoder<VideoFrame>>;

/// Creates encoders for negotiated formats
pub trait CodecBackend: Send + Sync {
    fn audio_encoder(
        &self,
        format: &AudioFormat,
        settings: &EncoderSettings,
    ) -> Result<AudioEncoder, CodecError>;

    fn video_encoder(
        &self,
        format: &VideoFrameFormat,
        frame_rate: f64,
        settings: &EncoderSettings,
    ) -> Result<VideoEncoder, CodecError>;
}

/// Output container; owned by the muxer once encoding starts
pub trait ContainerWriter: Send {
    fn add_stream(&mut self, description: &StreamDescription) -> RecorderResult<usize>;

    fn write_header(&mut self, metadata: &MediaMetadata) -> RecorderResult<()>;

    fn write_packet(&mut self, packet: EncodedPacket) -> RecorderResult<()>;

    fn write_trailer(&mut self) -> RecorderResult<()>;

    fn close(&mut self) -> RecorderResult<()>;
}
