//! Capture-side types
//!
//! Formats, samples and the sources that produce them. Platform capture
//! itself lives outside this crate; sources here are the seam it pushes into.

pub mod source;
pub mod traits;

pub use source::{
    AdmissionControl, AudioBufferInput, AudioDeviceInput, MediaSource, SourceCore, SourceId,
    VideoFrameInput,
};
pub use traits::{
    AudioBuffer, AudioDeviceInfo, AudioFormat, MediaSample, PixelFormat, Resolution,
    SampleFormat, VideoFrame, VideoFrameFormat, DEFAULT_FRAME_RATE, TIME_BASE_US,
};

/// An audio source handed to the session initializer
#[derive(Clone)]
pub enum AudioSource {
    /// Device capture, format known from the device
    Device(std::sync::Arc<AudioDeviceInput>),
    /// Externally pushed buffers, format possibly unknown until the first buffer
    Buffer(std::sync::Arc<AudioBufferInput>),
}
