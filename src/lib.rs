//! Open ScreenStudio encoder - recording and encoding orchestration.
//!
//! Capture sources push audio buffers and video frames; a
//! [`RecordingEngine`](recorder::RecordingEngine) encodes each stream on its
//! own thread and muxes the result into one container. Encoding only starts
//! once every stream's encoder is ready, and sources whose format is not
//! known up front are waited for before the engine is set up.
//!
//! Codecs and containers are supplied by the caller through
//! [`CodecBackend`](recorder::CodecBackend) and
//! [`ContainerWriter`](recorder::ContainerWriter).

pub mod capture;
pub mod recorder;
pub mod utils;

#[cfg(test)]
mod testing;

pub use recorder::{RecordingCoordinator, RecordingEngine};
pub use utils::{RecorderError, RecorderResult};
