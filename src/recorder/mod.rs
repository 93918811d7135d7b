//! Recording system module
//!
//! One engine per recording. Each encoded stream runs on its own worker
//! thread fed straight from its capture source; a shared muxer writes the
//! compressed packets into the container.
//! - StreamWorker: queue, encoding thread and admission gate per stream
//! - SessionInitializer: waits for unknown source formats before encoding
//! - RecordingEngine: stream setup, start barrier and finalization
//! - RecordingCoordinator: start/pause/resume/stop around an engine

pub mod audio;
pub mod barrier;
pub mod binding;
pub mod codec;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod initializer;
pub mod muxer;
pub mod settings;
pub mod state;
pub mod video;
pub mod worker;

pub use barrier::StartupBarrier;
pub use binding::{connect_encoder_to_source, disconnect_encoder_from_source, set_admission_control};
pub use codec::{CodecBackend, ContainerWriter, EncodedPacket, SampleEncoder, StreamDescription};
pub use coordinator::{RecordingCoordinator, RecordingEvent};
pub use engine::{EngineState, RecordingEngine};
pub use events::EngineEvent;
pub use initializer::{EncodingTarget, SessionInitializer};
pub use settings::{EncoderSettings, MediaMetadata, RecordingConfig};
pub use state::{RecordingResult, RecordingSession, RecordingState};
pub use worker::{EncoderThread, StreamWorker, WorkerPhase};
