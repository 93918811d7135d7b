//! Shared utilities: errors, events, execution contexts and logging.

pub mod dispatch;
pub mod error;
pub mod logging;
pub mod signal;

pub use dispatch::{ContextHandle, EventLoop};
pub use error::{
    CodecError, ErrorKind, ErrorResponse, RecorderError, RecorderResult, SessionError,
    StreamInitError,
};
pub use signal::{ConnectionId, Signal};
