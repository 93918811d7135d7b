//! Error types and handling
//!
//! Common error types used across the recording core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capture::SourceId;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Container error: {0}")]
    Container(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Stream worker is already bound to source {0}")]
    AlreadyBound(SourceId),
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Category of a reported recording failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// A source or device could not provide what the session needs
    ResourceError,
    /// A format could not be negotiated, opened or written
    FormatError,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::ResourceError => "RESOURCE_ERROR",
            ErrorKind::FormatError => "FORMAT_ERROR",
        }
    }
}

/// Failure of an external codec or container implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct CodecError {
    pub message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A stream could not be created for one source.
///
/// Reported once per failed source; sibling sources keep initializing.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamInitError {
    #[error("{description} {source_id} ended before its format became known")]
    FormatUnavailable {
        source_id: SourceId,
        description: &'static str,
    },

    #[error("{description} {source_id} failed while pending: {message}")]
    SourceError {
        source_id: SourceId,
        description: &'static str,
        message: String,
    },

    #[error("Audio device is null")]
    NoAudioDevice,

    #[error("Audio device has invalid preferred format")]
    InvalidDeviceFormat,

    #[error("Cannot create encoder for {description} {source_id}: {message}")]
    EncoderUnavailable {
        source_id: SourceId,
        description: &'static str,
        message: String,
    },
}

impl StreamInitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamInitError::FormatUnavailable { .. }
            | StreamInitError::SourceError { .. }
            | StreamInitError::NoAudioDevice => ErrorKind::ResourceError,
            StreamInitError::InvalidDeviceFormat | StreamInitError::EncoderUnavailable { .. } => {
                ErrorKind::FormatError
            }
        }
    }
}

/// Session-level failure reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

/// Error response for frontend
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        let code = match &error {
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::Serialization(_) => "SERIALIZATION_ERROR",
            RecorderError::Codec(_) => "CODEC_ERROR",
            RecorderError::Container(_) => "CONTAINER_ERROR",
            RecorderError::InvalidState(_) => "INVALID_STATE",
            RecorderError::AlreadyBound(_) => "ALREADY_BOUND",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

impl From<&StreamInitError> for ErrorResponse {
    fn from(error: &StreamInitError) -> Self {
        ErrorResponse {
            code: error.kind().code().to_string(),
            message: error.to_string(),
        }
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(error: SessionError) -> Self {
        ErrorResponse {
            code: error.kind.code().to_string(),
            message: error.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_failures_are_resource_errors() {
        let ended = StreamInitError::FormatUnavailable {
            source_id: SourceId::from_raw(3),
            description: "video source",
        };
        let failed = StreamInitError::SourceError {
            source_id: SourceId::from_raw(4),
            description: "video source",
            message: "camera unplugged".to_string(),
        };

        assert_eq!(ended.kind(), ErrorKind::ResourceError);
        assert_eq!(failed.kind(), ErrorKind::ResourceError);
        assert!(failed.to_string().contains("camera unplugged"));
    }

    #[test]
    fn test_error_response_codes() {
        let response = ErrorResponse::from(RecorderError::InvalidState("idle".to_string()));
        assert_eq!(response.code, "INVALID_STATE");

        let response = ErrorResponse::from(&StreamInitError::InvalidDeviceFormat);
        assert_eq!(response.code, "FORMAT_ERROR");
    }
}
