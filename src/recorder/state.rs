//! Recording state management
//!
//! Coordinator state, pause/resume session tracking and the summary of a
//! finished recording.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coordinator state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
    Paused,
    /// Engine finalized, result available
    Complete,
}

/// One uninterrupted stretch of recording; pausing closes it and resuming
/// opens the next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub index: usize,

    /// Milliseconds since the coordinator started, at open and close
    pub process_time_start_ms: f64,
    pub process_time_end_ms: Option<f64>,

    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Zero while the session is open
    pub duration_ms: f64,
}

impl RecordingSession {
    pub fn new(index: usize, process_time_ms: f64) -> Self {
        Self {
            index,
            process_time_start_ms: process_time_ms,
            process_time_end_ms: None,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Close the session; closing twice keeps the first end time
    pub fn end(&mut self, process_time_ms: f64) {
        if !self.is_open() {
            return;
        }
        self.process_time_end_ms = Some(process_time_ms);
        self.ended_at = Some(Utc::now());
        self.duration_ms = (process_time_ms - self.process_time_start_ms).max(0.0);
    }
}

/// Summary of a finalized recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingResult {
    /// Engine instance that produced the recording
    pub recording_id: Uuid,

    /// When the container was closed
    pub finished_at: DateTime<Utc>,

    /// Recorded duration in milliseconds, pauses excluded
    pub duration_ms: i64,

    /// Number of encoded streams
    pub stream_count: usize,

    /// Packets handed to the container
    pub packets_written: u64,

    /// False when encoding never started or the trailer failed
    pub trailer_written: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_end_sets_duration() {
        let mut session = RecordingSession::new(1, 1_000.0);
        session.end(3_500.0);

        assert_eq!(session.index, 1);
        assert_eq!(session.duration_ms, 2_500.0);
        assert!(!session.is_open());
        assert!(session.ended_at.unwrap() >= session.started_at);

        session.end(9_000.0);
        assert_eq!(session.process_time_end_ms, Some(3_500.0));
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&RecordingState::Paused).unwrap();
        assert_eq!(json, "\"paused\"");
        assert_eq!(RecordingState::default(), RecordingState::Idle);
    }
}
