//! Encoder settings
//!
//! These mirror the user-facing recording options. Missing fields fall back
//! to defaults, so partial JSON files are accepted.

use crate::capture::{Resolution, DEFAULT_FRAME_RATE};
use crate::utils::RecorderResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Codec Types
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    #[default]
    Aac,
    Opus,
    Pcm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
    Vp9,
    Av1,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    #[default]
    Mp4,
    Mov,
    Mkv,
    Webm,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Quality {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

// =============================================================================
// Settings
// =============================================================================

/// Container-level metadata written with the header
pub type MediaMetadata = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EncoderSettings {
    pub audio_codec: AudioCodec,
    pub video_codec: VideoCodec,
    pub container_format: ContainerFormat,
    pub quality: Quality,

    /// Output resolution; source resolution when unset
    pub video_resolution: Option<Resolution>,

    /// Output frame rate; derived from the source when unset
    pub video_frame_rate: Option<f64>,

    /// Frames a video stream buffers before dropping new ones
    pub max_video_queue_size: usize,

    /// Audio a stream buffers before refusing new buffers
    pub max_audio_queue_duration_ms: u64,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            audio_codec: AudioCodec::default(),
            video_codec: VideoCodec::default(),
            container_format: ContainerFormat::default(),
            quality: Quality::default(),
            video_resolution: None,
            video_frame_rate: None,
            max_video_queue_size: 10,
            max_audio_queue_duration_ms: 5_000,
        }
    }
}

impl EncoderSettings {
    pub fn from_json_str(json: &str) -> RecorderResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> RecorderResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Frame rate for a stream whose source reports `source_rate`
    pub fn effective_frame_rate(&self, source_rate: Option<f64>) -> f64 {
        self.video_frame_rate
            .filter(|rate| *rate > 0.0)
            .or(source_rate.filter(|rate| *rate > 0.0))
            .unwrap_or(DEFAULT_FRAME_RATE)
    }

    /// Output resolution for a stream whose source is `source` pixels
    pub fn output_resolution(&self, source: Resolution) -> Resolution {
        self.video_resolution
            .filter(Resolution::is_valid)
            .unwrap_or(source)
    }

    pub fn max_audio_queue_duration_us(&self) -> i64 {
        self.max_audio_queue_duration_ms as i64 * 1_000
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordingConfig {
    pub settings: EncoderSettings,

    /// Stop once every source has ended
    pub auto_stop: bool,

    pub metadata: MediaMetadata,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.max_video_queue_size, 10);
        assert_eq!(settings.max_audio_queue_duration_us(), 5_000_000);
        assert_eq!(settings.effective_frame_rate(None), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let settings =
            EncoderSettings::from_json_str(r#"{ "videoCodec": "hevc", "maxVideoQueueSize": 4 }"#)
                .unwrap();

        assert_eq!(settings.video_codec, VideoCodec::Hevc);
        assert_eq!(settings.max_video_queue_size, 4);
        assert_eq!(settings.audio_codec, AudioCodec::Aac);
        assert_eq!(settings.max_audio_queue_duration_ms, 5_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "quality": "veryHigh", "videoFrameRate": 60.0 }}"#).unwrap();

        let settings = EncoderSettings::from_json_file(file.path()).unwrap();
        assert_eq!(settings.quality, Quality::VeryHigh);
        assert_eq!(settings.effective_frame_rate(Some(24.0)), 60.0);
    }

    #[test]
    fn test_invalid_json_is_a_serialization_error() {
        let result = EncoderSettings::from_json_str("{ not json");
        assert!(matches!(
            result,
            Err(crate::utils::RecorderError::Serialization(_))
        ));
    }

    #[test]
    fn test_frame_rate_falls_back_to_source() {
        let settings = EncoderSettings::default();
        assert_eq!(settings.effective_frame_rate(Some(24.0)), 24.0);
        assert_eq!(settings.effective_frame_rate(Some(0.0)), DEFAULT_FRAME_RATE);
    }

    #[test]
    fn test_resolution_falls_back_to_source() {
        let source = Resolution::new(1920, 1080);
        let mut settings = EncoderSettings::default();
        assert_eq!(settings.output_resolution(source), source);

        settings.video_resolution = Some(Resolution::new(1280, 720));
        assert_eq!(settings.output_resolution(source), Resolution::new(1280, 720));

        settings.video_resolution = Some(Resolution::new(0, 720));
        assert_eq!(settings.output_resolution(source), source);
    }
}
