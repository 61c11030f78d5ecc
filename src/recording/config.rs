/**
 * ============================================================================
 * RECORDING CONFIG MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration and persistence for the replay capture system
 *
 * FUNCTIONALITY:
 * - ReplayConfig: user-facing capture configuration (JSON on disk)
 * - CaptureTimings: rotation / finalize / polling design constants
 * - Load/save configuration with default fallback
 * - Validation and normalisation of user values
 *
 * ============================================================================
 */

use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::types::{
    AudioCodec, CaptureResolution, Container, FrameRate, QualityPreset, DEFAULT_QUALITY_ID,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_REPLAY_SECONDS: f64 = 10.0;
pub const MAX_REPLAY_SECONDS: f64 = 120.0;

// User-facing capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplayConfig {
    // Trailing duration exported by a save (10-120 seconds)
    #[serde(default = "default_replay_duration")]
    pub replay_duration_seconds: f64,

    // "native" or "scaled-<w>x<h>"
    #[serde(default = "default_resolution_id")]
    pub resolution_id: String,

    #[serde(default = "default_quality_id")]
    pub quality_id: String,

    // 30 or 60
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    // "mov" or "mp4"
    #[serde(default = "default_container_id")]
    pub container_id: String,

    // "pcm", "alac" or "aac"
    #[serde(default = "default_audio_codec_id")]
    pub audio_codec_id: String,

    #[serde(default = "default_capture_audio")]
    pub capture_audio: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            replay_duration_seconds: default_replay_duration(),
            resolution_id: default_resolution_id(),
            quality_id: default_quality_id(),
            frame_rate: default_frame_rate(),
            container_id: default_container_id(),
            audio_codec_id: default_audio_codec_id(),
            capture_audio: default_capture_audio(),
        }
    }
}

fn default_replay_duration() -> f64 {
    30.0
}

fn default_resolution_id() -> String {
    "native".to_string()
}

fn default_quality_id() -> String {
    DEFAULT_QUALITY_ID.to_string()
}

fn default_frame_rate() -> u32 {
    60
}

fn default_container_id() -> String {
    Container::Mov.id().to_string()
}

fn default_audio_codec_id() -> String {
    AudioCodec::Alac.id().to_string()
}

fn default_capture_audio() -> bool {
    true
}

impl ReplayConfig {
    // Reject values the capture pipeline cannot honour
    pub fn validate(&self) -> CaptureResult<()> {
        if !self.replay_duration_seconds.is_finite() {
            return Err(CaptureError::config("Replay duration must be a finite number of seconds"));
        }
        if FrameRate::from_fps(self.frame_rate).is_none() {
            return Err(CaptureError::config(format!(
                "Frame rate must be 30 or 60, got {}",
                self.frame_rate
            )));
        }
        if CaptureResolution::from_id(&self.resolution_id).is_none() {
            return Err(CaptureError::config(format!("Unknown resolution '{}'", self.resolution_id)));
        }
        if QualityPreset::by_id(&self.quality_id).is_none() {
            return Err(CaptureError::config(format!("Unknown quality preset '{}'", self.quality_id)));
        }
        if Container::from_id(&self.container_id).is_none() {
            return Err(CaptureError::config(format!("Unknown container '{}'", self.container_id)));
        }
        if AudioCodec::from_id(&self.audio_codec_id).is_none() {
            return Err(CaptureError::config(format!("Unknown audio codec '{}'", self.audio_codec_id)));
        }
        Ok(())
    }

    // Clamp the replay duration into range
    pub fn normalized(mut self) -> Self {
        if self.replay_duration_seconds.is_finite() {
            self.replay_duration_seconds =
                self.replay_duration_seconds.clamp(MIN_REPLAY_SECONDS, MAX_REPLAY_SECONDS);
        } else {
            self.replay_duration_seconds = default_replay_duration();
        }
        self
    }

    // Check if config changes require a capture stop/start
    pub fn needs_capture_restart(&self, other: &ReplayConfig) -> bool {
        self.resolution_id != other.resolution_id
            || self.quality_id != other.quality_id
            || self.frame_rate != other.frame_rate
            || self.audio_codec_id != other.audio_codec_id
            || self.capture_audio != other.capture_audio
    }

    pub fn resolution(&self) -> CaptureResolution {
        CaptureResolution::from_id(&self.resolution_id).unwrap_or(CaptureResolution::Native)
    }

    pub fn quality(&self) -> &'static QualityPreset {
        QualityPreset::by_id(&self.quality_id).unwrap_or_else(QualityPreset::default_preset)
    }

    pub fn container(&self) -> Container {
        Container::from_id(&self.container_id).unwrap_or(Container::Mov)
    }

    pub fn audio_codec(&self) -> AudioCodec {
        AudioCodec::from_id(&self.audio_codec_id).unwrap_or(AudioCodec::Alac)
    }
}

// =============================================================================
// Timing Constants
// =============================================================================

// Rotation and save timing; tuned constants, overridable for tests
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureTimings {
    pub segment_interval: Duration,
    pub max_buffer_seconds: f64,
    pub rotation_settle_delay: Duration,
    pub finalize_timeout: Duration,
    pub file_ready_attempts: u32,
    pub file_ready_delay: Duration,
    pub save_drain_timeout: Duration,
}

impl Default for CaptureTimings {
    fn default() -> Self {
        Self {
            segment_interval: Duration::from_secs(10),
            max_buffer_seconds: 120.0,
            rotation_settle_delay: Duration::from_millis(50),
            finalize_timeout: Duration::from_secs(10),
            file_ready_attempts: 10,
            file_ready_delay: Duration::from_millis(50),
            save_drain_timeout: Duration::from_secs(15),
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

// Get config file path
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rewind")
        .join("replay_config.json")
}

// Load configuration from disk
pub fn load_config(path: &Path) -> CaptureResult<ReplayConfig> {
    if !path.exists() {
        log::info!("No replay config found, using defaults");
        return Ok(ReplayConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| CaptureError::config(format!("Failed to read config: {}", e)))?;

    let config: ReplayConfig = serde_json::from_str(&contents)
        .map_err(|e| CaptureError::config(format!("Failed to parse config: {}", e)))?;

    log::info!("Loaded replay config from {:?}", path);
    Ok(config.normalized())
}

// Save configuration to disk
pub fn save_config(path: &Path, config: &ReplayConfig) -> CaptureResult<()> {
    config.validate()?;

    // Ensure directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CaptureError::config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| CaptureError::config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| CaptureError::config(format!("Failed to write config: {}", e)))?;

    log::info!("Saved replay config to {:?}", path);
    Ok(())
}
