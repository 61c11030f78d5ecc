/**
 * ============================================================================
 * RECORDING TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Data structures for the replay capture pipeline
 *
 * TYPES:
 * - VideoFrame / AudioFrame: timestamped frames delivered by a capture source
 * - VideoSize: pixel dimensions, even-aligned for the encoder
 * - QualityPreset, CaptureResolution, Container, AudioCodec, FrameRate: capture presets
 * - Segment: one finalized live segment file
 * - Clip: one exported replay clip
 * - CaptureState / CaptureStatus / WriterTelemetry: status reporting
 *
 * ============================================================================
 */

use crate::recording::timing::MediaTime;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

// Sample format of live segment audio
pub const LIVE_AUDIO_SAMPLE_RATE: u32 = 48_000;
pub const LIVE_AUDIO_CHANNELS: u16 = 2;

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

impl VideoSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    // Round each dimension down to even, never below 2
    pub fn even_aligned(self) -> Self {
        let align = |v: u32| (v - v % 2).max(2);
        Self {
            width: align(self.width),
            height: align(self.height),
        }
    }
}

impl std::fmt::Display for VideoSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

// Uncompressed BGRA pixels
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl RawImage {
    pub fn size(&self) -> VideoSize {
        VideoSize::new(self.width, self.height)
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

// Already-encoded H.264 access unit (Annex B)
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedPacket {
    pub width: u32,
    pub height: u32,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VideoPayload {
    Raw(RawImage),
    Encoded(EncodedPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoMode {
    Encode,
    Passthrough,
}

impl VideoPayload {
    pub fn mode(&self) -> VideoMode {
        match self {
            VideoPayload::Raw(_) => VideoMode::Encode,
            VideoPayload::Encoded(_) => VideoMode::Passthrough,
        }
    }

    pub fn size(&self) -> VideoSize {
        match self {
            VideoPayload::Raw(image) => image.size(),
            VideoPayload::Encoded(packet) => VideoSize::new(packet.width, packet.height),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub pts: MediaTime,
    pub payload: VideoPayload,
}

impl VideoFrame {
    pub fn raw(pts: MediaTime, image: RawImage) -> Self {
        Self {
            pts,
            payload: VideoPayload::Raw(image),
        }
    }
}

// Interleaved signed 16-bit PCM
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub pts: MediaTime,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    pub fn silence(pts: MediaTime, sample_rate: u32, channels: u16, frames: u64) -> Self {
        Self {
            pts,
            sample_rate,
            channels,
            samples: vec![0; frames as usize * channels as usize],
        }
    }

    pub fn frame_count(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u64
    }

    pub fn duration(&self) -> MediaTime {
        MediaTime::from_samples(self.frame_count(), self.sample_rate)
    }

    pub fn end(&self) -> MediaTime {
        self.pts + self.duration()
    }
}

// =============================================================================
// Capture Presets
// =============================================================================

// Bitrate tier: bits per pixel per frame, clamped to a Mbps range
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityPreset {
    pub id: &'static str,
    pub title: &'static str,
    pub bits_per_pixel: f64,
    pub min_mbps: f64,
    pub max_mbps: f64,
}

pub const QUALITY_PRESETS: &[QualityPreset] = &[
    QualityPreset { id: "competitive", title: "Competitive", bits_per_pixel: 0.045, min_mbps: 4.0, max_mbps: 40.0 },
    QualityPreset { id: "performance", title: "Performance", bits_per_pixel: 0.055, min_mbps: 6.0, max_mbps: 50.0 },
    QualityPreset { id: "balanced", title: "Balanced", bits_per_pixel: 0.065, min_mbps: 8.0, max_mbps: 60.0 },
    QualityPreset { id: "high", title: "High", bits_per_pixel: 0.078, min_mbps: 10.0, max_mbps: 75.0 },
    QualityPreset { id: "ultra", title: "Ultra", bits_per_pixel: 0.092, min_mbps: 14.0, max_mbps: 90.0 },
    QualityPreset { id: "max", title: "Max", bits_per_pixel: 0.110, min_mbps: 18.0, max_mbps: 110.0 },
];

pub const DEFAULT_QUALITY_ID: &str = "balanced";

impl QualityPreset {
    pub fn by_id(id: &str) -> Option<&'static QualityPreset> {
        QUALITY_PRESETS.iter().find(|p| p.id == id)
    }

    pub fn default_preset() -> &'static QualityPreset {
        &QUALITY_PRESETS[2]
    }

    // Target video bitrate in bits per second
    pub fn target_bitrate(&self, size: VideoSize, fps: u32) -> u64 {
        let fps = fps.clamp(30, 60) as f64;
        let pixels = size.width as f64 * size.height as f64;
        let mbps = (self.bits_per_pixel * pixels * fps / 1_000_000.0).clamp(self.min_mbps, self.max_mbps);
        (mbps * 1_000_000.0).round() as u64
    }

    pub fn keyframe_interval(fps: u32) -> u32 {
        fps.max((fps as f64 * 1.5).round() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRate {
    Thirty,
    Sixty,
}

impl FrameRate {
    pub fn from_fps(fps: u32) -> Option<Self> {
        match fps {
            30 => Some(Self::Thirty),
            60 => Some(Self::Sixty),
            _ => None,
        }
    }

    pub fn fps(self) -> u32 {
        match self {
            Self::Thirty => 30,
            Self::Sixty => 60,
        }
    }
}

// Output resolution: the source's native size or a scaled-down target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureResolution {
    Native,
    Scaled { width: u32, height: u32 },
}

// Scaled targets offered below native, by height
const SCALED_TARGETS: &[(u32, &str)] = &[(2160, "4K"), (1440, "QHD"), (1080, "1080p"), (720, "720p")];

impl CaptureResolution {
    pub fn id(&self) -> String {
        match self {
            Self::Native => "native".to_string(),
            Self::Scaled { width, height } => format!("scaled-{}x{}", width, height),
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        if id == "native" {
            return Some(Self::Native);
        }
        let dims = id.strip_prefix("scaled-")?;
        let (w, h) = dims.split_once('x')?;
        let width = w.parse().ok()?;
        let height = h.parse().ok()?;
        if width == 0 || height == 0 {
            return None;
        }
        Some(Self::Scaled { width, height })
    }

    // Encoder output size, always even-aligned (4:2:0 chroma needs even dimensions)
    pub fn aligned_size(&self, native: VideoSize) -> VideoSize {
        match self {
            Self::Native => native.even_aligned(),
            Self::Scaled { width, height } => VideoSize::new(*width, *height).even_aligned(),
        }
    }

    pub fn label(&self, native: VideoSize) -> String {
        match self {
            Self::Native => format!("Native ({})", native),
            Self::Scaled { width, height } => {
                let name = SCALED_TARGETS
                    .iter()
                    .find(|(h, _)| h == height)
                    .map(|(_, name)| *name)
                    .unwrap_or("Custom");
                format!("{} ({}x{})", name, width, height)
            }
        }
    }

    // Native plus each standard height strictly below it, aspect preserved
    pub fn available(native: VideoSize) -> Vec<CaptureResolution> {
        let mut options = vec![CaptureResolution::Native];
        if native.width == 0 || native.height == 0 {
            return options;
        }
        let aspect = native.width as f64 / native.height as f64;
        for (target_height, _) in SCALED_TARGETS {
            if *target_height >= native.height {
                continue;
            }
            let width = (*target_height as f64 * aspect).round() as u32;
            let size = VideoSize::new(width, *target_height).even_aligned();
            options.push(CaptureResolution::Scaled {
                width: size.width,
                height: size.height,
            });
        }
        options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mov,
    Mp4,
}

impl Container {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "mov" => Some(Self::Mov),
            "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Mov => "mov",
            Self::Mp4 => "mp4",
        }
    }

    pub fn extension(self) -> &'static str {
        self.id()
    }

    // ffmpeg muxer name
    pub fn format_name(self) -> &'static str {
        match self {
            Self::Mov => "mov",
            Self::Mp4 => "mp4",
        }
    }

    // Whether a stream with this ffprobe codec name can be stream-copied in
    pub fn can_carry(self, codec_name: &str) -> bool {
        match self {
            Self::Mov => true,
            Self::Mp4 => !codec_name.starts_with("pcm_"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Pcm,
    Alac,
    Aac,
}

impl AudioCodec {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "pcm" => Some(Self::Pcm),
            "alac" => Some(Self::Alac),
            "aac" => Some(Self::Aac),
            _ => None,
        }
    }

    pub fn id(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Alac => "alac",
            Self::Aac => "aac",
        }
    }

    // ffmpeg encoder used for the segment's audio track
    pub fn ffmpeg_encoder(self) -> &'static str {
        match self {
            Self::Pcm => "pcm_s16le",
            Self::Alac => "alac",
            Self::Aac => "aac",
        }
    }
}

// Audio track layout requested from the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTrackConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioTrackConfig {
    pub fn live(codec: AudioCodec) -> Self {
        Self {
            codec,
            sample_rate: LIVE_AUDIO_SAMPLE_RATE,
            channels: LIVE_AUDIO_CHANNELS,
        }
    }
}

// =============================================================================
// Segments and Clips
// =============================================================================

// One finalized live segment on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: Uuid,
    pub path: PathBuf,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl Segment {
    pub fn new(path: PathBuf, duration_seconds: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            path,
            duration_seconds,
            created_at: Utc::now(),
        }
    }
}

// One exported replay clip
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    #[serde(default)]
    pub tags: Vec<String>,
}

// =============================================================================
// Status
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Starting,
    Running,
    Stopping,
}

// Per-writer counters; drops are telemetry, never errors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriterTelemetry {
    pub video_frames_written: u64,
    pub audio_frames_written: u64,
    pub silence_frames_inserted: u64,
    pub video_backpressure_drops: u64,
    pub pending_video_drops: u64,
    pub pending_audio_drops: u64,
    pub scale_failures: u64,
    pub non_monotonic_video: u64,
    pub mode_reconfigurations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub is_saving: bool,
    pub buffered_segments: usize,
    pub buffered_seconds: f64,
    pub writer: Option<WriterTelemetry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_quality_is_balanced() {
        let preset = QualityPreset::default_preset();
        assert_eq!(preset.id, DEFAULT_QUALITY_ID);
        assert_eq!(QualityPreset::by_id("ultra").map(|p| p.max_mbps), Some(90.0));
        assert!(QualityPreset::by_id("lossless").is_none());
    }

    #[test]
    fn test_target_bitrate_clamps() {
        let balanced = QualityPreset::default_preset();
        // 0.065 * 1920 * 1080 * 60 / 1e6 = 8.087 Mbps
        assert_eq!(balanced.target_bitrate(VideoSize::new(1920, 1080), 60), 8_087_040);
        // tiny frame clamps to the floor
        assert_eq!(balanced.target_bitrate(VideoSize::new(320, 240), 30), 8_000_000);
        // 8K clamps to the ceiling
        assert_eq!(balanced.target_bitrate(VideoSize::new(7680, 4320), 60), 60_000_000);
    }

    #[test]
    fn test_keyframe_interval() {
        assert_eq!(QualityPreset::keyframe_interval(60), 90);
        assert_eq!(QualityPreset::keyframe_interval(30), 45);
    }

    #[test]
    fn test_resolution_alignment() {
        let native = VideoSize::new(3023, 1965);
        assert_eq!(CaptureResolution::Native.aligned_size(native), VideoSize::new(3022, 1964));
        let even = VideoSize::new(2560, 1440);
        assert_eq!(CaptureResolution::Native.aligned_size(even), even);

        let scaled = CaptureResolution::Scaled { width: 1279, height: 719 };
        assert_eq!(scaled.aligned_size(native), VideoSize::new(1278, 718));

        let tiny = CaptureResolution::Scaled { width: 1, height: 3 };
        assert_eq!(tiny.aligned_size(native), VideoSize::new(2, 2));
    }

    #[test]
    fn test_available_resolutions_below_native() {
        let options = CaptureResolution::available(VideoSize::new(2560, 1440));
        assert_eq!(
            options,
            vec![
                CaptureResolution::Native,
                CaptureResolution::Scaled { width: 1920, height: 1080 },
                CaptureResolution::Scaled { width: 1280, height: 720 },
            ]
        );
        assert_eq!(options[1].label(VideoSize::new(2560, 1440)), "1080p (1920x1080)");
    }

    #[test]
    fn test_resolution_ids() {
        let scaled = CaptureResolution::Scaled { width: 1280, height: 720 };
        assert_eq!(CaptureResolution::from_id(&scaled.id()), Some(scaled));
        assert_eq!(CaptureResolution::from_id("native"), Some(CaptureResolution::Native));
        assert_eq!(CaptureResolution::from_id("scaled-0x720"), None);
        assert_eq!(CaptureResolution::from_id("720p"), None);
    }

    #[test]
    fn test_container_codec_carriage() {
        assert!(Container::Mov.can_carry("pcm_s16le"));
        assert!(!Container::Mp4.can_carry("pcm_s16le"));
        assert!(Container::Mp4.can_carry("alac"));
        assert!(Container::Mp4.can_carry("h264"));
    }

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame::silence(MediaTime::from_millis(1_000), 48_000, 2, 480);
        assert_eq!(frame.samples.len(), 960);
        assert_eq!(frame.duration(), MediaTime::from_millis(10));
        assert_eq!(frame.end(), MediaTime::from_millis(1_010));
    }
}
