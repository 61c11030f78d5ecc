/**
 * ============================================================================
 * ENCODER SEAM
 * ============================================================================
 *
 * PURPOSE: Interface between the segment writer and a concrete media encoder
 *
 * A MediaEncoder owns one output file. The writer drives it from a single
 * worker thread: start_session once, then appends in delivery order, then
 * finish (or abort, which must remove every partial file).
 *
 * ============================================================================
 */

use crate::recording::error::CaptureResult;
use crate::recording::timing::MediaTime;
use crate::recording::types::{AudioFrame, AudioTrackConfig, VideoFrame, VideoMode, VideoSize};
use std::path::Path;

// Track layout requested when an encoder is created
#[derive(Debug, Clone, PartialEq)]
pub struct TrackConfig {
    pub video_mode: VideoMode,
    pub video_size: VideoSize,
    pub frame_rate: u32,
    pub bitrate: u64,
    pub keyframe_interval: u32,
    pub audio: Option<AudioTrackConfig>,
}

pub trait MediaEncoder: Send {
    // Anchor the output timeline at `start`
    fn start_session(&mut self, start: MediaTime) -> CaptureResult<()>;

    fn is_ready_for_video(&self) -> bool;

    fn is_ready_for_audio(&self) -> bool;

    fn append_video(&mut self, frame: &VideoFrame) -> CaptureResult<()>;

    fn append_audio(&mut self, frame: &AudioFrame) -> CaptureResult<()>;

    // Blocks until the output file is complete
    fn finish(self: Box<Self>) -> CaptureResult<()>;

    fn abort(self: Box<Self>);
}

pub trait EncoderFactory: Send + Sync {
    // Fails when the track configuration cannot be encoded into `output`
    fn create(&self, output: &Path, tracks: &TrackConfig) -> CaptureResult<Box<dyn MediaEncoder>>;
}
