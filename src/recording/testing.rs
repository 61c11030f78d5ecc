// In-memory collaborators for exercising the pipeline without ffmpeg.
//
// Fake encoders "finalize" a segment by writing a small JSON description of
// the media they received; FakeProbe reads it back, FakeRemuxer writes one
// for each clip it produces.

use crate::recording::encoder::{EncoderFactory, MediaEncoder, TrackConfig};
use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::export::{ExportPlan, MediaInfo, MediaProbe, Remuxer, TrackInfo};
use crate::recording::library::ClipStore;
use crate::recording::timing::MediaTime;
use crate::recording::types::{AudioFrame, Clip, RawImage, VideoFrame, VideoMode, VideoSize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn test_frame(width: u32, height: u32) -> RawImage {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for i in 0..width * height {
        data.extend_from_slice(&[(i % 255) as u8, 64, 128, 255]);
    }
    RawImage { width, height, data }
}

// =============================================================================
// Fake Media Files
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FakeMedia {
    container_duration: Option<f64>,
    video_duration: Option<f64>,
    audio_duration: Option<f64>,
    video_codec: String,
    audio_codec: Option<String>,
}

fn write_media(path: &Path, media: &FakeMedia) -> CaptureResult<()> {
    let contents = serde_json::to_string(media).map_err(|e| CaptureError::export(e.to_string()))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn write_fake_media(path: &Path, video: f64, audio: f64, video_codec: &str, audio_codec: &str) {
    let media = FakeMedia {
        container_duration: Some(video.max(audio)),
        video_duration: Some(video),
        audio_duration: Some(audio),
        video_codec: video_codec.to_string(),
        audio_codec: Some(audio_codec.to_string()),
    };
    write_media(path, &media).unwrap();
}

// =============================================================================
// Encoder
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Created(VideoMode),
    Started(MediaTime),
    Video { pts: MediaTime, size: VideoSize },
    Audio { pts: MediaTime, frames: u64, silent: bool },
    Finished,
    Aborted,
}

#[derive(Default)]
pub struct FakeEncoderFactory {
    events: Arc<Mutex<Vec<EncoderEvent>>>,
    reject_audio: bool,
    finish_delay: Option<Duration>,
    // (frames written before, readiness checks refused)
    video_busy: Option<(u64, u64)>,
    // Number of encoders created before creation starts failing
    fail_after: Option<usize>,
    created: AtomicUsize,
}

impl FakeEncoderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting_audio(mut self) -> Self {
        self.reject_audio = true;
        self
    }

    pub fn with_finish_delay(mut self, delay: Duration) -> Self {
        self.finish_delay = Some(delay);
        self
    }

    pub fn with_video_busy(mut self, after_frames: u64, checks: u64) -> Self {
        self.video_busy = Some((after_frames, checks));
        self
    }

    pub fn failing_after(mut self, creations: usize) -> Self {
        self.fail_after = Some(creations);
        self
    }

    pub fn events(&self) -> Vec<EncoderEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn video_pts(&self) -> Vec<MediaTime> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EncoderEvent::Video { pts, .. } => Some(pts),
                _ => None,
            })
            .collect()
    }

    pub fn video_sizes(&self) -> Vec<VideoSize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EncoderEvent::Video { size, .. } => Some(size),
                _ => None,
            })
            .collect()
    }

    // Non-silent audio timestamps
    pub fn audio_pts(&self) -> Vec<MediaTime> {
        self.audio_events()
            .into_iter()
            .filter(|(_, _, silent)| !silent)
            .map(|(pts, _, _)| pts)
            .collect()
    }

    pub fn audio_events(&self) -> Vec<(MediaTime, u64, bool)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                EncoderEvent::Audio { pts, frames, silent } => Some((pts, frames, silent)),
                _ => None,
            })
            .collect()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl EncoderFactory for FakeEncoderFactory {
    fn create(&self, output: &Path, tracks: &TrackConfig) -> CaptureResult<Box<dyn MediaEncoder>> {
        if self.reject_audio && tracks.audio.is_some() {
            return Err(CaptureError::config("audio track rejected"));
        }
        let created = self.created.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = self.fail_after {
            if created >= limit {
                return Err(CaptureError::config("encoder unavailable"));
            }
        }

        self.events.lock().unwrap().push(EncoderEvent::Created(tracks.video_mode));
        let (busy_after, busy_checks) = self.video_busy.unwrap_or((0, 0));
        Ok(Box::new(FakeEncoder {
            output: output.to_path_buf(),
            tracks: tracks.clone(),
            events: self.events.clone(),
            finish_delay: self.finish_delay,
            busy_after,
            busy_remaining: AtomicU64::new(busy_checks),
            start: None,
            last_video: None,
            video_written: 0,
            audio_end: None,
        }))
    }
}

struct FakeEncoder {
    output: PathBuf,
    tracks: TrackConfig,
    events: Arc<Mutex<Vec<EncoderEvent>>>,
    finish_delay: Option<Duration>,
    busy_after: u64,
    busy_remaining: AtomicU64,
    start: Option<MediaTime>,
    last_video: Option<MediaTime>,
    video_written: u64,
    audio_end: Option<MediaTime>,
}

impl FakeEncoder {
    fn record(&self, event: EncoderEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl MediaEncoder for FakeEncoder {
    fn start_session(&mut self, start: MediaTime) -> CaptureResult<()> {
        self.start = Some(start);
        self.record(EncoderEvent::Started(start));
        Ok(())
    }

    fn is_ready_for_video(&self) -> bool {
        if self.video_written < self.busy_after {
            return true;
        }
        self.busy_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }

    fn is_ready_for_audio(&self) -> bool {
        true
    }

    fn append_video(&mut self, frame: &VideoFrame) -> CaptureResult<()> {
        self.last_video = Some(frame.pts);
        self.video_written += 1;
        self.record(EncoderEvent::Video {
            pts: frame.pts,
            size: frame.payload.size(),
        });
        Ok(())
    }

    fn append_audio(&mut self, frame: &AudioFrame) -> CaptureResult<()> {
        self.audio_end = Some(frame.end());
        self.record(EncoderEvent::Audio {
            pts: frame.pts,
            frames: frame.frame_count(),
            silent: frame.samples.iter().all(|s| *s == 0),
        });
        Ok(())
    }

    fn finish(self: Box<Self>) -> CaptureResult<()> {
        if let Some(delay) = self.finish_delay {
            std::thread::sleep(delay);
        }
        let start = self.start.unwrap_or(MediaTime::ZERO);
        let frame = 1.0 / self.tracks.frame_rate.max(1) as f64;
        let video_duration = self.last_video.map(|last| (last - start).as_secs_f64() + frame);
        let audio_duration = self.audio_end.map(|end| (end - start).as_secs_f64());
        let container_duration = match (video_duration, audio_duration) {
            (Some(v), Some(a)) => Some(v.max(a)),
            (v, a) => v.or(a),
        };
        let media = FakeMedia {
            container_duration,
            video_duration,
            audio_duration,
            video_codec: "h264".to_string(),
            audio_codec: self.tracks.audio.map(|a| a.codec.ffmpeg_encoder().to_string()),
        };
        write_media(&self.output, &media)?;
        self.record(EncoderEvent::Finished);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        let _ = std::fs::remove_file(&self.output);
        self.record(EncoderEvent::Aborted);
    }
}

// =============================================================================
// Probe and Remuxer
// =============================================================================

#[derive(Default)]
pub struct FakeProbe {
    rotations: HashMap<PathBuf, i32>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rotation(mut self, path: &Path, degrees: i32) -> Self {
        self.rotations.insert(path.to_path_buf(), degrees);
        self
    }
}

impl MediaProbe for FakeProbe {
    fn probe(&self, path: &Path) -> CaptureResult<MediaInfo> {
        let contents = std::fs::read_to_string(path)?;
        let media: FakeMedia =
            serde_json::from_str(&contents).map_err(|e| CaptureError::export(e.to_string()))?;
        Ok(MediaInfo {
            container_duration: media.container_duration,
            video: Some(TrackInfo {
                codec: media.video_codec,
                duration: media.video_duration,
                rotation: self.rotations.get(path).copied(),
            }),
            audio: media.audio_codec.map(|codec| TrackInfo {
                codec,
                duration: media.audio_duration,
                rotation: None,
            }),
        })
    }
}

#[derive(Default)]
pub struct FakeRemuxer {
    plans: Mutex<Vec<ExportPlan>>,
    fail: bool,
    delay: Option<Duration>,
}

impl FakeRemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn plans(&self) -> Vec<ExportPlan> {
        self.plans.lock().unwrap().clone()
    }
}

impl Remuxer for FakeRemuxer {
    fn remux(&self, plan: &ExportPlan) -> CaptureResult<()> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.plans.lock().unwrap().push(plan.clone());
        if self.fail {
            // Leave a partial file behind for the caller to clean up
            std::fs::write(&plan.output, b"partial")?;
            return Err(CaptureError::export("remux failed"));
        }
        write_fake_media(&plan.output, plan.duration, plan.duration, "h264", "alac");
        Ok(())
    }
}

// =============================================================================
// Clip Store
// =============================================================================

#[derive(Default)]
pub struct FakeClipStore {
    clips: Mutex<Vec<Clip>>,
    fail: bool,
    saves: AtomicUsize,
}

impl FakeClipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl ClipStore for FakeClipStore {
    fn fetch_all(&self) -> CaptureResult<Vec<Clip>> {
        let mut clips = self.clips.lock().unwrap().clone();
        clips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clips)
    }

    fn save(&self, clip: Clip) -> CaptureResult<Clip> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CaptureError::storage("catalog unavailable"));
        }
        let mut clips = self.clips.lock().unwrap();
        clips.retain(|c| c.id != clip.id);
        clips.push(clip.clone());
        Ok(clip)
    }
}
