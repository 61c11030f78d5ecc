/**
 * ============================================================================
 * MEDIA TIMING MODULE
 * ============================================================================
 *
 * PURPOSE: Presentation timestamps and A/V synchronisation tolerances
 *
 * FUNCTIONALITY:
 * - MediaTime: signed microsecond timestamp used on every frame
 * - SyncTolerances: writer tuning constants (sync windows, gap fill, queues)
 * - Audio offset and silence-chunk planning used by the segment writer
 *
 * ============================================================================
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::time::Duration;

const MICROS_PER_SECOND: i64 = 1_000_000;

// Presentation timestamp in microseconds on the capture clock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MediaTime(i64);

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime(0);

    pub const fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Self(millis * 1_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        Self((secs * MICROS_PER_SECOND as f64).round() as i64)
    }

    pub fn from_duration(duration: Duration) -> Self {
        Self(duration.as_micros() as i64)
    }

    // Duration of `frames` PCM frames at `sample_rate`
    pub fn from_samples(frames: u64, sample_rate: u32) -> Self {
        if sample_rate == 0 {
            return Self::ZERO;
        }
        Self((frames as i128 * MICROS_PER_SECOND as i128 / sample_rate as i128) as i64)
    }

    pub const fn as_micros(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / MICROS_PER_SECOND as f64
    }

    pub fn abs(self) -> Self {
        Self(self.0.abs())
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    // Number of PCM frames covering this span at `sample_rate`, rounded
    pub fn to_samples(self, sample_rate: u32) -> u64 {
        if self.0 <= 0 {
            return 0;
        }
        ((self.0 as f64 / MICROS_PER_SECOND as f64) * sample_rate as f64).round() as u64
    }
}

impl Add for MediaTime {
    type Output = MediaTime;
    fn add(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0 + rhs.0)
    }
}

impl AddAssign for MediaTime {
    fn add_assign(&mut self, rhs: MediaTime) {
        self.0 += rhs.0;
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;
    fn sub(self, rhs: MediaTime) -> MediaTime {
        MediaTime(self.0 - rhs.0)
    }
}

impl fmt::Display for MediaTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

// =============================================================================
// Writer Tolerances
// =============================================================================

// Tuning constants for one segment writer session
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncTolerances {
    // Frames earlier than session start by more than this are dropped
    pub audio_sync_tolerance: MediaTime,
    pub video_sync_tolerance: MediaTime,

    // Largest audio lag behind video that is corrected at session start
    pub max_audio_offset_adjustment: MediaTime,

    // Audio landing this close to the previous frame's end is snapped to it
    pub audio_jitter_tolerance: MediaTime,

    // Audio is held back this long after session start before draining
    pub audio_buffering_window: MediaTime,

    pub gap_fill_threshold: MediaTime,
    pub max_gap_fill: MediaTime,
    pub silence_chunk: MediaTime,

    pub pending_audio_capacity: usize,
    pub pending_video_capacity: usize,

    pub max_video_reconfigurations: u32,

    // How far video may run ahead without audio before a session requiring audio starts anyway
    pub audio_start_grace: MediaTime,
}

impl Default for SyncTolerances {
    fn default() -> Self {
        Self {
            audio_sync_tolerance: MediaTime::from_millis(20),
            video_sync_tolerance: MediaTime::from_millis(20),
            max_audio_offset_adjustment: MediaTime::from_millis(150),
            audio_jitter_tolerance: MediaTime::from_millis(5),
            audio_buffering_window: MediaTime::from_millis(200),
            gap_fill_threshold: MediaTime::from_millis(40),
            max_gap_fill: MediaTime::from_millis(500),
            silence_chunk: MediaTime::from_millis(100),
            pending_audio_capacity: 240,
            pending_video_capacity: 120,
            max_video_reconfigurations: 3,
            audio_start_grace: MediaTime::from_millis(500),
        }
    }
}

impl SyncTolerances {
    // Offset subtracted from every audio timestamp so both streams start together.
    // Audio leading video, or lagging by more than the adjustment bound, is not corrected.
    pub fn audio_offset(&self, first_video: MediaTime, first_audio: MediaTime) -> MediaTime {
        let offset = first_audio - first_video;
        if offset.is_negative() || offset > self.max_audio_offset_adjustment {
            MediaTime::ZERO
        } else {
            offset
        }
    }

    // Silence chunk sizes (in PCM frames) covering a gap, capped at the max fill
    pub fn silence_plan(&self, gap: MediaTime, sample_rate: u32) -> Vec<u64> {
        if gap <= self.gap_fill_threshold || sample_rate == 0 {
            return Vec::new();
        }
        let fill = gap.min(self.max_gap_fill);
        let mut remaining = fill.to_samples(sample_rate);
        let chunk = self.silence_chunk.to_samples(sample_rate).max(1);

        let mut plan = Vec::new();
        while remaining > 0 {
            let frames = remaining.min(chunk);
            plan.push(frames);
            remaining -= frames;
        }
        plan
    }
}
