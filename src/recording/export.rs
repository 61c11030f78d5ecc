/**
 * ============================================================================
 * EXPORT STITCHER MODULE
 * ============================================================================
 *
 * PURPOSE: Cut the trailing window of the segment buffer into one clip
 *
 * FUNCTIONALITY:
 * - Lay segments back to back using each file's usable track duration
 * - Keep the display rotation of the first segment that carries one
 * - Select the final min(requested, available) seconds
 * - Passthrough-copy that range into the destination container
 * - Remove the partial output on any failure
 *
 * The media work sits behind two seams: MediaProbe reads durations and
 * codecs, Remuxer performs the stream copy described by an ExportPlan.
 *
 * ============================================================================
 */

use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::types::{Container, Segment};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// Track vs container duration drift reported as a sync-quality signal
const DURATION_MISMATCH_TOLERANCE: f64 = 0.020;

// =============================================================================
// Probe Seam
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackInfo {
    pub codec: String,
    pub duration: Option<f64>,
    // Display rotation in degrees
    pub rotation: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub container_duration: Option<f64>,
    pub video: Option<TrackInfo>,
    pub audio: Option<TrackInfo>,
}

impl MediaInfo {
    // Shorter of the two track durations, else the container duration
    pub fn usable_duration(&self) -> Option<f64> {
        let valid = |d: Option<f64>| d.filter(|d| d.is_finite() && *d > 0.0);
        let video = valid(self.video.as_ref().and_then(|t| t.duration));
        let audio = valid(self.audio.as_ref().and_then(|t| t.duration));
        match (video, audio) {
            (Some(v), Some(a)) => Some(v.min(a)),
            (Some(v), None) => Some(v),
            (None, Some(a)) => Some(a),
            (None, None) => valid(self.container_duration),
        }
    }

    pub fn rotation(&self) -> Option<i32> {
        self.video.as_ref().and_then(|t| t.rotation).filter(|r| *r != 0)
    }
}

pub trait MediaProbe: Send + Sync {
    fn probe(&self, path: &Path) -> CaptureResult<MediaInfo>;
}

// Finalized segment duration; unusable timing is InvalidDuration
pub fn measure_duration(probe: &dyn MediaProbe, path: &Path) -> CaptureResult<f64> {
    probe
        .probe(path)?
        .usable_duration()
        .ok_or(CaptureError::InvalidDuration)
}

// =============================================================================
// Export Plan
// =============================================================================

// One source range copied into the output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportEntry {
    pub path: PathBuf,
    pub inpoint: f64,
    pub outpoint: f64,
}

impl ExportEntry {
    pub fn duration(&self) -> f64 {
        self.outpoint - self.inpoint
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportPlan {
    pub entries: Vec<ExportEntry>,
    pub container: Container,
    pub output: PathBuf,
    pub rotation: Option<i32>,
    pub duration: f64,
}

pub trait Remuxer: Send + Sync {
    // Stream-copy the plan's ranges into `plan.output`
    fn remux(&self, plan: &ExportPlan) -> CaptureResult<()>;
}

// Segment placed on the composite timeline
struct Piece<'a> {
    segment: &'a Segment,
    start: f64,
    duration: f64,
}

// =============================================================================
// Stitcher
// =============================================================================

#[derive(Clone)]
pub struct ExportStitcher {
    probe: Arc<dyn MediaProbe>,
    remuxer: Arc<dyn Remuxer>,
}

impl ExportStitcher {
    pub fn new(probe: Arc<dyn MediaProbe>, remuxer: Arc<dyn Remuxer>) -> Self {
        Self { probe, remuxer }
    }

    /// Export the trailing `requested_seconds` of `segments` (chronological)
    /// into `output`. Returns the plan that was executed.
    pub async fn export(
        &self,
        segments: Vec<Segment>,
        requested_seconds: f64,
        output: PathBuf,
        container: Container,
    ) -> CaptureResult<ExportPlan> {
        let stitcher = self.clone();
        tokio::task::spawn_blocking(move || stitcher.stitch(&segments, requested_seconds, &output, container))
            .await
            .map_err(|e| CaptureError::export(format!("export task failed: {}", e)))?
    }

    // Blocking export
    pub fn stitch(
        &self,
        segments: &[Segment],
        requested_seconds: f64,
        output: &Path,
        container: Container,
    ) -> CaptureResult<ExportPlan> {
        let plan = self.plan(segments, requested_seconds, output, container)?;

        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CaptureError::export(format!("cannot create {:?}: {}", parent, e)))?;
        }

        log::info!(
            "Exporting {:.2}s from {} segment(s) into {:?}",
            plan.duration,
            plan.entries.len(),
            output
        );

        if let Err(e) = self.remuxer.remux(&plan) {
            log::error!("Export to {:?} failed: {}", output, e);
            discard_output(output);
            return Err(match e {
                CaptureError::ExportFailed(msg) => CaptureError::ExportFailed(msg),
                other => CaptureError::export(other.to_string()),
            });
        }

        Ok(plan)
    }

    // Build the composite timeline and select the trailing window
    pub fn plan(
        &self,
        segments: &[Segment],
        requested_seconds: f64,
        output: &Path,
        container: Container,
    ) -> CaptureResult<ExportPlan> {
        let mut pieces = Vec::with_capacity(segments.len());
        let mut cursor = 0.0;
        let mut rotation = None;

        for segment in segments {
            let info = self.probe.probe(&segment.path).map_err(|e| {
                CaptureError::export(format!("cannot read segment {:?}: {}", segment.path, e))
            })?;

            for track in [info.video.as_ref(), info.audio.as_ref()].into_iter().flatten() {
                if !container.can_carry(&track.codec) {
                    return Err(CaptureError::export(format!(
                        "{} cannot carry {} without re-encoding",
                        container.id(),
                        track.codec
                    )));
                }
            }

            if rotation.is_none() {
                rotation = info.rotation();
            }

            let Some(duration) = info.usable_duration() else {
                log::warn!("Skipping segment {:?} with unusable timing", segment.path);
                continue;
            };

            if let Some(nominal) = info.container_duration {
                let drift = (nominal - duration).abs();
                if drift > DURATION_MISMATCH_TOLERANCE {
                    log::info!(
                        "Segment {:?}: container {:.3}s vs track {:.3}s at {:.3}s",
                        segment.path,
                        nominal,
                        duration,
                        cursor
                    );
                }
            }

            pieces.push(Piece {
                segment,
                start: cursor,
                duration,
            });
            cursor += duration;
        }

        let total = cursor;
        if !total.is_finite() || total <= 0.0 {
            return Err(CaptureError::NoFramesCaptured);
        }

        let clip_seconds = if requested_seconds.is_finite() && requested_seconds > 0.0 {
            requested_seconds.min(total)
        } else {
            total
        };
        let window_start = total - clip_seconds;

        let entries = pieces
            .iter()
            .filter(|piece| piece.start + piece.duration > window_start)
            .map(|piece| ExportEntry {
                path: piece.segment.path.clone(),
                inpoint: (window_start - piece.start).max(0.0),
                outpoint: piece.duration,
            })
            .filter(|entry| entry.duration() > 0.0)
            .collect();

        Ok(ExportPlan {
            entries,
            container,
            output: output.to_path_buf(),
            rotation,
            duration: clip_seconds,
        })
    }
}

fn discard_output(output: &Path) {
    match std::fs::remove_file(output) {
        Ok(()) => log::info!("Removed partial export {:?}", output),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Failed to remove partial export {:?}: {}", output, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::testing::{FakeProbe, FakeRemuxer, write_fake_media};

    fn segments(dir: &Path, durations: &[f64]) -> Vec<Segment> {
        durations
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let path = dir.join(format!("seg{}.mov", i + 1));
                write_fake_media(&path, *d, *d, "h264", "alac");
                Segment::new(path, *d)
            })
            .collect()
    }

    fn stitcher(remuxer: Arc<FakeRemuxer>) -> ExportStitcher {
        ExportStitcher::new(Arc::new(FakeProbe::new()), remuxer)
    }

    #[tokio::test]
    async fn test_export_keeps_trailing_window() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(FakeRemuxer::new());
        let output = dir.path().join("clip.mov");

        let plan = stitcher(remuxer.clone())
            .export(segments(dir.path(), &[10.0, 10.0, 10.0]), 15.0, output.clone(), Container::Mov)
            .await
            .unwrap();

        assert_eq!(plan.duration, 15.0);
        assert_eq!(
            plan.entries,
            vec![
                ExportEntry { path: dir.path().join("seg2.mov"), inpoint: 5.0, outpoint: 10.0 },
                ExportEntry { path: dir.path().join("seg3.mov"), inpoint: 0.0, outpoint: 10.0 },
            ]
        );
        assert!(output.exists());
        assert_eq!(remuxer.plans().len(), 1);
    }

    #[tokio::test]
    async fn test_export_clamps_to_available() {
        let dir = tempfile::tempdir().unwrap();
        let remuxer = Arc::new(FakeRemuxer::new());

        let plan = stitcher(remuxer)
            .export(segments(dir.path(), &[10.0, 10.0, 10.0]), 60.0, dir.path().join("clip.mov"), Container::Mov)
            .await
            .unwrap();

        assert_eq!(plan.duration, 30.0);
        assert_eq!(plan.entries.len(), 3);
        let total: f64 = plan.entries.iter().map(ExportEntry::duration).sum();
        assert!((total - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_timeline_is_nothing_captured() {
        let dir = tempfile::tempdir().unwrap();
        let result = stitcher(Arc::new(FakeRemuxer::new())).stitch(
            &[],
            30.0,
            &dir.path().join("clip.mov"),
            Container::Mov,
        );
        assert!(matches!(result, Err(CaptureError::NoFramesCaptured)));
    }

    #[test]
    fn test_uses_shorter_track_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mov");
        write_fake_media(&path, 10.0, 9.5, "h264", "alac");

        let plan = stitcher(Arc::new(FakeRemuxer::new()))
            .plan(&[Segment::new(path, 10.0)], 30.0, &dir.path().join("clip.mov"), Container::Mov)
            .unwrap();
        assert_eq!(plan.duration, 9.5);
        assert_eq!(plan.entries[0].outpoint, 9.5);
    }

    #[test]
    fn test_container_duration_fallback() {
        let info = MediaInfo {
            container_duration: Some(4.0),
            video: Some(TrackInfo { codec: "h264".into(), duration: None, rotation: None }),
            audio: None,
        };
        assert_eq!(info.usable_duration(), Some(4.0));
        assert_eq!(MediaInfo::default().usable_duration(), None);
    }

    #[test]
    fn test_mp4_rejects_pcm_segments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg.mov");
        write_fake_media(&path, 10.0, 10.0, "h264", "pcm_s16le");
        let remuxer = Arc::new(FakeRemuxer::new());

        let result = stitcher(remuxer.clone()).stitch(
            &[Segment::new(path, 10.0)],
            10.0,
            &dir.path().join("clip.mp4"),
            Container::Mp4,
        );
        assert!(matches!(result, Err(CaptureError::ExportFailed(_))));
        assert!(remuxer.plans().is_empty());
    }

    #[test]
    fn test_remux_failure_removes_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("clip.mov");
        let remuxer = Arc::new(FakeRemuxer::new().failing());

        let result = stitcher(remuxer).stitch(&segments(dir.path(), &[5.0]), 5.0, &output, Container::Mov);
        assert!(matches!(result, Err(CaptureError::ExportFailed(_))));
        assert!(!output.exists());
    }

    #[test]
    fn test_rotation_from_first_rotated_segment() {
        let dir = tempfile::tempdir().unwrap();
        let segments = segments(dir.path(), &[5.0, 5.0]);
        let probe = FakeProbe::new().with_rotation(&segments[1].path, 90);
        let stitcher = ExportStitcher::new(Arc::new(probe), Arc::new(FakeRemuxer::new()));

        let plan = stitcher
            .plan(&segments, 10.0, &dir.path().join("clip.mov"), Container::Mov)
            .unwrap();
        assert_eq!(plan.rotation, Some(90));
    }
}
