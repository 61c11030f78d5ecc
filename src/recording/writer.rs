/**
 * ============================================================================
 * SEGMENT WRITER MODULE
 * ============================================================================
 *
 * PURPOSE: Write one continuous segment file from live video/audio frames
 *
 * FUNCTIONALITY:
 * - One worker thread per writer; every frame and state change goes through
 *   its command queue in FIFO order, callers never block on a frame
 * - Lazy session start on the first video frame (and first audio frame when
 *   the writer carries audio, bounded by a grace period)
 * - Audio PTS offset correction, jitter snapping and silence gap filling
 * - Backpressure: video dropped when the encoder is busy, audio queued in a
 *   bounded pending buffer and drained when the encoder is ready
 * - Software scaling to the configured output size
 * - Encode/passthrough video mode switch before the session starts
 * - Finalize with a timeout so a wedged encoder cannot stall rotation
 *
 * ============================================================================
 */

use crate::recording::encoder::{EncoderFactory, MediaEncoder, TrackConfig};
use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::scale;
use crate::recording::storage;
use crate::recording::timing::{MediaTime, SyncTolerances};
use crate::recording::types::{
    AudioFrame, AudioTrackConfig, QualityPreset, VideoFrame, VideoMode, VideoPayload, VideoSize,
    WriterTelemetry,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

// Poll interval for draining queued audio while no commands arrive
const AUDIO_DRAIN_POLL: Duration = Duration::from_millis(10);

// Everything a writer needs to open its output
#[derive(Debug, Clone)]
pub struct WriterSettings {
    // Local path or file:// URL
    pub output: String,
    pub video_size: VideoSize,
    pub include_audio: bool,
    pub audio: AudioTrackConfig,
    pub quality: &'static QualityPreset,
    pub frame_rate: u32,
    pub video_mode: VideoMode,
    pub tolerances: SyncTolerances,
}

impl WriterSettings {
    fn track_config(&self, mode: VideoMode) -> TrackConfig {
        TrackConfig {
            video_mode: mode,
            video_size: self.video_size,
            frame_rate: self.frame_rate,
            bitrate: self.quality.target_bitrate(self.video_size, self.frame_rate),
            keyframe_interval: QualityPreset::keyframe_interval(self.frame_rate),
            audio: self.include_audio.then_some(self.audio),
        }
    }
}

// Resolve an output target to a local file path
pub fn parse_output_target(target: &str) -> CaptureResult<PathBuf> {
    let path = if let Some(rest) = target.strip_prefix("file://") {
        rest
    } else if target.contains("://") {
        return Err(CaptureError::export(format!(
            "configuration failed: output target '{}' is not a local file",
            target
        )));
    } else {
        target
    };

    let path = PathBuf::from(path);
    if path.as_os_str().is_empty() || path.file_name().is_none() || target.ends_with('/') {
        return Err(CaptureError::export(format!(
            "configuration failed: output target '{}' is not a file path",
            target
        )));
    }
    Ok(path)
}

enum WriterCommand {
    Configure(WriterSettings, mpsc::SyncSender<CaptureResult<PathBuf>>),
    Video(VideoFrame),
    Audio(AudioFrame),
    Finish(oneshot::Sender<CaptureResult<PathBuf>>),
    Shutdown,
}

// =============================================================================
// Writer Handle
// =============================================================================

pub struct SegmentWriter {
    label: String,
    commands: mpsc::Sender<WriterCommand>,
    telemetry: Arc<Mutex<WriterTelemetry>>,
    finish_timeout: Duration,
    output: Option<PathBuf>,
}

impl SegmentWriter {
    // Spawn the writer's worker thread; the writer is unusable until configured
    pub fn spawn(factory: Arc<dyn EncoderFactory>, label: impl Into<String>, finish_timeout: Duration) -> Self {
        let label = label.into();
        let (commands, receiver) = mpsc::channel();
        let telemetry = Arc::new(Mutex::new(WriterTelemetry::default()));

        let worker = WriterWorker::new(factory, label.clone(), telemetry.clone());
        let thread_label = label.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("writer-{}", label))
            .spawn(move || worker.run(receiver));
        if let Err(e) = spawned {
            // Commands will fail with WriterUnavailable
            log::error!("{}: failed to spawn writer thread: {}", thread_label, e);
        }

        Self {
            label,
            commands,
            telemetry,
            finish_timeout,
            output: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_deref()
    }

    /// Open the output and create the encoder tracks.
    ///
    /// Blocks until the worker has applied the settings. Re-configuring
    /// discards the previous output and resets every piece of session state.
    pub fn configure(&mut self, settings: WriterSettings) -> CaptureResult<()> {
        let (reply, response) = mpsc::sync_channel(1);
        self.commands
            .send(WriterCommand::Configure(settings, reply))
            .map_err(|_| CaptureError::WriterUnavailable)?;
        let output = response.recv().map_err(|_| CaptureError::WriterUnavailable)??;
        self.output = Some(output);
        Ok(())
    }

    // Fire-and-forget; dropped silently once the writer stops accepting data
    pub fn append_video(&self, frame: VideoFrame) {
        let _ = self.commands.send(WriterCommand::Video(frame));
    }

    pub fn append_audio(&self, frame: AudioFrame) {
        let _ = self.commands.send(WriterCommand::Audio(frame));
    }

    /// Finalize the output and return its path.
    ///
    /// Fails with `WriterUnavailable` if never configured, `NoFramesCaptured`
    /// if no session started, and `ExportFailed` if finalizing outlasts the
    /// timeout.
    pub async fn finish_writing(&self) -> CaptureResult<PathBuf> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(WriterCommand::Finish(reply))
            .map_err(|_| CaptureError::WriterUnavailable)?;

        match tokio::time::timeout(self.finish_timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CaptureError::WriterUnavailable),
            Err(_) => {
                log::error!(
                    "{}: finalize did not complete within {:?}",
                    self.label,
                    self.finish_timeout
                );
                Err(CaptureError::export("finalizing the segment timed out"))
            }
        }
    }

    pub fn telemetry(&self) -> WriterTelemetry {
        self.telemetry
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        let _ = self.commands.send(WriterCommand::Shutdown);
    }
}

// =============================================================================
// Worker
// =============================================================================

// Where a queued audio frame's timestamp lives
#[derive(Debug, Clone, Copy, PartialEq)]
enum AudioTimeline {
    // As delivered by the source; offset correction not applied yet
    Source,
    // Already on the output timeline (silence fill, retimed frames)
    Session,
}

struct PendingAudio {
    frame: AudioFrame,
    timeline: AudioTimeline,
}

struct WriterWorker {
    factory: Arc<dyn EncoderFactory>,
    label: String,
    shared_telemetry: Arc<Mutex<WriterTelemetry>>,
    stats: WriterTelemetry,

    settings: Option<WriterSettings>,
    output: Option<PathBuf>,
    encoder: Option<Box<dyn MediaEncoder>>,
    tolerances: SyncTolerances,
    video_mode: VideoMode,
    has_audio_track: bool,
    accepts_data: bool,

    session_start: Option<MediaTime>,
    first_video_pts: Option<MediaTime>,
    first_audio_pts: Option<MediaTime>,
    audio_offset: MediaTime,
    audio_buffering_until: Option<MediaTime>,
    last_video_pts: Option<MediaTime>,
    last_audio_end: Option<MediaTime>,

    pending_video: VecDeque<VideoFrame>,
    pending_audio: VecDeque<PendingAudio>,
}

impl WriterWorker {
    fn new(factory: Arc<dyn EncoderFactory>, label: String, shared_telemetry: Arc<Mutex<WriterTelemetry>>) -> Self {
        Self {
            factory,
            label,
            shared_telemetry,
            stats: WriterTelemetry::default(),
            settings: None,
            output: None,
            encoder: None,
            tolerances: SyncTolerances::default(),
            video_mode: VideoMode::Encode,
            has_audio_track: false,
            accepts_data: false,
            session_start: None,
            first_video_pts: None,
            first_audio_pts: None,
            audio_offset: MediaTime::ZERO,
            audio_buffering_until: None,
            last_video_pts: None,
            last_audio_end: None,
            pending_video: VecDeque::new(),
            pending_audio: VecDeque::new(),
        }
    }

    fn run(mut self, commands: mpsc::Receiver<WriterCommand>) {
        loop {
            let command = if self.session_start.is_some() && !self.pending_audio.is_empty() {
                match commands.recv_timeout(AUDIO_DRAIN_POLL) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                None => self.drain_pending_audio(),
                Some(WriterCommand::Configure(settings, reply)) => {
                    let result = self.configure(settings);
                    let _ = reply.send(result);
                }
                Some(WriterCommand::Video(frame)) => self.append_video(frame),
                Some(WriterCommand::Audio(frame)) => self.append_audio(frame),
                Some(WriterCommand::Finish(reply)) => {
                    let result = self.finish();
                    self.publish_telemetry();
                    let _ = reply.send(result);
                }
                Some(WriterCommand::Shutdown) => break,
            }
            self.publish_telemetry();
        }

        self.discard_encoder();
        log::debug!("{}: writer thread exiting", self.label);
    }

    fn publish_telemetry(&self) {
        if let Ok(mut shared) = self.shared_telemetry.lock() {
            *shared = self.stats.clone();
        }
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    fn configure(&mut self, settings: WriterSettings) -> CaptureResult<PathBuf> {
        let output = parse_output_target(&settings.output)?;

        self.discard_encoder();
        self.reset_session();
        self.stats = WriterTelemetry::default();
        self.settings = None;
        self.output = None;

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CaptureError::export(format!("configuration failed: cannot create {:?}: {}", parent, e))
                })?;
            }
        }
        storage::remove_files(&[&output]);

        let tracks = settings.track_config(settings.video_mode);
        let encoder = self
            .factory
            .create(&output, &tracks)
            .map_err(configuration_failure)?;

        log::info!(
            "{}: configured {:?} {} @ {} fps, {:.1} Mbps, audio: {} -> {:?}",
            self.label,
            settings.video_mode,
            settings.video_size,
            settings.frame_rate,
            tracks.bitrate as f64 / 1_000_000.0,
            settings.include_audio,
            output
        );

        self.encoder = Some(encoder);
        self.tolerances = settings.tolerances;
        self.video_mode = settings.video_mode;
        self.has_audio_track = settings.include_audio;
        self.settings = Some(settings);
        self.output = Some(output.clone());
        self.accepts_data = true;
        Ok(output)
    }

    fn reset_session(&mut self) {
        self.accepts_data = false;
        self.session_start = None;
        self.first_video_pts = None;
        self.first_audio_pts = None;
        self.audio_offset = MediaTime::ZERO;
        self.audio_buffering_until = None;
        self.last_video_pts = None;
        self.last_audio_end = None;
        self.pending_video.clear();
        self.pending_audio.clear();
    }

    fn discard_encoder(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            log::debug!("{}: discarding unfinished output", self.label);
            encoder.abort();
        }
    }

    // Swap the video track between encode and passthrough before the session starts
    fn reconfigure_video_mode(&mut self, mode: VideoMode) -> bool {
        if self.stats.mode_reconfigurations >= self.tolerances.max_video_reconfigurations {
            log::warn!(
                "{}: dropping {:?} frame, reconfiguration limit reached",
                self.label,
                mode
            );
            return false;
        }
        let (Some(settings), Some(output)) = (self.settings.clone(), self.output.clone()) else {
            return false;
        };

        self.stats.mode_reconfigurations += 1;
        log::info!(
            "{}: reconfiguring video track #{} for {:?} frames",
            self.label,
            self.stats.mode_reconfigurations,
            mode
        );

        self.discard_encoder();
        self.pending_video.clear();
        self.first_video_pts = None;

        match self.factory.create(&output, &settings.track_config(mode)) {
            Ok(encoder) => {
                self.encoder = Some(encoder);
                self.video_mode = mode;
                true
            }
            Err(e) => {
                log::error!("{}: video track reconfiguration failed: {}", self.label, e);
                self.accepts_data = false;
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Session start
    // -------------------------------------------------------------------------

    fn start_session_if_ready(&mut self) {
        if self.session_start.is_some() {
            return;
        }
        let Some(first_video) = self.first_video_pts else {
            return;
        };

        if self.has_audio_track && self.first_audio_pts.is_none() {
            let newest_video = self.pending_video.back().map(|f| f.pts).unwrap_or(first_video);
            if newest_video - first_video < self.tolerances.audio_start_grace {
                return;
            }
            log::warn!(
                "{}: no audio within {}, starting session on video alone",
                self.label,
                self.tolerances.audio_start_grace
            );
        }

        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        if let Err(e) = encoder.start_session(first_video) {
            log::error!("{}: failed to start session: {}", self.label, e);
            self.accepts_data = false;
            return;
        }

        self.session_start = Some(first_video);
        if self.has_audio_track {
            self.audio_buffering_until = Some(first_video + self.tolerances.audio_buffering_window);
        }
        if let Some(first_audio) = self.first_audio_pts {
            self.audio_offset = self.tolerances.audio_offset(first_video, first_audio);
            log::info!(
                "{}: session started at {} (audio {}, offset {})",
                self.label,
                first_video,
                first_audio,
                self.audio_offset
            );
        } else {
            log::info!("{}: session started at {}", self.label, first_video);
        }

        self.flush_pending_video();
        self.drop_stale_pending_audio();
    }

    // -------------------------------------------------------------------------
    // Video
    // -------------------------------------------------------------------------

    fn append_video(&mut self, frame: VideoFrame) {
        if !self.accepts_data || self.encoder.is_none() {
            return;
        }

        let mode = frame.payload.mode();
        if self.session_start.is_none() && mode != self.video_mode && !self.reconfigure_video_mode(mode) {
            return;
        }

        let pts = frame.pts;
        if self.session_start.is_none() {
            if self.first_video_pts.is_none() {
                self.first_video_pts = Some(pts);
            }
            self.enqueue_video(frame);
            self.start_session_if_ready();
            return;
        }

        if self.pending_video.is_empty() {
            self.append_video_sample(frame);
        } else {
            self.enqueue_video(frame);
            self.flush_pending_video();
        }

        self.end_audio_buffering_if_due(pts);
        self.drain_pending_audio();
    }

    fn enqueue_video(&mut self, frame: VideoFrame) {
        if self.pending_video.len() >= self.tolerances.pending_video_capacity {
            self.pending_video.pop_front();
            self.stats.pending_video_drops += 1;
            if self.stats.pending_video_drops % 60 == 1 {
                log::warn!(
                    "{}: pending video full, dropped {} frame(s)",
                    self.label,
                    self.stats.pending_video_drops
                );
            }
        }
        self.pending_video.push_back(frame);
    }

    // Append queued video in order, stopping at the first frame the encoder cannot take
    fn flush_pending_video(&mut self) {
        let Some(start) = self.session_start else {
            return;
        };
        let min_valid = start - self.tolerances.video_sync_tolerance;

        while let Some(frame) = self.pending_video.front() {
            if frame.pts < min_valid {
                self.pending_video.pop_front();
                continue;
            }
            if !self.video_ready() {
                break;
            }
            if let Some(frame) = self.pending_video.pop_front() {
                self.append_video_sample(frame);
            }
        }
    }

    fn video_ready(&self) -> bool {
        self.accepts_data
            && self
                .encoder
                .as_ref()
                .map(|encoder| encoder.is_ready_for_video())
                .unwrap_or(false)
    }

    fn append_video_sample(&mut self, frame: VideoFrame) {
        if frame.payload.mode() != self.video_mode {
            log::debug!("{}: dropping {:?} frame in a started session", self.label, frame.payload.mode());
            return;
        }

        if let Some(last) = self.last_video_pts {
            if frame.pts < last {
                self.stats.non_monotonic_video += 1;
                log::debug!("{}: non-monotonic video pts {} after {}", self.label, frame.pts, last);
            }
        }
        self.last_video_pts = Some(frame.pts);

        if !self.video_ready() {
            self.stats.video_backpressure_drops += 1;
            let drops = self.stats.video_backpressure_drops;
            if drops == 1 || drops % 30 == 0 {
                log::warn!("{}: encoder busy, dropped {} video frame(s)", self.label, drops);
            }
            return;
        }

        let Some(frame) = self.scale_to_output(frame) else {
            return;
        };

        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        match encoder.append_video(&frame) {
            Ok(()) => self.stats.video_frames_written += 1,
            Err(e) => {
                log::error!("{}: video append failed, writer stopped: {}", self.label, e);
                self.accepts_data = false;
            }
        }
    }

    fn scale_to_output(&mut self, frame: VideoFrame) -> Option<VideoFrame> {
        let Some(target) = self.settings.as_ref().map(|s| s.video_size) else {
            return Some(frame);
        };
        let VideoFrame { pts, payload } = frame;
        match payload {
            VideoPayload::Raw(image) if image.size() != target => {
                let source = image.size();
                match scale::resample(image, target) {
                    Some(scaled) => Some(VideoFrame::raw(pts, scaled)),
                    None => {
                        self.stats.scale_failures += 1;
                        let failures = self.stats.scale_failures;
                        if failures == 1 || failures % 30 == 0 {
                            log::warn!(
                                "{}: failed to scale {} -> {}, dropped {} frame(s)",
                                self.label,
                                source,
                                target,
                                failures
                            );
                        }
                        None
                    }
                }
            }
            payload => Some(VideoFrame { pts, payload }),
        }
    }

    // -------------------------------------------------------------------------
    // Audio
    // -------------------------------------------------------------------------

    fn append_audio(&mut self, frame: AudioFrame) {
        if !self.accepts_data || self.encoder.is_none() || !self.has_audio_track {
            return;
        }
        if frame.frame_count() == 0 || frame.sample_rate == 0 {
            return;
        }

        let pts = frame.pts;
        if self.session_start.is_none() {
            self.first_audio_pts = Some(match self.first_audio_pts {
                Some(first) => first.min(pts),
                None => pts,
            });
        }

        self.enqueue_audio(frame);

        if self.session_start.is_none() {
            self.start_session_if_ready();
            return;
        }
        self.end_audio_buffering_if_due(pts);
        self.drain_pending_audio();
    }

    fn enqueue_audio(&mut self, frame: AudioFrame) {
        if self.pending_audio.len() >= self.tolerances.pending_audio_capacity {
            self.pending_audio.pop_front();
            self.stats.pending_audio_drops += 1;
            if self.stats.pending_audio_drops % 50 == 1 {
                log::warn!(
                    "{}: pending audio full, dropped {} frame(s)",
                    self.label,
                    self.stats.pending_audio_drops
                );
            }
        }
        self.pending_audio.push_back(PendingAudio {
            frame,
            timeline: AudioTimeline::Source,
        });
    }

    fn end_audio_buffering_if_due(&mut self, pts: MediaTime) {
        if let Some(until) = self.audio_buffering_until {
            if pts >= until {
                self.audio_buffering_until = None;
                self.drop_stale_pending_audio();
            }
        }
    }

    // Audio captured before the session start cannot be placed on the timeline
    fn drop_stale_pending_audio(&mut self) {
        let Some(start) = self.session_start else {
            return;
        };
        let min_valid = start - self.tolerances.audio_sync_tolerance;
        let offset = self.audio_offset;
        let before = self.pending_audio.len();
        self.pending_audio.retain(|entry| match entry.timeline {
            AudioTimeline::Source => entry.frame.pts - offset >= min_valid,
            AudioTimeline::Session => true,
        });
        let dropped = before - self.pending_audio.len();
        if dropped > 0 {
            log::debug!("{}: dropped {} audio frame(s) before session start", self.label, dropped);
        }
    }

    fn audio_ready(&self) -> bool {
        self.accepts_data
            && self
                .encoder
                .as_ref()
                .map(|encoder| encoder.is_ready_for_audio())
                .unwrap_or(false)
    }

    fn drain_pending_audio(&mut self) {
        let Some(start) = self.session_start else {
            return;
        };
        if self.audio_buffering_until.is_some() {
            return;
        }
        let min_valid = start - self.tolerances.audio_sync_tolerance;

        while self.audio_ready() {
            let Some(entry) = self.pending_audio.pop_front() else {
                break;
            };
            let mut frame = entry.frame;
            if entry.timeline == AudioTimeline::Session {
                self.write_audio(frame);
                continue;
            }

            let corrected = frame.pts - self.audio_offset;
            if corrected < min_valid {
                continue;
            }
            frame.pts = corrected;

            if let Some(end) = self.last_audio_end {
                if self.queue_gap_fill(end, frame.clone()) {
                    continue;
                }
                if (corrected - end).abs() <= self.tolerances.audio_jitter_tolerance {
                    frame.pts = end;
                }
            }
            self.write_audio(frame);
        }
    }

    // Queue silence covering the gap before `frame`, then the frame itself.
    // Returns false when the gap is below the fill threshold.
    fn queue_gap_fill(&mut self, end: MediaTime, mut frame: AudioFrame) -> bool {
        let gap = frame.pts - end;
        let plan = self.tolerances.silence_plan(gap, frame.sample_rate);
        if plan.is_empty() {
            return false;
        }

        let mut cursor = end;
        let mut fills = Vec::with_capacity(plan.len());
        for frames in plan {
            fills.push(AudioFrame::silence(cursor, frame.sample_rate, frame.channels, frames));
            cursor += MediaTime::from_samples(frames, frame.sample_rate);
        }
        if (frame.pts - cursor).abs() <= self.tolerances.audio_jitter_tolerance {
            frame.pts = cursor;
        }

        log::debug!(
            "{}: audio gap of {} at {}, inserting {} silence chunk(s)",
            self.label,
            gap,
            end,
            fills.len()
        );
        self.stats.silence_frames_inserted += fills.len() as u64;

        self.pending_audio.push_front(PendingAudio {
            frame,
            timeline: AudioTimeline::Session,
        });
        for fill in fills.into_iter().rev() {
            self.pending_audio.push_front(PendingAudio {
                frame: fill,
                timeline: AudioTimeline::Session,
            });
        }
        true
    }

    fn write_audio(&mut self, frame: AudioFrame) {
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        match encoder.append_audio(&frame) {
            Ok(()) => {
                self.last_audio_end = Some(frame.end());
                self.stats.audio_frames_written += 1;
            }
            Err(e) => {
                log::error!("{}: audio append failed, writer stopped: {}", self.label, e);
                self.accepts_data = false;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Finish
    // -------------------------------------------------------------------------

    fn finish(&mut self) -> CaptureResult<PathBuf> {
        let Some(output) = self.output.clone() else {
            return Err(CaptureError::WriterUnavailable);
        };
        if self.encoder.is_none() {
            return Err(CaptureError::WriterUnavailable);
        }

        if self.session_start.is_none() {
            log::warn!("{}: finish requested before any frame was written", self.label);
            self.discard_encoder();
            self.reset_session();
            self.settings = None;
            self.output = None;
            return Err(CaptureError::NoFramesCaptured);
        }

        // Flush what the encoder will still take
        self.flush_pending_video();
        self.audio_buffering_until = None;
        self.drop_stale_pending_audio();
        self.drain_pending_audio();
        let leftover = self.pending_audio.len() + self.pending_video.len();
        if leftover > 0 {
            log::debug!("{}: {} queued frame(s) not written at finish", self.label, leftover);
        }

        self.accepts_data = false;
        let encoder = self.encoder.take();
        self.reset_session();
        self.settings = None;
        self.output = None;

        let Some(encoder) = encoder else {
            return Err(CaptureError::WriterUnavailable);
        };
        encoder.finish()?;

        log::info!(
            "{}: finished {:?} ({} video / {} audio frames, {} video drops)",
            self.label,
            output,
            self.stats.video_frames_written,
            self.stats.audio_frames_written,
            self.stats.video_backpressure_drops
        );
        Ok(output)
    }
}

fn configuration_failure(error: CaptureError) -> CaptureError {
    match error {
        CaptureError::ExportFailed(msg) => CaptureError::ExportFailed(msg),
        other => CaptureError::export(format!("configuration failed: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::testing::{test_frame, EncoderEvent, FakeEncoderFactory};
    use crate::recording::types::{AudioCodec, EncodedPacket};

    fn settings(output: &Path, include_audio: bool) -> WriterSettings {
        WriterSettings {
            output: output.to_string_lossy().into_owned(),
            video_size: VideoSize::new(32, 18),
            include_audio,
            audio: AudioTrackConfig::live(AudioCodec::Alac),
            quality: QualityPreset::default_preset(),
            frame_rate: 30,
            video_mode: VideoMode::Encode,
            tolerances: SyncTolerances::default(),
        }
    }

    fn video(ms: i64) -> VideoFrame {
        VideoFrame::raw(MediaTime::from_millis(ms), test_frame(32, 18))
    }

    // 10ms of stereo 48k audio
    fn audio(ms: i64) -> AudioFrame {
        AudioFrame {
            pts: MediaTime::from_millis(ms),
            sample_rate: 48_000,
            channels: 2,
            samples: vec![100; 960],
        }
    }

    fn writer(factory: &Arc<FakeEncoderFactory>) -> SegmentWriter {
        SegmentWriter::spawn(factory.clone(), "test", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_finish_unconfigured_is_unavailable() {
        let factory = Arc::new(FakeEncoderFactory::new());
        let writer = writer(&factory);
        assert!(matches!(writer.finish_writing().await, Err(CaptureError::WriterUnavailable)));
    }

    #[tokio::test]
    async fn test_finish_without_frames_reports_nothing_captured() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), true)).unwrap();

        assert!(matches!(writer.finish_writing().await, Err(CaptureError::NoFramesCaptured)));
        assert!(factory.events().contains(&EncoderEvent::Aborted));
        // State was reset: the writer is unconfigured again
        assert!(matches!(writer.finish_writing().await, Err(CaptureError::WriterUnavailable)));
    }

    #[test]
    fn test_configure_clears_stale_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("seg.mov");
        std::fs::write(&output, b"left over from a crash").unwrap();

        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&output, false)).unwrap();
        assert!(!output.exists());
    }

    #[test]
    fn test_configure_survives_unremovable_output() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be removed as a file; the failure is logged, not fatal
        let output = dir.path().join("seg.mov");
        std::fs::create_dir(&output).unwrap();

        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        assert!(writer.configure(settings(&output, false)).is_ok());
        assert!(output.is_dir());
        assert_eq!(factory.created_count(), 1);
    }

    #[test]
    fn test_configure_rejects_non_local_target() {
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        let mut remote = settings(Path::new("unused.mov"), false);
        remote.output = "https://example.com/segment.mov".to_string();

        match writer.configure(remote) {
            Err(CaptureError::ExportFailed(msg)) => assert!(msg.contains("configuration failed")),
            other => panic!("unexpected result: {:?}", other.err()),
        }
        assert!(factory.events().is_empty());
    }

    #[test]
    fn test_configure_accepts_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        let path = dir.path().join("nested").join("seg.mov");
        let mut url = settings(&path, false);
        url.output = format!("file://{}", path.display());

        writer.configure(url).unwrap();
        assert_eq!(writer.output_path(), Some(path.as_path()));
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn test_configure_surfaces_rejected_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new().rejecting_audio());
        let mut writer = writer(&factory);
        let result = writer.configure(settings(&dir.path().join("seg.mov"), true));
        assert!(matches!(result, Err(CaptureError::ExportFailed(_))));
    }

    #[tokio::test]
    async fn test_session_starts_on_first_video_and_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        let path = dir.path().join("seg.mov");
        writer.configure(settings(&path, false)).unwrap();

        for i in 0..10 {
            writer.append_video(video(1_000 + i * 33));
        }
        let finished = writer.finish_writing().await.unwrap();
        assert_eq!(finished, path);
        assert!(path.exists());

        let events = factory.events();
        assert!(events.contains(&EncoderEvent::Started(MediaTime::from_millis(1_000))));
        assert_eq!(factory.video_pts().len(), 10);
        assert_eq!(writer.telemetry().video_frames_written, 10);
    }

    #[tokio::test]
    async fn test_session_waits_for_audio_then_applies_offset() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), true)).unwrap();

        writer.append_video(video(1_000));
        writer.append_video(video(1_033));
        // Audio trails video by 100ms
        for i in 0..40 {
            writer.append_audio(audio(1_100 + i * 10));
        }
        writer.append_video(video(1_066));
        writer.finish_writing().await.unwrap();

        let events = factory.events();
        assert!(events.contains(&EncoderEvent::Started(MediaTime::from_millis(1_000))));
        let audio_pts = factory.audio_pts();
        // First audio moved back onto the session start, then contiguous
        assert_eq!(audio_pts.first(), Some(&MediaTime::from_millis(1_000)));
        assert_eq!(audio_pts.get(1), Some(&MediaTime::from_millis(1_010)));
        assert_eq!(factory.video_pts().first(), Some(&MediaTime::from_millis(1_000)));
    }

    #[tokio::test]
    async fn test_large_audio_lag_is_not_corrected() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), true)).unwrap();

        writer.append_video(video(1_000));
        for i in 0..30 {
            writer.append_audio(audio(1_400 + i * 10));
        }
        writer.finish_writing().await.unwrap();

        assert_eq!(factory.audio_pts().first(), Some(&MediaTime::from_millis(1_400)));
    }

    #[tokio::test]
    async fn test_session_starts_without_audio_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), true)).unwrap();

        for i in 0..20 {
            writer.append_video(video(i * 33));
        }
        writer.finish_writing().await.unwrap();

        assert!(factory.events().contains(&EncoderEvent::Started(MediaTime::ZERO)));
        assert!(factory.audio_pts().is_empty());
        assert!(!factory.video_pts().is_empty());
    }

    #[tokio::test]
    async fn test_audio_gap_is_filled_with_silence() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), true)).unwrap();

        writer.append_audio(audio(0));
        writer.append_video(video(0));
        for i in 1..25 {
            writer.append_audio(audio(i * 10));
        }
        // 150ms hole: audio resumes at 400ms instead of 250ms
        for i in 0..5 {
            writer.append_audio(audio(400 + i * 10));
        }
        writer.finish_writing().await.unwrap();

        let silent: Vec<(MediaTime, u64)> = factory
            .audio_events()
            .into_iter()
            .filter(|(_, _, silent)| *silent)
            .map(|(pts, frames, _)| (pts, frames))
            .collect();
        assert_eq!(
            silent,
            vec![
                (MediaTime::from_millis(250), 4_800),
                (MediaTime::from_millis(350), 2_400),
            ]
        );
        assert!(factory.audio_pts().contains(&MediaTime::from_millis(400)));
        assert_eq!(writer.telemetry().silence_frames_inserted, 2);
    }

    #[tokio::test]
    async fn test_video_dropped_under_backpressure() {
        let dir = tempfile::tempdir().unwrap();
        // Busy for five readiness checks once the first frame is in
        let factory = Arc::new(FakeEncoderFactory::new().with_video_busy(1, 5));
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), false)).unwrap();

        for i in 0..7 {
            writer.append_video(video(i * 33));
        }
        writer.finish_writing().await.unwrap();

        let telemetry = writer.telemetry();
        assert_eq!(telemetry.video_frames_written, 2);
        assert_eq!(telemetry.video_backpressure_drops, 5);
        assert_eq!(
            factory.video_pts(),
            vec![MediaTime::ZERO, MediaTime::from_millis(198)]
        );
    }

    #[tokio::test]
    async fn test_pending_audio_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        let mut config = settings(&dir.path().join("seg.mov"), true);
        config.tolerances.pending_audio_capacity = 8;
        writer.configure(config).unwrap();

        // No video yet: all audio waits in the pending queue
        for i in 0..20 {
            writer.append_audio(audio(i * 10));
        }
        writer.append_video(video(0));
        writer.finish_writing().await.unwrap();

        assert_eq!(writer.telemetry().pending_audio_drops, 12);
    }

    #[tokio::test]
    async fn test_frames_are_scaled_to_output_size() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), false)).unwrap();

        writer.append_video(VideoFrame::raw(MediaTime::ZERO, test_frame(64, 36)));
        let mut broken = test_frame(64, 36);
        broken.data.truncate(10);
        writer.append_video(VideoFrame::raw(MediaTime::from_millis(33), broken));
        writer.finish_writing().await.unwrap();

        assert_eq!(factory.video_sizes(), vec![VideoSize::new(32, 18)]);
        assert_eq!(writer.telemetry().scale_failures, 1);
    }

    #[tokio::test]
    async fn test_switches_to_passthrough_before_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), false)).unwrap();

        let packet = |ms: i64| VideoFrame {
            pts: MediaTime::from_millis(ms),
            payload: VideoPayload::Encoded(EncodedPacket {
                width: 32,
                height: 18,
                keyframe: ms == 0,
                data: vec![0, 0, 0, 1, 0x65],
            }),
        };
        writer.append_video(packet(0));
        writer.append_video(packet(33));
        writer.finish_writing().await.unwrap();

        let events = factory.events();
        assert!(events.contains(&EncoderEvent::Created(VideoMode::Passthrough)));
        assert_eq!(factory.video_pts().len(), 2);
        assert_eq!(writer.telemetry().mode_reconfigurations, 1);
    }

    #[tokio::test]
    async fn test_frames_after_finish_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new());
        let mut writer = writer(&factory);
        writer.configure(settings(&dir.path().join("seg.mov"), false)).unwrap();

        writer.append_video(video(0));
        writer.finish_writing().await.unwrap();
        writer.append_video(video(33));
        writer.append_video(video(66));
        assert!(matches!(writer.finish_writing().await, Err(CaptureError::WriterUnavailable)));
        assert_eq!(factory.video_pts().len(), 1);
    }

    #[tokio::test]
    async fn test_finish_times_out_on_wedged_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::new().with_finish_delay(Duration::from_millis(500)));
        let mut writer = SegmentWriter::spawn(factory.clone(), "slow", Duration::from_millis(50));
        writer.configure(settings(&dir.path().join("seg.mov"), false)).unwrap();

        writer.append_video(video(0));
        assert!(matches!(writer.finish_writing().await, Err(CaptureError::ExportFailed(_))));
    }

    #[test]
    fn test_parse_output_target() {
        assert_eq!(parse_output_target("/tmp/a.mov").unwrap(), PathBuf::from("/tmp/a.mov"));
        assert_eq!(parse_output_target("file:///tmp/a.mov").unwrap(), PathBuf::from("/tmp/a.mov"));
        assert!(parse_output_target("s3://bucket/a.mov").is_err());
        assert!(parse_output_target("").is_err());
        assert!(parse_output_target("/tmp/dir/").is_err());
    }
}
