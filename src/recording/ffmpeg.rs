/**
 * ============================================================================
 * FFMPEG BACKEND MODULE
 * ============================================================================
 *
 * PURPOSE: Encoder, probe and remuxer backed by the ffmpeg/ffprobe binaries
 *
 * FUNCTIONALITY:
 * - Resolve ffmpeg/ffprobe once at startup (REWIND_FFMPEG / REWIND_FFPROBE or PATH)
 * - FfmpegEncoder: raw BGRA piped into libx264 (or H.264 passthrough) with
 *   constant-frame-rate slot pacing; PCM audio to a sidecar WAV via hound;
 *   both muxed into the segment container on finish
 * - FfprobeProbe: durations, codecs and rotation from `ffprobe -of json`
 * - FfmpegRemuxer: concat demuxer with inpoint/outpoint, stream copy
 *
 * SEGMENT INTERMEDIATES:
 * rewind_live_<uuid>.video.mkv   # encoded video, written while recording
 * rewind_live_<uuid>.audio.wav   # PCM audio, written while recording
 * rewind_live_<uuid>.mov         # muxed on finish, intermediates removed
 *
 * ============================================================================
 */

use crate::recording::encoder::{EncoderFactory, MediaEncoder, TrackConfig};
use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::export::{ExportPlan, MediaInfo, MediaProbe, Remuxer, TrackInfo};
use crate::recording::storage;
use crate::recording::timing::MediaTime;
use crate::recording::types::{AudioFrame, VideoFrame, VideoMode, VideoPayload};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

// =============================================================================
// Binary Path Management
// =============================================================================

// Global binary paths - initialized on startup
static FFMPEG_PATH: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));
static FFPROBE_PATH: Lazy<Mutex<Option<PathBuf>>> = Lazy::new(|| Mutex::new(None));

// Frames queued for the encoder process before it reports busy
const VIDEO_PIPE_DEPTH: usize = 8;

// Longest run of duplicated frames used to pace over a capture stall
const MAX_PACING_SECONDS: u64 = 5;

fn binary_name(name: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}

// Environment override, then the first PATH entry holding the binary
fn resolve_binary(env_var: &str, name: &str) -> PathBuf {
    if let Some(path) = std::env::var_os(env_var) {
        let path = PathBuf::from(path);
        log::info!("{} from {}: {:?}", name, env_var, path);
        return path;
    }

    let file_name = binary_name(name);
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(&file_name);
            if candidate.is_file() {
                log::info!("{} found on PATH: {:?}", name, candidate);
                return candidate;
            }
        }
    }

    log::warn!("{} not found on PATH, relying on the shell lookup", name);
    PathBuf::from(file_name)
}

// Initialize ffmpeg/ffprobe paths; call once on startup
pub fn init_ffmpeg_paths() {
    let ffmpeg = resolve_binary("REWIND_FFMPEG", "ffmpeg");
    let ffprobe = resolve_binary("REWIND_FFPROBE", "ffprobe");
    if let Ok(mut path) = FFMPEG_PATH.lock() {
        *path = Some(ffmpeg);
    }
    if let Ok(mut path) = FFPROBE_PATH.lock() {
        *path = Some(ffprobe);
    }
}

fn stored_path(slot: &Lazy<Mutex<Option<PathBuf>>>, name: &str) -> CaptureResult<PathBuf> {
    slot.lock()
        .ok()
        .and_then(|p| p.clone())
        .ok_or_else(|| CaptureError::config(format!("{} path not initialized. Call init_ffmpeg_paths() on startup.", name)))
}

fn get_ffmpeg_path() -> CaptureResult<PathBuf> {
    stored_path(&FFMPEG_PATH, "ffmpeg")
}

fn get_ffprobe_path() -> CaptureResult<PathBuf> {
    stored_path(&FFPROBE_PATH, "ffprobe")
}

// Check that ffmpeg runs
pub fn check_ffmpeg() -> CaptureResult<()> {
    let ffmpeg_path = get_ffmpeg_path()?;
    let status = Command::new(&ffmpeg_path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| CaptureError::config(format!("ffmpeg failed to execute: {}. Path: {:?}", e, ffmpeg_path)))?;
    if !status.success() {
        return Err(CaptureError::config(format!("ffmpeg -version exited with {:?}", status.code())));
    }
    log::info!("ffmpeg check passed: {:?}", ffmpeg_path);
    Ok(())
}

// Run ffmpeg to completion, surfacing the tail of stderr on failure
fn run_ffmpeg(args: &[String]) -> CaptureResult<()> {
    let ffmpeg_path = get_ffmpeg_path()?;
    log::debug!("ffmpeg {}", args.join(" "));
    let output = Command::new(&ffmpeg_path)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| CaptureError::export(format!("failed to run ffmpeg at {:?}: {}", ffmpeg_path, e)))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(CaptureError::export(format!(
        "ffmpeg exited with {:?}: {}",
        output.status.code(),
        join_tail(stderr.lines().map(str::to_string))
    )))
}

// Lines of ffmpeg stderr kept for error messages
const STDERR_TAIL_LINES: usize = 3;

fn join_tail(lines: impl Iterator<Item = String>) -> String {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    for line in lines.filter(|l| !l.trim().is_empty()) {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail.into_iter().collect::<Vec<_>>().join(" | ")
}

// Drains a long-running process's stderr so it never blocks on a full pipe
struct StderrTail {
    reader: Option<JoinHandle<String>>,
}

impl StderrTail {
    fn collect(stderr: impl Read + Send + 'static) -> Self {
        let reader = std::thread::Builder::new()
            .name("ffmpeg-stderr".to_string())
            .spawn(move || join_tail(BufReader::new(stderr).lines().map_while(Result::ok)))
            .map_err(|e| log::warn!("Failed to spawn stderr reader: {}", e))
            .ok();
        Self { reader }
    }

    // Wait for EOF and return the last lines
    fn finish(&mut self) -> String {
        self.reader
            .take()
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

// =============================================================================
// Encoder
// =============================================================================

fn video_intermediate(output: &Path) -> PathBuf {
    output.with_extension("video.mkv")
}

fn audio_intermediate(output: &Path) -> PathBuf {
    output.with_extension("audio.wav")
}

// Arguments for the live video encoder reading frames from stdin
pub(crate) fn video_encode_args(tracks: &TrackConfig, video_path: &Path) -> Vec<String> {
    let fps = tracks.frame_rate.to_string();
    let mut args: Vec<String> = vec!["-y".into(), "-loglevel".into(), "error".into()];

    match tracks.video_mode {
        VideoMode::Encode => {
            let bitrate = tracks.bitrate.to_string();
            let bufsize = (tracks.bitrate * 2).to_string();
            args.extend([
                "-f".into(), "rawvideo".into(),
                "-pix_fmt".into(), "bgra".into(),
                "-s".into(), format!("{}x{}", tracks.video_size.width, tracks.video_size.height),
                "-r".into(), fps,
                "-i".into(), "pipe:0".into(),
                "-c:v".into(), "libx264".into(),
                "-preset".into(), "veryfast".into(),
                "-tune".into(), "zerolatency".into(),
                "-b:v".into(), bitrate.clone(),
                "-maxrate".into(), bitrate,
                "-bufsize".into(), bufsize,
                "-g".into(), tracks.keyframe_interval.to_string(),
                "-pix_fmt".into(), "yuv420p".into(),
            ]);
        }
        VideoMode::Passthrough => {
            args.extend([
                "-f".into(), "h264".into(),
                "-framerate".into(), fps,
                "-i".into(), "pipe:0".into(),
                "-c:v".into(), "copy".into(),
            ]);
        }
    }

    args.extend(["-f".into(), "matroska".into(), path_arg(video_path)]);
    args
}

// Arguments muxing the intermediates into the segment container
pub(crate) fn mux_args(video_path: &Path, audio: Option<(&Path, &str)>, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(), "-loglevel".into(), "error".into(),
        "-i".into(), path_arg(video_path),
    ];
    if let Some((audio_path, _)) = audio {
        args.extend(["-i".into(), path_arg(audio_path)]);
    }
    args.extend(["-map".into(), "0:v:0".into()]);
    if audio.is_some() {
        args.extend(["-map".into(), "1:a:0".into()]);
    }
    args.extend(["-c:v".into(), "copy".into()]);
    if let Some((_, encoder)) = audio {
        args.extend(["-c:a".into(), encoder.to_string()]);
    }
    args.extend(["-f".into(), "mov".into(), path_arg(output)]);
    args
}

/**
 * Constant-frame-rate slot accounting for the raw video pipe
 *
 * ffmpeg times raw input by frame count, so a capture stall has to be
 * covered with repeats of the previous frame. Repeats are only sent while
 * the pipe has room; the rest stays owed and is paid off on later frames,
 * up to MAX_PACING_SECONDS worth.
 */
#[derive(Debug)]
struct FramePacer {
    frame_rate: u32,
    // Next slot to fill
    next_slot: u64,
    // Skipped slots not yet covered by a repeat
    owed: u64,
}

impl FramePacer {
    fn new(frame_rate: u32) -> Self {
        Self {
            frame_rate,
            next_slot: 0,
            owed: 0,
        }
    }

    fn slot_for(&self, pts: MediaTime, start: MediaTime) -> u64 {
        let offset = (pts - start).as_secs_f64().max(0.0);
        (offset * self.frame_rate as f64).round() as u64
    }

    // Take `slot` for a new frame; false when it is already filled
    fn claim(&mut self, slot: u64) -> bool {
        if slot < self.next_slot {
            return false;
        }
        let max_owed = self.frame_rate as u64 * MAX_PACING_SECONDS;
        self.owed = (self.owed + (slot - self.next_slot)).min(max_owed);
        self.next_slot = slot + 1;
        true
    }

    // Repeats that fit in `free` pipe slots, keeping one for the new frame
    fn repeats_for(&mut self, free: usize) -> u64 {
        let repeats = self.owed.min(free.saturating_sub(1) as u64);
        self.owed -= repeats;
        repeats
    }

    // Nothing to repeat (first frame, passthrough)
    fn forgive(&mut self) {
        self.owed = 0;
    }
}

pub struct FfmpegEncoderFactory;

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, output: &Path, tracks: &TrackConfig) -> CaptureResult<Box<dyn MediaEncoder>> {
        let size = tracks.video_size;
        if size.width == 0 || size.height == 0 || size.width % 2 != 0 || size.height % 2 != 0 {
            return Err(CaptureError::config(format!("video size {} is not encodable", size)));
        }
        if tracks.frame_rate == 0 {
            return Err(CaptureError::config("frame rate must be positive"));
        }
        if let Some(audio) = tracks.audio {
            if audio.sample_rate == 0 || audio.channels == 0 {
                return Err(CaptureError::config("audio track needs a sample rate and channels"));
            }
        }

        let ffmpeg_path = get_ffmpeg_path()?;
        let video_path = video_intermediate(output);
        let audio_path = audio_intermediate(output);

        let wav = match tracks.audio {
            Some(audio) => {
                let spec = hound::WavSpec {
                    channels: audio.channels,
                    sample_rate: audio.sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };
                Some(
                    hound::WavWriter::create(&audio_path, spec)
                        .map_err(|e| CaptureError::config(format!("cannot create {:?}: {}", audio_path, e)))?,
                )
            }
            None => None,
        };

        let mut child = Command::new(&ffmpeg_path)
            .args(video_encode_args(tracks, &video_path))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::config(format!("Failed to spawn ffmpeg at {:?}: {}", ffmpeg_path, e)))?;

        let (Some(stdin), Some(stderr)) = (child.stdin.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::config("Failed to get ffmpeg stdio"));
        };
        let stderr = StderrTail::collect(stderr);

        let (frames, queue) = mpsc::sync_channel::<Vec<u8>>(VIDEO_PIPE_DEPTH);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let feeder_in_flight = in_flight.clone();
        let feeder = std::thread::Builder::new()
            .name("ffmpeg-feeder".to_string())
            .spawn(move || feed_frames(stdin, queue, feeder_in_flight))
            .map_err(|e| CaptureError::config(format!("Failed to spawn feeder thread: {}", e)))?;

        log::info!(
            "ffmpeg encoder: {:?} {} @ {} fps, {} bps -> {:?}",
            tracks.video_mode,
            size,
            tracks.frame_rate,
            tracks.bitrate,
            output
        );

        Ok(Box::new(FfmpegEncoder {
            output: output.to_path_buf(),
            video_path,
            audio_path,
            tracks: tracks.clone(),
            child,
            stderr,
            frames: Some(frames),
            feeder: Some(feeder),
            in_flight,
            wav,
            session_start: None,
            pacer: FramePacer::new(tracks.frame_rate),
            last_payload: None,
            video_written: 0,
            audio_position: 0,
        }))
    }
}

// Pipe queued frames into ffmpeg until the queue closes
fn feed_frames(
    mut stdin: std::process::ChildStdin,
    queue: mpsc::Receiver<Vec<u8>>,
    in_flight: Arc<AtomicUsize>,
) -> std::io::Result<()> {
    let mut result = Ok(());
    for frame in queue {
        if result.is_ok() {
            result = stdin.write_all(&frame);
            if let Err(e) = &result {
                log::error!("Failed to write frame to ffmpeg: {}", e);
            }
        }
        in_flight.fetch_sub(1, Ordering::SeqCst);
    }
    // Closing stdin signals EOF to ffmpeg
    drop(stdin);
    result
}

struct FfmpegEncoder {
    output: PathBuf,
    video_path: PathBuf,
    audio_path: PathBuf,
    tracks: TrackConfig,
    child: Child,
    stderr: StderrTail,
    frames: Option<mpsc::SyncSender<Vec<u8>>>,
    feeder: Option<JoinHandle<std::io::Result<()>>>,
    in_flight: Arc<AtomicUsize>,
    wav: Option<hound::WavWriter<BufWriter<File>>>,
    session_start: Option<MediaTime>,
    pacer: FramePacer,
    last_payload: Option<Vec<u8>>,
    video_written: u64,
    // Audio frames (per channel) written since session start
    audio_position: u64,
}

impl FfmpegEncoder {
    fn send_payload(&mut self, payload: Vec<u8>) -> CaptureResult<()> {
        let Some(frames) = self.frames.as_ref() else {
            return Err(CaptureError::export("video pipe already closed"));
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if frames.send(payload).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(CaptureError::export("ffmpeg video pipe closed"));
        }
        self.video_written += 1;
        Ok(())
    }

    fn free_pipe_slots(&self) -> usize {
        VIDEO_PIPE_DEPTH.saturating_sub(self.in_flight.load(Ordering::SeqCst))
    }

    // Stop the video process and wait for it
    fn close_video(&mut self) -> CaptureResult<()> {
        self.frames = None;
        if let Some(feeder) = self.feeder.take() {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("ffmpeg feeder stopped early: {}", e),
                Err(_) => log::error!("ffmpeg feeder thread panicked"),
            }
        }
        let status = self.child.wait()?;
        let stderr = self.stderr.finish();
        if !status.success() {
            return Err(CaptureError::export(format!(
                "ffmpeg encoder exited with {:?}: {}",
                status.code(),
                stderr
            )));
        }
        if self.pacer.owed > 0 {
            log::debug!("{:?}: {} paced frame(s) still owed at finish", self.output, self.pacer.owed);
        }
        Ok(())
    }

    fn remove_all(&self) {
        storage::remove_files(&[&self.video_path, &self.audio_path, &self.output]);
    }

    fn finish_inner(&mut self) -> CaptureResult<()> {
        self.close_video()?;
        if self.video_written == 0 {
            return Err(CaptureError::NoFramesCaptured);
        }

        let wav_written = match self.wav.take() {
            Some(wav) => {
                wav.finalize()
                    .map_err(|e| CaptureError::export(format!("failed to finalize audio: {}", e)))?;
                self.audio_position > 0
            }
            None => false,
        };

        let encoder = self.tracks.audio.map(|a| a.codec.ffmpeg_encoder()).unwrap_or("aac");
        let audio = wav_written.then_some((self.audio_path.as_path(), encoder));
        run_ffmpeg(&mux_args(&self.video_path, audio, &self.output))?;

        storage::remove_files(&[&self.video_path, &self.audio_path]);
        Ok(())
    }
}

impl MediaEncoder for FfmpegEncoder {
    fn start_session(&mut self, start: MediaTime) -> CaptureResult<()> {
        self.session_start = Some(start);
        Ok(())
    }

    fn is_ready_for_video(&self) -> bool {
        self.frames.is_some() && self.in_flight.load(Ordering::SeqCst) < VIDEO_PIPE_DEPTH
    }

    fn is_ready_for_audio(&self) -> bool {
        self.wav.is_some()
    }

    fn append_video(&mut self, frame: &VideoFrame) -> CaptureResult<()> {
        let start = self
            .session_start
            .ok_or_else(|| CaptureError::export("video appended before session start"))?;

        let payload = match (&frame.payload, self.tracks.video_mode) {
            (VideoPayload::Raw(image), VideoMode::Encode) => {
                if image.size() != self.tracks.video_size || image.data.len() != image.expected_len() {
                    log::warn!("Dropping {} frame for a {} encoder", image.size(), self.tracks.video_size);
                    return Ok(());
                }
                &image.data
            }
            (VideoPayload::Encoded(packet), VideoMode::Passthrough) => &packet.data,
            _ => {
                log::warn!("Dropping frame that does not match the {:?} track", self.tracks.video_mode);
                return Ok(());
            }
        };

        let slot = self.pacer.slot_for(frame.pts, start);
        if !self.pacer.claim(slot) {
            // Slot already filled
            return Ok(());
        }

        // Repeat the previous frame across skipped slots, never waiting on the pipe
        match (self.tracks.video_mode, self.last_payload.take()) {
            (VideoMode::Encode, Some(last)) => {
                let repeats = self.pacer.repeats_for(self.free_pipe_slots());
                for _ in 0..repeats {
                    self.send_payload(last.clone())?;
                }
            }
            _ => self.pacer.forgive(),
        }

        let payload = payload.clone();
        if self.tracks.video_mode == VideoMode::Encode {
            self.last_payload = Some(payload.clone());
        }
        self.send_payload(payload)
    }

    fn append_audio(&mut self, frame: &AudioFrame) -> CaptureResult<()> {
        let (Some(start), Some(track)) = (self.session_start, self.tracks.audio) else {
            return Ok(());
        };
        let Some(wav) = self.wav.as_mut() else {
            return Ok(());
        };
        if frame.sample_rate != track.sample_rate {
            log::warn!("Dropping {} Hz audio for a {} Hz track", frame.sample_rate, track.sample_rate);
            return Ok(());
        }

        let samples = remap_channels(&frame.samples, frame.channels, track.channels);
        let channels = track.channels as usize;
        let frames = (samples.len() / channels) as u64;
        let position = (frame.pts - start).to_samples(track.sample_rate);

        // Pad a hole with silence, trim an overlap
        let skip = if position > self.audio_position {
            let silence = (position - self.audio_position) * channels as u64;
            for _ in 0..silence {
                wav.write_sample(0i16)
                    .map_err(|e| CaptureError::export(format!("audio write failed: {}", e)))?;
            }
            self.audio_position = position;
            0
        } else {
            (self.audio_position - position).min(frames)
        };

        for sample in &samples[skip as usize * channels..] {
            wav.write_sample(*sample)
                .map_err(|e| CaptureError::export(format!("audio write failed: {}", e)))?;
        }
        self.audio_position += frames - skip;
        Ok(())
    }

    fn finish(self: Box<Self>) -> CaptureResult<()> {
        let mut this = *self;
        let result = this.finish_inner();
        if let Err(e) = &result {
            log::error!("Failed to finalize {:?}: {}", this.output, e);
            this.remove_all();
        }
        result
    }

    fn abort(self: Box<Self>) {
        let mut this = *self;
        this.frames = None;
        let _ = this.child.kill();
        let _ = this.child.wait();
        if let Some(feeder) = this.feeder.take() {
            let _ = feeder.join();
        }
        let stderr = this.stderr.finish();
        if !stderr.is_empty() {
            log::debug!("ffmpeg stderr before abort: {}", stderr);
        }
        drop(this.wav.take());
        this.remove_all();
    }
}

// Interleaved channel conversion between mono and multi-channel layouts
fn remap_channels(samples: &[i16], from: u16, to: u16) -> Vec<i16> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }
    let from = from as usize;
    let to = to as usize;
    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks_exact(from) {
        if to < from {
            let sum: i32 = frame.iter().map(|s| *s as i32).sum();
            let mixed = (sum / from as i32) as i16;
            out.extend(std::iter::repeat(mixed).take(to));
        } else {
            for channel in 0..to {
                out.push(frame[channel.min(from - 1)]);
            }
        }
    }
    out
}

// =============================================================================
// Probe
// =============================================================================

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

// "00:00:10.016000000" as written in Matroska tags
fn parse_clock_duration(value: &str) -> Option<f64> {
    let mut parts = value.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

impl ProbeStream {
    fn track_info(&self) -> TrackInfo {
        let duration = self
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .or_else(|| self.tags.get("DURATION").and_then(|d| parse_clock_duration(d)));

        let rotation = self
            .side_data_list
            .iter()
            .find_map(|side| side.get("rotation").and_then(|r| r.as_f64()))
            .map(|r| r.round() as i32)
            .or_else(|| self.tags.get("rotate").and_then(|r| r.parse().ok()));

        TrackInfo {
            codec: self.codec_name.clone().unwrap_or_default(),
            duration,
            rotation,
        }
    }
}

pub(crate) fn parse_probe_output(json: &str) -> CaptureResult<MediaInfo> {
    let output: ProbeOutput =
        serde_json::from_str(json).map_err(|e| CaptureError::export(format!("unreadable ffprobe output: {}", e)))?;

    let track = |kind: &str| {
        output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .map(ProbeStream::track_info)
    };

    Ok(MediaInfo {
        container_duration: output
            .format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok()),
        video: track("video"),
        audio: track("audio"),
    })
}

pub struct FfprobeProbe;

impl MediaProbe for FfprobeProbe {
    fn probe(&self, path: &Path) -> CaptureResult<MediaInfo> {
        let ffprobe_path = get_ffprobe_path()?;
        let output = Command::new(&ffprobe_path)
            .args(["-v", "error", "-show_format", "-show_streams", "-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CaptureError::export(format!("failed to run ffprobe at {:?}: {}", ffprobe_path, e)))?;

        if !output.status.success() {
            return Err(CaptureError::export(format!(
                "ffprobe could not read {:?}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_probe_output(&String::from_utf8_lossy(&output.stdout))
    }
}

// =============================================================================
// Remuxer
// =============================================================================

fn quote_concat_path(path: &Path) -> String {
    format!("'{}'", path.to_string_lossy().replace('\'', "'\\''"))
}

// ffconcat script selecting each entry's range
pub(crate) fn render_concat_list(plan: &ExportPlan) -> String {
    let mut list = String::from("ffconcat version 1.0\n");
    for entry in &plan.entries {
        list.push_str(&format!("file {}\n", quote_concat_path(&entry.path)));
        if entry.inpoint > 0.0 {
            list.push_str(&format!("inpoint {:.6}\n", entry.inpoint));
        }
        list.push_str(&format!("outpoint {:.6}\n", entry.outpoint));
    }
    list
}

pub(crate) fn remux_args(plan: &ExportPlan, list_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-y".into(), "-loglevel".into(), "error".into(),
        "-f".into(), "concat".into(),
        "-safe".into(), "0".into(),
        "-i".into(), path_arg(list_path),
        "-map".into(), "0".into(),
        "-c".into(), "copy".into(),
    ];
    if let Some(rotation) = plan.rotation {
        args.extend(["-metadata:s:v:0".into(), format!("rotate={}", rotation)]);
    }
    args.extend([
        "-movflags".into(), "+faststart".into(),
        "-f".into(), plan.container.format_name().into(),
        path_arg(&plan.output),
    ]);
    args
}

pub struct FfmpegRemuxer;

impl Remuxer for FfmpegRemuxer {
    fn remux(&self, plan: &ExportPlan) -> CaptureResult<()> {
        let list_path = plan.output.with_extension("ffconcat");
        std::fs::write(&list_path, render_concat_list(plan))
            .map_err(|e| CaptureError::export(format!("cannot write concat list: {}", e)))?;

        let result = run_ffmpeg(&remux_args(plan, &list_path));
        storage::remove_files(&[&list_path]);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::export::ExportEntry;
    use crate::recording::types::{AudioCodec, AudioTrackConfig, Container, VideoSize};

    fn tracks(mode: VideoMode) -> TrackConfig {
        TrackConfig {
            video_mode: mode,
            video_size: VideoSize::new(1920, 1080),
            frame_rate: 60,
            bitrate: 8_087_040,
            keyframe_interval: 90,
            audio: Some(AudioTrackConfig::live(AudioCodec::Alac)),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_encode_args() {
        let args = video_encode_args(&tracks(VideoMode::Encode), Path::new("/tmp/seg.video.mkv"));
        assert!(has_pair(&args, "-pix_fmt", "bgra"));
        assert!(has_pair(&args, "-s", "1920x1080"));
        assert!(has_pair(&args, "-c:v", "libx264"));
        assert!(has_pair(&args, "-b:v", "8087040"));
        assert!(has_pair(&args, "-bufsize", "16174080"));
        assert!(has_pair(&args, "-g", "90"));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/seg.video.mkv"));
    }

    #[test]
    fn test_passthrough_args() {
        let args = video_encode_args(&tracks(VideoMode::Passthrough), Path::new("/tmp/seg.video.mkv"));
        assert!(has_pair(&args, "-f", "h264"));
        assert!(has_pair(&args, "-c:v", "copy"));
        assert!(!args.iter().any(|a| a == "libx264"));
    }

    #[test]
    fn test_mux_args() {
        let output = Path::new("/tmp/seg.mov");
        let with_audio = mux_args(
            &video_intermediate(output),
            Some((&audio_intermediate(output), "alac")),
            output,
        );
        assert!(has_pair(&with_audio, "-i", "/tmp/seg.audio.wav"));
        assert!(has_pair(&with_audio, "-map", "1:a:0"));
        assert!(has_pair(&with_audio, "-c:a", "alac"));

        let video_only = mux_args(&video_intermediate(output), None, output);
        assert!(!video_only.iter().any(|a| a == "1:a:0"));
        assert!(has_pair(&video_only, "-i", "/tmp/seg.video.mkv"));
    }

    #[test]
    fn test_parse_probe_output() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264", "duration": "10.016667",
                 "side_data_list": [{"side_data_type": "Display Matrix", "rotation": -90}]},
                {"codec_type": "audio", "codec_name": "alac", "duration": "10.005333"}
            ],
            "format": {"duration": "10.016667"}
        }"#;
        let info = parse_probe_output(json).unwrap();
        assert_eq!(info.container_duration, Some(10.016667));
        let video = info.video.unwrap();
        assert_eq!(video.codec, "h264");
        assert_eq!(video.rotation, Some(-90));
        assert_eq!(info.audio.unwrap().duration, Some(10.005333));
    }

    #[test]
    fn test_parse_probe_tag_fallbacks() {
        let json = r#"{
            "streams": [
                {"codec_type": "video", "codec_name": "h264",
                 "tags": {"DURATION": "00:01:02.500000000", "rotate": "180"}}
            ],
            "format": {}
        }"#;
        let info = parse_probe_output(json).unwrap();
        let video = info.video.unwrap();
        assert_eq!(video.duration, Some(62.5));
        assert_eq!(video.rotation, Some(180));
        assert!(info.audio.is_none());
        assert!(parse_probe_output("not json").is_err());
    }

    #[test]
    fn test_concat_list_and_args() {
        let plan = ExportPlan {
            entries: vec![
                ExportEntry { path: PathBuf::from("/live/seg2.mov"), inpoint: 5.0, outpoint: 10.0 },
                ExportEntry { path: PathBuf::from("/live/it's.mov"), inpoint: 0.0, outpoint: 10.0 },
            ],
            container: Container::Mp4,
            output: PathBuf::from("/clips/out.mp4"),
            rotation: Some(90),
            duration: 15.0,
        };

        let list = render_concat_list(&plan);
        assert_eq!(
            list,
            "ffconcat version 1.0\n\
             file '/live/seg2.mov'\ninpoint 5.000000\noutpoint 10.000000\n\
             file '/live/it'\\''s.mov'\noutpoint 10.000000\n"
        );

        let args = remux_args(&plan, Path::new("/clips/out.ffconcat"));
        assert!(has_pair(&args, "-f", "concat"));
        assert!(has_pair(&args, "-c", "copy"));
        assert!(has_pair(&args, "-metadata:s:v:0", "rotate=90"));
        assert!(has_pair(&args, "-f", "mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/clips/out.mp4"));
    }

    #[test]
    fn test_remap_channels() {
        assert_eq!(remap_channels(&[1, 2, 3], 1, 2), vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(remap_channels(&[10, 20, 30, 50], 2, 1), vec![15, 40]);
        assert_eq!(remap_channels(&[1, 2], 2, 2), vec![1, 2]);
    }

    #[test]
    fn test_pacing_never_exceeds_free_pipe_slots() {
        let mut pacer = FramePacer::new(60);
        let start = MediaTime::ZERO;

        assert!(pacer.claim(pacer.slot_for(start, start)));
        assert_eq!(pacer.repeats_for(VIDEO_PIPE_DEPTH), 0);

        // A 2s stall owes 119 repeats; only free slots minus one are sent now
        let slot = pacer.slot_for(MediaTime::from_millis(2000), start);
        assert_eq!(slot, 120);
        assert!(pacer.claim(slot));
        assert_eq!(pacer.repeats_for(VIDEO_PIPE_DEPTH), 7);
        assert_eq!(pacer.owed, 112);

        // A full pipe sends nothing and keeps the debt
        assert!(pacer.claim(121));
        assert_eq!(pacer.repeats_for(0), 0);
        assert_eq!(pacer.repeats_for(1), 0);
        assert_eq!(pacer.owed, 112);

        // Already filled slots are refused
        assert!(!pacer.claim(121));
    }

    #[test]
    fn test_pacing_debt_is_bounded() {
        let mut pacer = FramePacer::new(30);
        assert!(pacer.claim(0));
        assert!(pacer.claim(10_000));
        assert_eq!(pacer.owed, 30 * MAX_PACING_SECONDS);

        pacer.forgive();
        assert_eq!(pacer.repeats_for(VIDEO_PIPE_DEPTH), 0);
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let text = "frame=1\n\nframe=2\n[libx264] error one\nConversion failed!\n";
        let mut tail = StderrTail::collect(std::io::Cursor::new(text.as_bytes().to_vec()));
        assert_eq!(tail.finish(), "frame=2 | [libx264] error one | Conversion failed!");
        // Second call has nothing left to join
        assert_eq!(tail.finish(), "");
        assert_eq!(join_tail(std::iter::empty()), "");
    }
}
