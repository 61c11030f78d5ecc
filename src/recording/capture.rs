/**
 * ============================================================================
 * CAPTURE SOURCE MODULE
 * ============================================================================
 *
 * PURPOSE: Frame producers feeding the replay pipeline
 *
 * FUNCTIONALITY:
 * - CaptureSource / FrameSink seam between a platform source and the manager
 * - SyntheticSource: generated BGRA frames and PCM tone at a fixed rate
 * - ScapSource (feature "screen-capture"): primary display capture via scap
 *
 * Sources deliver frames from their own threads; sinks must hand them off
 * without blocking.
 *
 * ============================================================================
 */

use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::timing::MediaTime;
use crate::recording::types::{
    AudioFrame, CaptureResolution, QualityPreset, RawImage, VideoFrame, VideoSize,
    LIVE_AUDIO_CHANNELS, LIVE_AUDIO_SAMPLE_RATE,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// Parameters a source is started with
#[derive(Debug, Clone, Copy)]
pub struct CaptureRequest {
    pub resolution: CaptureResolution,
    pub quality: &'static QualityPreset,
    pub frame_rate: u32,
    pub capture_audio: bool,
}

pub trait FrameSink: Send + Sync {
    fn on_video_frame(&self, frame: VideoFrame);

    fn on_audio_frame(&self, frame: AudioFrame);

    // Source stopped on its own; `None` for a clean stop
    fn on_capture_stopped(&self, error: Option<CaptureError>);
}

pub trait CaptureSource: Send + Sync {
    fn start_capture(&self, request: &CaptureRequest, sink: Arc<dyn FrameSink>) -> CaptureResult<()>;

    fn stop_capture(&self);

    // Encoder output size for the running capture
    fn output_size(&self) -> Option<VideoSize>;

    fn provides_audio(&self) -> bool;
}

// Running producer thread plus its stop flag
struct Producer {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Producer {
    fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Capture thread panicked");
            }
        }
    }
}

// =============================================================================
// Synthetic Source
// =============================================================================

// Audio chunk length produced by the synthetic source
const SYNTHETIC_AUDIO_CHUNK: Duration = Duration::from_millis(10);

/// Frame generator for headless runs and tests.
///
/// Produces a moving gradient at the requested frame rate and a quiet
/// 440 Hz tone in 10 ms chunks, both timestamped from one monotonic clock.
pub struct SyntheticSource {
    native: VideoSize,
    fail_after: Option<Duration>,
    output: Mutex<Option<VideoSize>>,
    producer: Mutex<Option<Producer>>,
}

impl SyntheticSource {
    pub fn new(native: VideoSize) -> Self {
        Self {
            native,
            fail_after: None,
            output: Mutex::new(None),
            producer: Mutex::new(None),
        }
    }

    // Simulate the platform source dying after `after`
    pub fn failing_after(mut self, after: Duration) -> Self {
        self.fail_after = Some(after);
        self
    }
}

impl CaptureSource for SyntheticSource {
    fn start_capture(&self, request: &CaptureRequest, sink: Arc<dyn FrameSink>) -> CaptureResult<()> {
        if self.native.width == 0 || self.native.height == 0 {
            return Err(CaptureError::NoDisplay);
        }
        if request.frame_rate == 0 {
            return Err(CaptureError::config("frame rate must be positive"));
        }
        self.stop_capture();

        // The generator renders at output size; no scaling needed downstream
        let size = request.resolution.aligned_size(self.native);
        let frame_interval = Duration::from_secs_f64(1.0 / request.frame_rate as f64);
        let audio = request.capture_audio;
        let fail_after = self.fail_after;
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();

        let thread = std::thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || {
                run_synthetic(size, frame_interval, audio, fail_after, thread_stop, sink);
            })
            .map_err(|e| CaptureError::source(format!("Failed to spawn capture thread: {}", e)))?;

        log::info!(
            "Synthetic capture started: {} @ {} fps, audio: {}",
            size,
            request.frame_rate,
            audio
        );
        if let Ok(mut output) = self.output.lock() {
            *output = Some(size);
        }
        if let Ok(mut producer) = self.producer.lock() {
            *producer = Some(Producer {
                stop,
                thread: Some(thread),
            });
        }
        Ok(())
    }

    fn stop_capture(&self) {
        let producer = self.producer.lock().ok().and_then(|mut p| p.take());
        if let Some(producer) = producer {
            producer.stop();
            log::info!("Synthetic capture stopped");
        }
        if let Ok(mut output) = self.output.lock() {
            *output = None;
        }
    }

    fn output_size(&self) -> Option<VideoSize> {
        self.output.lock().ok().and_then(|o| *o)
    }

    fn provides_audio(&self) -> bool {
        true
    }
}

fn run_synthetic(
    size: VideoSize,
    frame_interval: Duration,
    audio: bool,
    fail_after: Option<Duration>,
    stop: Arc<AtomicBool>,
    sink: Arc<dyn FrameSink>,
) {
    let start = Instant::now();
    let chunk_frames = (LIVE_AUDIO_SAMPLE_RATE as u128 * SYNTHETIC_AUDIO_CHUNK.as_millis() / 1_000) as u64;
    let mut frame_index: u64 = 0;
    let mut samples_sent: u64 = 0;
    let mut next_video = start;
    let mut next_audio = start;

    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if let Some(limit) = fail_after {
            if now.duration_since(start) >= limit {
                log::warn!("Synthetic capture failing after {:?}", limit);
                sink.on_capture_stopped(Some(CaptureError::source("synthetic source lost")));
                return;
            }
        }

        if now >= next_video {
            let pts = MediaTime::from_duration(now.duration_since(start));
            sink.on_video_frame(VideoFrame::raw(pts, gradient_frame(size, frame_index)));
            frame_index += 1;
            next_video += frame_interval;
        }

        if audio && now >= next_audio {
            let pts = MediaTime::from_samples(samples_sent, LIVE_AUDIO_SAMPLE_RATE);
            sink.on_audio_frame(tone_chunk(pts, samples_sent, chunk_frames));
            samples_sent += chunk_frames;
            next_audio += SYNTHETIC_AUDIO_CHUNK;
        }

        let next = if audio { next_video.min(next_audio) } else { next_video };
        let wait = next.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            std::thread::sleep(wait.min(Duration::from_millis(5)));
        }
    }
}

// Diagonal gradient shifted one pixel per frame
fn gradient_frame(size: VideoSize, frame_index: u64) -> RawImage {
    let mut data = Vec::with_capacity(size.width as usize * size.height as usize * 4);
    let shift = frame_index as u32;
    for y in 0..size.height {
        for x in 0..size.width {
            let v = ((x + y + shift) % 256) as u8;
            data.extend_from_slice(&[v, v / 2, 255 - v, 255]);
        }
    }
    RawImage {
        width: size.width,
        height: size.height,
        data,
    }
}

fn tone_chunk(pts: MediaTime, first_sample: u64, frames: u64) -> AudioFrame {
    let channels = LIVE_AUDIO_CHANNELS as usize;
    let mut samples = Vec::with_capacity(frames as usize * channels);
    for i in 0..frames {
        let t = (first_sample + i) as f64 / LIVE_AUDIO_SAMPLE_RATE as f64;
        let value = ((t * 440.0 * std::f64::consts::TAU).sin() * 2_000.0) as i16;
        for _ in 0..channels {
            samples.push(value);
        }
    }
    AudioFrame {
        pts,
        sample_rate: LIVE_AUDIO_SAMPLE_RATE,
        channels: LIVE_AUDIO_CHANNELS,
        samples,
    }
}

// =============================================================================
// Screen Source (scap)
// =============================================================================

#[cfg(feature = "screen-capture")]
pub use screen::ScapSource;

#[cfg(feature = "screen-capture")]
pub mod screen {
    use super::*;
    use scap::{
        capturer::{Capturer, Options},
        frame::{Frame, FrameType},
    };
    use std::sync::mpsc;

    const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

    /// Primary display capture. Video only; scap does not deliver audio.
    #[derive(Default)]
    pub struct ScapSource {
        output: Mutex<Option<VideoSize>>,
        producer: Mutex<Option<Producer>>,
    }

    impl ScapSource {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl CaptureSource for ScapSource {
        fn start_capture(&self, request: &CaptureRequest, sink: Arc<dyn FrameSink>) -> CaptureResult<()> {
            if !scap::is_supported() {
                log::error!("Screen capture not supported on this platform");
                return Err(CaptureError::NoDisplay);
            }
            if !scap::has_permission() {
                log::error!("Screen recording permission not granted");
                return Err(CaptureError::NoDisplay);
            }
            self.stop_capture();

            let fps = request.frame_rate;
            let stop = Arc::new(AtomicBool::new(false));
            let thread_stop = stop.clone();
            let (ready_tx, ready_rx) = mpsc::sync_channel::<CaptureResult<VideoSize>>(1);

            let thread = std::thread::Builder::new()
                .name("screen-capture".to_string())
                .spawn(move || run_screen(fps, thread_stop, sink, ready_tx))
                .map_err(|e| CaptureError::source(format!("Failed to spawn capture thread: {}", e)))?;

            let native = match ready_rx.recv_timeout(FIRST_FRAME_TIMEOUT + Duration::from_secs(1)) {
                Ok(Ok(size)) => size,
                Ok(Err(e)) => {
                    Producer { stop, thread: Some(thread) }.stop();
                    return Err(e);
                }
                Err(_) => {
                    Producer { stop, thread: Some(thread) }.stop();
                    return Err(CaptureError::NoDisplay);
                }
            };

            let size = request.resolution.aligned_size(native);
            log::info!("Screen capture started: native {}, output {} @ {} fps", native, size, fps);
            if let Ok(mut output) = self.output.lock() {
                *output = Some(size);
            }
            if let Ok(mut producer) = self.producer.lock() {
                *producer = Some(Producer { stop, thread: Some(thread) });
            }
            Ok(())
        }

        fn stop_capture(&self) {
            let producer = self.producer.lock().ok().and_then(|mut p| p.take());
            if let Some(producer) = producer {
                producer.stop();
                log::info!("Screen capture stopped");
            }
            if let Ok(mut output) = self.output.lock() {
                *output = None;
            }
        }

        fn output_size(&self) -> Option<VideoSize> {
            self.output.lock().ok().and_then(|o| *o)
        }

        fn provides_audio(&self) -> bool {
            false
        }
    }

    // BGRA-compatible payloads only; the encoder input is fixed to bgra
    fn frame_pixels(frame: Frame) -> Option<(u32, u32, Vec<u8>)> {
        match frame {
            Frame::BGRA(f) => Some((f.width as u32, f.height as u32, f.data)),
            Frame::BGRx(f) => Some((f.width as u32, f.height as u32, f.data)),
            Frame::BGR0(f) => Some((f.width as u32, f.height as u32, f.data)),
            _ => None,
        }
    }

    fn run_screen(
        fps: u32,
        stop: Arc<AtomicBool>,
        sink: Arc<dyn FrameSink>,
        ready: mpsc::SyncSender<CaptureResult<VideoSize>>,
    ) {
        let options = Options {
            fps,
            target: None,
            show_cursor: true,
            show_highlight: false,
            excluded_targets: None,
            output_type: FrameType::BGRAFrame,
            output_resolution: scap::capturer::Resolution::Captured,
            ..Default::default()
        };

        let mut capturer = match Capturer::build(options) {
            Ok(capturer) => capturer,
            Err(e) => {
                log::error!("Failed to create capturer: {:?}", e);
                let _ = ready.send(Err(CaptureError::NoDisplay));
                return;
            }
        };
        capturer.start_capture();
        let clock = Instant::now();

        // Wait for the first frame to learn the display size
        let mut attempt = 0;
        let (width, height, first) = loop {
            if clock.elapsed() >= FIRST_FRAME_TIMEOUT || stop.load(Ordering::SeqCst) {
                log::error!(
                    "Timeout waiting for first frame after {:.1}s. Check screen recording permissions.",
                    FIRST_FRAME_TIMEOUT.as_secs_f32()
                );
                capturer.stop_capture();
                let _ = ready.send(Err(CaptureError::NoDisplay));
                return;
            }
            attempt += 1;
            match capturer.get_next_frame() {
                Ok(frame) => {
                    if let Some(pixels) = frame_pixels(frame) {
                        break pixels;
                    }
                }
                Err(_) => {
                    if attempt % 50 == 0 {
                        log::warn!("Still waiting for first frame (attempt {})", attempt);
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        };

        let native = VideoSize::new(width, height);
        if ready.send(Ok(native)).is_err() {
            capturer.stop_capture();
            return;
        }

        let expected = width as usize * height as usize * 4;
        let mut last_good = first;
        let mut wrong_size_count: u64 = 0;
        sink.on_video_frame(VideoFrame::raw(
            MediaTime::from_duration(clock.elapsed()),
            RawImage { width, height, data: last_good.clone() },
        ));

        while !stop.load(Ordering::SeqCst) {
            match capturer.get_next_frame() {
                Ok(frame) => {
                    let Some((w, h, data)) = frame_pixels(frame) else {
                        continue;
                    };
                    let pts = MediaTime::from_duration(clock.elapsed());
                    if data.len() == expected && w == width && h == height {
                        last_good = data;
                    } else if !data.is_empty() {
                        // Wrong size: skip rather than feed a torn frame
                        wrong_size_count += 1;
                        if wrong_size_count <= 3 {
                            log::warn!("Wrong frame size: expected {} bytes, got {}", expected, data.len());
                        }
                        continue;
                    }
                    // Empty frames from scap repeat the last good one
                    sink.on_video_frame(VideoFrame::raw(
                        pts,
                        RawImage { width, height, data: last_good.clone() },
                    ));
                }
                Err(e) => {
                    log::error!("Capture error: {:?}", e);
                    sink.on_capture_stopped(Some(CaptureError::source(format!("{:?}", e))));
                    capturer.stop_capture();
                    return;
                }
            }
        }

        capturer.stop_capture();
    }
}
