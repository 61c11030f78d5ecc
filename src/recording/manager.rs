/**
 * ============================================================================
 * CAPTURE MANAGER MODULE
 * ============================================================================
 *
 * PURPOSE: Lifecycle of the background replay capture
 *
 * RESPONSIBILITIES:
 * - Start/stop the capture source and the segment writers
 * - Rotate segments on a fixed interval with a seamless writer handoff
 * - Keep finalized segments in the ring buffer, deleting pruned files
 * - Save the trailing replay window as a clip and record it in the library
 * - Report status and surface capture interruptions asynchronously
 *
 * STATE MACHINE:
 * Idle -> Starting -> Running -> Stopping -> Idle
 * (Running carries a "saving" flag; one save at a time)
 *
 * ROTATION FLOW:
 * 1. Take the pre-configured standby writer (or configure one now)
 * 2. Swap it in as the active writer; the frame router sees the swap at once
 * 3. Wait the settle delay so the new writer has frames
 * 4. Finalize the old writer, prepare the next standby in the background
 * 5. Measure the segment and append it to the ring buffer
 *
 * ============================================================================
 */

use crate::recording::buffer::SegmentRingBuffer;
use crate::recording::capture::{CaptureRequest, CaptureSource, FrameSink};
use crate::recording::config::{CaptureTimings, ReplayConfig};
use crate::recording::encoder::EncoderFactory;
use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::export::{measure_duration, ExportStitcher, MediaProbe, Remuxer};
use crate::recording::library::ClipStore;
use crate::recording::storage::{self, StorageLayout};
use crate::recording::timing::SyncTolerances;
use crate::recording::types::{
    AudioFrame, AudioTrackConfig, CaptureState, CaptureStatus, Clip, Container, Segment, VideoFrame,
    VideoMode,
};
use crate::recording::writer::{SegmentWriter, WriterSettings};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

// Callback receiving capture interruptions
pub type InterruptHandler = Arc<dyn Fn(CaptureError) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Frame Router
// =============================================================================

// Delivers source frames to whichever writer is active right now
struct FrameRouter {
    active: Mutex<Option<Arc<SegmentWriter>>>,
    runtime: Mutex<Option<Handle>>,
    manager: Weak<CaptureManager>,
}

impl FrameRouter {
    fn set_active(&self, writer: Option<Arc<SegmentWriter>>) {
        *lock(&self.active) = writer;
    }

    fn active(&self) -> Option<Arc<SegmentWriter>> {
        lock(&self.active).clone()
    }
}

impl FrameSink for FrameRouter {
    fn on_video_frame(&self, frame: VideoFrame) {
        // Sent under the lock so a swap is never observed half-way
        if let Some(writer) = lock(&self.active).as_ref() {
            writer.append_video(frame);
        }
    }

    fn on_audio_frame(&self, frame: AudioFrame) {
        if let Some(writer) = lock(&self.active).as_ref() {
            writer.append_audio(frame);
        }
    }

    fn on_capture_stopped(&self, error: Option<CaptureError>) {
        let Some(error) = error else {
            log::info!("Capture source stopped");
            return;
        };
        log::error!("Capture source failed: {}", error);

        let (Some(manager), Some(runtime)) = (self.manager.upgrade(), lock(&self.runtime).clone()) else {
            return;
        };
        runtime.spawn(async move {
            manager.handle_interruption(error, true).await;
        });
    }
}

// =============================================================================
// Manager
// =============================================================================

#[derive(Default)]
struct Pipeline {
    active: Option<Arc<SegmentWriter>>,
    standby: Option<SegmentWriter>,
    // Settings for the running session; output is filled in per writer
    template: Option<WriterSettings>,
}

/// Owns the capture pipeline. Create with [`CaptureManagerBuilder`].
pub struct CaptureManager {
    me: Weak<CaptureManager>,
    source: Arc<dyn CaptureSource>,
    encoders: Arc<dyn EncoderFactory>,
    probe: Arc<dyn MediaProbe>,
    stitcher: ExportStitcher,
    catalog: Option<Arc<dyn ClipStore>>,
    buffer: SegmentRingBuffer,
    layout: StorageLayout,
    timings: CaptureTimings,
    tolerances: SyncTolerances,
    config: Mutex<ReplayConfig>,
    state: Mutex<CaptureState>,
    saving: AtomicBool,
    save_done: Notify,
    pipeline: tokio::sync::Mutex<Pipeline>,
    router: Arc<FrameRouter>,
    rotation_task: Mutex<Option<JoinHandle<()>>>,
    // Incremented on each start/teardown to invalidate old rotation loops
    generation: AtomicU64,
    writer_count: AtomicU64,
    on_interrupted: Mutex<Option<InterruptHandler>>,
}

pub struct CaptureManagerBuilder {
    source: Arc<dyn CaptureSource>,
    encoders: Arc<dyn EncoderFactory>,
    probe: Arc<dyn MediaProbe>,
    remuxer: Arc<dyn Remuxer>,
    layout: StorageLayout,
    config: ReplayConfig,
    timings: CaptureTimings,
    tolerances: SyncTolerances,
    catalog: Option<Arc<dyn ClipStore>>,
}

impl CaptureManagerBuilder {
    pub fn new(
        source: Arc<dyn CaptureSource>,
        encoders: Arc<dyn EncoderFactory>,
        probe: Arc<dyn MediaProbe>,
        remuxer: Arc<dyn Remuxer>,
        layout: StorageLayout,
    ) -> Self {
        Self {
            source,
            encoders,
            probe,
            remuxer,
            layout,
            config: ReplayConfig::default(),
            timings: CaptureTimings::default(),
            tolerances: SyncTolerances::default(),
            catalog: None,
        }
    }

    pub fn config(mut self, config: ReplayConfig) -> Self {
        self.config = config.normalized();
        self
    }

    pub fn timings(mut self, timings: CaptureTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn tolerances(mut self, tolerances: SyncTolerances) -> Self {
        self.tolerances = tolerances;
        self
    }

    pub fn catalog(mut self, catalog: Arc<dyn ClipStore>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> Arc<CaptureManager> {
        let stitcher = ExportStitcher::new(self.probe.clone(), self.remuxer);
        Arc::new_cyclic(|me| CaptureManager {
            me: me.clone(),
            source: self.source,
            encoders: self.encoders,
            probe: self.probe,
            stitcher,
            catalog: self.catalog,
            buffer: SegmentRingBuffer::new(),
            layout: self.layout,
            timings: self.timings,
            tolerances: self.tolerances,
            config: Mutex::new(self.config),
            state: Mutex::new(CaptureState::Idle),
            saving: AtomicBool::new(false),
            save_done: Notify::new(),
            pipeline: tokio::sync::Mutex::new(Pipeline::default()),
            router: Arc::new(FrameRouter {
                active: Mutex::new(None),
                runtime: Mutex::new(None),
                manager: me.clone(),
            }),
            rotation_task: Mutex::new(None),
            generation: AtomicU64::new(0),
            writer_count: AtomicU64::new(0),
            on_interrupted: Mutex::new(None),
        })
    }
}

impl CaptureManager {
    pub fn state(&self) -> CaptureState {
        *lock(&self.state)
    }

    fn set_state(&self, state: CaptureState) {
        *lock(&self.state) = state;
    }

    pub fn config(&self) -> ReplayConfig {
        lock(&self.config).clone()
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::SeqCst)
    }

    // Register the capture-interrupted notification
    pub fn set_interrupt_handler(&self, handler: impl Fn(CaptureError) + Send + Sync + 'static) {
        *lock(&self.on_interrupted) = Some(Arc::new(handler));
    }

    pub fn get_status(&self) -> CaptureStatus {
        CaptureStatus {
            state: self.state(),
            is_saving: self.is_saving(),
            buffered_segments: self.buffer.len(),
            buffered_seconds: self.buffer.total_duration(),
            writer: self.router.active().map(|writer| writer.telemetry()),
        }
    }

    pub fn clips(&self) -> CaptureResult<Vec<Clip>> {
        match &self.catalog {
            Some(catalog) => catalog.fetch_all(),
            None => Ok(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Start / Stop
    // -------------------------------------------------------------------------

    /// Start the capture source, the first writer and the rotation loop.
    pub async fn start(&self) -> CaptureResult<()> {
        {
            let mut state = lock(&self.state);
            if *state != CaptureState::Idle {
                return Err(CaptureError::config(format!("capture is already {:?}", *state)));
            }
            *state = CaptureState::Starting;
        }

        match self.start_pipeline().await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::error!("Failed to start capture: {}", e);
                self.teardown(false).await;
                Err(e)
            }
        }
    }

    async fn start_pipeline(&self) -> CaptureResult<()> {
        let config = self.config();
        config.validate()?;

        self.layout.ensure_dirs()?;
        self.layout.cleanup_live_segments();
        if let Some(warning) = storage::low_storage_warning(&self.layout.live_dir) {
            log::warn!("{}", warning);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *lock(&self.router.runtime) = Some(Handle::current());

        let request = CaptureRequest {
            resolution: config.resolution(),
            quality: config.quality(),
            frame_rate: config.frame_rate,
            capture_audio: config.capture_audio,
        };
        let source = self.source.clone();
        let sink: Arc<dyn FrameSink> = self.router.clone();
        tokio::task::spawn_blocking(move || source.start_capture(&request, sink))
            .await
            .map_err(|e| CaptureError::source(format!("capture start task failed: {}", e)))??;

        let video_size = self.source.output_size().ok_or(CaptureError::NoDisplay)?;
        let include_audio = config.capture_audio && self.source.provides_audio();
        if config.capture_audio && !include_audio {
            log::warn!("{}; recording video only", CaptureError::NoAudioDevice);
        }

        let template = WriterSettings {
            output: String::new(),
            video_size,
            include_audio,
            audio: AudioTrackConfig::live(config.audio_codec()),
            quality: config.quality(),
            frame_rate: config.frame_rate,
            video_mode: VideoMode::Encode,
            tolerances: self.tolerances,
        };

        let active = Arc::new(self.prepare_writer(&template).await?);
        let standby = self.prepare_writer(&template).await?;
        {
            let mut pipeline = self.pipeline.lock().await;
            pipeline.active = Some(active.clone());
            pipeline.standby = Some(standby);
            pipeline.template = Some(template);
        }
        self.router.set_active(Some(active));

        self.set_state(CaptureState::Running);

        let interval = self.timings.segment_interval;
        let manager = self.me.clone();
        let task = tokio::spawn(async move {
            rotation_loop(manager, interval, generation).await;
        });
        *lock(&self.rotation_task) = Some(task);

        log::info!(
            "Replay capture started: {} @ {} fps, audio: {} (generation {})",
            video_size,
            config.frame_rate,
            include_audio,
            generation
        );
        Ok(())
    }

    /// Stop capture and discard every live segment.
    ///
    /// An in-flight save gets up to the drain timeout to finish first.
    pub async fn stop(&self) -> CaptureResult<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                CaptureState::Idle | CaptureState::Stopping => return Ok(()),
                _ => *state = CaptureState::Stopping,
            }
        }
        log::info!("Stopping replay capture");

        if self.is_saving() {
            log::info!("Waiting for the in-flight save before teardown");
            if tokio::time::timeout(self.timings.save_drain_timeout, self.wait_for_save())
                .await
                .is_err()
            {
                log::warn!(
                    "Save still running after {:?}, tearing down anyway",
                    self.timings.save_drain_timeout
                );
            }
        }

        self.teardown(true).await;
        log::info!("Replay capture stopped");
        Ok(())
    }

    async fn wait_for_save(&self) {
        loop {
            let notified = self.save_done.notified();
            if !self.is_saving() {
                break;
            }
            notified.await;
        }
    }

    // Tear the pipeline down to Idle, deleting every live file
    async fn teardown(&self, abort_rotation: bool) {
        self.set_state(CaptureState::Stopping);
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = lock(&self.rotation_task).take() {
            if abort_rotation {
                task.abort();
            }
        }

        self.router.set_active(None);
        let source = self.source.clone();
        if tokio::task::spawn_blocking(move || source.stop_capture()).await.is_err() {
            log::error!("Capture stop task failed");
        }

        let (active, standby) = {
            let mut pipeline = self.pipeline.lock().await;
            pipeline.template = None;
            (pipeline.active.take(), pipeline.standby.take())
        };
        drop(standby);
        if let Some(active) = active {
            // The unfinished tail is not needed for replay
            match active.finish_writing().await {
                Ok(path) => storage::remove_files(&[path]),
                Err(e) => log::debug!("Active writer discarded: {}", e),
            }
        }

        let cleared = self.buffer.clear();
        storage::remove_files(&cleared);
        self.layout.cleanup_live_segments();
        self.set_state(CaptureState::Idle);
    }

    // Fatal capture error: tear down and notify, at most once per session
    async fn handle_interruption(&self, error: CaptureError, abort_rotation: bool) {
        {
            let mut state = lock(&self.state);
            if *state != CaptureState::Running {
                return;
            }
            *state = CaptureState::Stopping;
        }
        log::error!("Capture interrupted: {}", error);
        self.teardown(abort_rotation).await;

        let handler = lock(&self.on_interrupted).clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Apply a new configuration, restarting capture if it is running and
    /// the change affects the writers.
    pub async fn update_config(&self, config: ReplayConfig) -> CaptureResult<()> {
        config.validate()?;
        let config = config.normalized();
        let restart = self.state() == CaptureState::Running && self.config().needs_capture_restart(&config);
        *lock(&self.config) = config;

        if restart {
            log::info!("Capture settings changed, restarting capture");
            self.stop().await?;
            self.start().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Writers and Rotation
    // -------------------------------------------------------------------------

    async fn prepare_writer(&self, template: &WriterSettings) -> CaptureResult<SegmentWriter> {
        let mut settings = template.clone();
        settings.output = self.layout.make_segment_path().to_string_lossy().into_owned();
        let label = format!("segment-{}", self.writer_count.fetch_add(1, Ordering::SeqCst) + 1);
        let factory = self.encoders.clone();
        let timeout = self.timings.finalize_timeout;

        tokio::task::spawn_blocking(move || {
            let mut writer = SegmentWriter::spawn(factory, label, timeout);
            writer.configure(settings)?;
            Ok(writer)
        })
        .await
        .map_err(|e| CaptureError::export(format!("writer setup task failed: {}", e)))?
    }

    // Configure the next standby off the rotation path
    fn prepare_standby_in_background(&self, template: WriterSettings) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let generation = self.generation.load(Ordering::SeqCst);
        tokio::spawn(async move {
            let writer = match manager.prepare_writer(&template).await {
                Ok(writer) => writer,
                Err(e) => {
                    log::warn!("Standby writer preparation failed: {}", e);
                    return;
                }
            };
            let mut pipeline = manager.pipeline.lock().await;
            let current = manager.generation.load(Ordering::SeqCst) == generation
                && pipeline.template.is_some()
                && pipeline.standby.is_none();
            if current {
                pipeline.standby = Some(writer);
            }
        });
    }

    /// Seamless handoff to the standby writer.
    ///
    /// Returns the finalized segment file of the old writer, or `None` when
    /// it had not received any frame.
    async fn rotate(&self) -> CaptureResult<Option<PathBuf>> {
        let mut pipeline = self.pipeline.lock().await;
        let template = pipeline.template.clone().ok_or(CaptureError::WriterUnavailable)?;

        let next = match pipeline.standby.take() {
            Some(writer) => writer,
            None => {
                log::warn!("No standby writer ready, configuring one during rotation");
                self.prepare_writer(&template).await?
            }
        };

        let next = Arc::new(next);
        let old = pipeline.active.replace(next.clone());
        self.router.set_active(Some(next));

        tokio::time::sleep(self.timings.rotation_settle_delay).await;
        self.prepare_standby_in_background(template);

        let Some(old) = old else {
            return Err(CaptureError::WriterUnavailable);
        };
        match old.finish_writing().await {
            Ok(path) => Ok(Some(path)),
            Err(CaptureError::NoFramesCaptured) => {
                log::warn!("{}: rotated out without frames", old.label());
                Ok(None)
            }
            Err(e) => {
                if let Some(path) = old.output_path() {
                    storage::remove_files(&[path]);
                }
                Err(e)
            }
        }
    }

    // Measure a finalized segment and add it to the ring buffer
    async fn store_segment(&self, path: PathBuf) -> CaptureResult<Segment> {
        let ready = storage::wait_for_file_ready(
            &path,
            self.timings.file_ready_attempts,
            self.timings.file_ready_delay,
        )
        .await;
        if !ready {
            storage::remove_files(&[&path]);
            return Err(CaptureError::export(format!("segment {:?} never became readable", path)));
        }

        let probe = self.probe.clone();
        let probe_path = path.clone();
        let measured = tokio::task::spawn_blocking(move || measure_duration(probe.as_ref(), &probe_path))
            .await
            .map_err(|e| CaptureError::export(format!("probe task failed: {}", e)))
            .and_then(|result| result);

        let duration = match measured {
            Ok(duration) => duration,
            Err(e) => {
                log::error!("Discarding segment {:?}: {}", path, e);
                storage::remove_files(&[&path]);
                return Err(e);
            }
        };

        // Teardown already cleared the buffer
        if self.state() == CaptureState::Idle {
            storage::remove_files(&[&path]);
            return Err(CaptureError::export("capture stopped before the segment was stored"));
        }

        let segment = Segment::new(path, duration);
        let pruned = self.buffer.append(segment.clone(), self.timings.max_buffer_seconds);
        storage::remove_files(&pruned);
        log::info!(
            "Segment stored ({:.2}s); buffer holds {} segment(s), {:.1}s",
            duration,
            self.buffer.len(),
            self.buffer.total_duration()
        );
        Ok(segment)
    }

    async fn rotate_and_store(&self) -> CaptureResult<()> {
        if let Some(path) = self.rotate().await? {
            self.store_segment(path).await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Save Replay
    // -------------------------------------------------------------------------

    /// Export the trailing `seconds` of capture into a new clip.
    pub async fn save_replay(&self, seconds: f64, container: Container) -> CaptureResult<Clip> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(CaptureError::config(format!(
                "replay duration must be a positive number of seconds, got {}",
                seconds
            )));
        }
        if self.state() != CaptureState::Running {
            return Err(CaptureError::NoFramesCaptured);
        }
        if self
            .saving
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CaptureError::SaveInProgress);
        }

        let result = self.save_exclusive(seconds, container).await;

        self.saving.store(false, Ordering::SeqCst);
        self.save_done.notify_waiters();

        match &result {
            Ok(clip) => log::info!("Replay saved: {:?} ({:.1}s)", clip.path, clip.duration_seconds),
            Err(e) => log::error!("Replay save failed: {}", e),
        }
        result
    }

    // Save using the configured replay duration and container
    pub async fn save_configured_replay(&self) -> CaptureResult<Clip> {
        let config = self.config();
        self.save_replay(config.replay_duration_seconds, config.container()).await
    }

    async fn save_exclusive(&self, seconds: f64, container: Container) -> CaptureResult<Clip> {
        let rotated = match self.rotate().await {
            Ok(path) => path,
            Err(e) => {
                let message = e.to_string();
                self.handle_interruption(e, true).await;
                return Err(CaptureError::export(format!("rotation failed: {}", message)));
            }
        };
        if let Some(path) = rotated {
            self.store_segment(path).await?;
        }

        let segments = self.buffer.latest(seconds);
        let output = self.layout.make_clip_path(container);
        let exported = self
            .stitcher
            .export(segments.clone(), seconds, output.clone(), container)
            .await;
        self.buffer.unlock(&segments);
        let plan = exported?;

        let probe = self.probe.clone();
        let probe_path = output.clone();
        let duration = tokio::task::spawn_blocking(move || measure_duration(probe.as_ref(), &probe_path))
            .await
            .ok()
            .and_then(|result| result.ok())
            .unwrap_or(plan.duration);

        let clip = Clip {
            id: Uuid::new_v4(),
            path: output.clone(),
            created_at: Utc::now(),
            duration_seconds: duration,
            tags: Vec::new(),
        };

        let Some(catalog) = self.catalog.clone() else {
            return Ok(clip);
        };
        let saved = tokio::task::spawn_blocking(move || catalog.save(clip))
            .await
            .map_err(|e| CaptureError::storage(format!("catalog task failed: {}", e)))
            .and_then(|result| result);
        if saved.is_err() {
            storage::remove_files(&[&output]);
        }
        saved
    }
}

// Periodic rotation until superseded or stopped
async fn rotation_loop(manager: Weak<CaptureManager>, interval: std::time::Duration, generation: u64) {
    log::info!("Segment rotation loop started (interval: {:?}, generation: {})", interval, generation);

    loop {
        tokio::time::sleep(interval).await;

        let Some(manager) = manager.upgrade() else {
            break;
        };
        if manager.generation.load(Ordering::SeqCst) != generation {
            log::info!("Segment rotation loop: superseded (gen {}), exiting", generation);
            break;
        }
        if manager.state() != CaptureState::Running {
            break;
        }

        log::debug!("Rotating segment...");
        if let Err(e) = manager.rotate_and_store().await {
            if manager.generation.load(Ordering::SeqCst) == generation {
                manager.handle_interruption(e, false).await;
            }
            break;
        }
    }

    log::info!("Segment rotation loop ended (generation: {})", generation);
}
