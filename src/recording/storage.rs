/**
 * ============================================================================
 * RECORDING STORAGE MODULE
 * ============================================================================
 *
 * PURPOSE: File layout for live segments and exported clips
 *
 * FUNCTIONALITY:
 * - Resolve and create the live scratch and clip directories
 * - Name live segments with a recognisable prefix
 * - Remove orphaned live files left behind by a crash
 * - Poll for finalized files to become visible
 * - Free-space checks and clip storage totals
 *
 * FILE STRUCTURE:
 * <temp>/Rewind/
 * ├── rewind_live_<uuid>.mov          # finalized live segment
 * ├── rewind_live_<uuid>.video.mkv    # encoder intermediate
 * └── rewind_live_<uuid>.audio.wav    # encoder intermediate
 * <Movies>/Rewind/
 * └── Rewind_2025-01-15_10-30-00_ab12cd34.mov
 *
 * ============================================================================
 */

use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::types::Container;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sysinfo::Disks;
use uuid::Uuid;
use walkdir::WalkDir;

pub const LIVE_SEGMENT_PREFIX: &str = "rewind_live_";

// Free space below which a warning is surfaced
pub const LOW_STORAGE_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024 * 1024;

// Directories used by the capture pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct StorageLayout {
    pub live_dir: PathBuf,
    pub clips_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(live_dir: PathBuf, clips_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            live_dir,
            clips_dir,
            data_dir,
        }
    }

    // Platform defaults: temp scratch, Movies (or home) for clips, data dir for the catalog
    pub fn default_dirs() -> Self {
        let live_dir = std::env::temp_dir().join("Rewind");
        let clips_dir = dirs::video_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join("Rewind");
        let data_dir = dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("rewind");
        Self::new(live_dir, clips_dir, data_dir)
    }

    // Ensure the live and clip directories exist
    pub fn ensure_dirs(&self) -> CaptureResult<()> {
        for dir in [&self.live_dir, &self.clips_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| CaptureError::storage(format!("Failed to create {:?}: {}", dir, e)))?;
        }
        Ok(())
    }

    // Path for a new live segment
    pub fn make_segment_path(&self) -> PathBuf {
        self.live_dir
            .join(format!("{}{}.mov", LIVE_SEGMENT_PREFIX, Uuid::new_v4()))
    }

    // Path for a new exported clip
    pub fn make_clip_path(&self, container: Container) -> PathBuf {
        let stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let short_id: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        self.clips_dir
            .join(format!("Rewind_{}_{}.{}", stamp, short_id, container.extension()))
    }

    // Delete every file in the live directory carrying the live prefix
    pub fn cleanup_live_segments(&self) -> u32 {
        if !self.live_dir.exists() {
            return 0;
        }

        let mut files_deleted: u32 = 0;

        for entry in WalkDir::new(&self.live_dir)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_live = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(LIVE_SEGMENT_PREFIX))
                .unwrap_or(false);
            if !is_live {
                continue;
            }
            if let Err(e) = std::fs::remove_file(entry.path()) {
                log::warn!("Failed to delete orphaned segment {:?}: {}", entry.path(), e);
            } else {
                files_deleted += 1;
            }
        }

        if files_deleted > 0 {
            log::info!("Cleaned up {} orphaned live segment file(s)", files_deleted);
        }
        files_deleted
    }
}

// Remove files, ignoring ones already gone
pub fn remove_files<P: AsRef<Path>>(paths: &[P]) {
    for path in paths {
        let path = path.as_ref();
        match std::fs::remove_file(path) {
            Ok(()) => log::debug!("Removed {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove {:?}: {}", path, e),
        }
    }
}

// Non-empty regular file
pub fn is_file_ready(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

// Poll until the file exists and is non-empty
pub async fn wait_for_file_ready(path: &Path, attempts: u32, delay: Duration) -> bool {
    for attempt in 0..attempts.max(1) {
        if is_file_ready(path) {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    log::warn!("File not ready after {} attempt(s): {:?}", attempts, path);
    false
}

// Free bytes on the volume holding `path`
pub fn available_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

// Warning message when free space is low
pub fn low_storage_warning(path: &Path) -> Option<String> {
    let available = available_space(path)?;
    if available >= LOW_STORAGE_THRESHOLD_BYTES {
        return None;
    }
    let gigabytes = available as f64 / (1024.0 * 1024.0 * 1024.0);
    Some(format!(
        "Low storage: {:.1} GB free. Replay saves may fail.",
        gigabytes
    ))
}

// Calculate total storage used by files under a directory
pub fn calculate_total_storage(dir: &Path) -> u64 {
    if !dir.exists() {
        return 0;
    }

    let mut total_size: u64 = 0;

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() {
            if let Ok(metadata) = entry.metadata() {
                total_size += metadata.len();
            }
        }
    }

    total_size
}
