/**
 * ============================================================================
 * CLIP LIBRARY MODULE
 * ============================================================================
 *
 * PURPOSE: Persistent catalog of exported replay clips
 *
 * STORAGE STRUCTURE:
 * <data dir>/rewind/
 * └── clips.json  (clip records, oldest first)
 *
 * BEHAVIOR:
 * - Upsert by clip id
 * - Atomic writes (temp file + rename)
 * - Unreadable index is reported, never silently replaced
 *
 * ============================================================================
 */

use crate::recording::error::{CaptureError, CaptureResult};
use crate::recording::types::Clip;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub trait ClipStore: Send + Sync {
    // All clips, newest first
    fn fetch_all(&self) -> CaptureResult<Vec<Clip>>;

    // Insert or replace by id
    fn save(&self, clip: Clip) -> CaptureResult<Clip>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ClipIndex {
    clips: Vec<Clip>,
}

/**
 * Clip catalog stored as a single JSON index
 * Writers are serialized through an in-process lock
 */
pub struct JsonClipStore {
    index_path: PathBuf,
    lock: Mutex<()>,
}

impl JsonClipStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            index_path: data_dir.join("clips.json"),
            lock: Mutex::new(()),
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    fn load_index(&self) -> CaptureResult<ClipIndex> {
        if !self.index_path.exists() {
            return Ok(ClipIndex::default());
        }
        let json_str = fs::read_to_string(&self.index_path)
            .map_err(|e| CaptureError::storage(format!("Failed to read clip index: {}", e)))?;
        serde_json::from_str(&json_str)
            .map_err(|e| CaptureError::storage(format!("Failed to parse clip index: {}", e)))
    }

    /**
     * Save clip index to disk atomically
     */
    fn save_index(&self, index: &ClipIndex) -> CaptureResult<()> {
        if let Some(parent) = self.index_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CaptureError::storage(format!("Failed to create data directory: {}", e)))?;
        }

        let json_str = serde_json::to_string_pretty(index)
            .map_err(|e| CaptureError::storage(format!("Failed to serialize clip index: {}", e)))?;

        let temp_path = self.index_path.with_extension("json.tmp");
        fs::write(&temp_path, json_str)
            .map_err(|e| CaptureError::storage(format!("Failed to write temp clip index: {}", e)))?;

        fs::rename(&temp_path, &self.index_path)
            .map_err(|e| CaptureError::storage(format!("Failed to save clip index: {}", e)))?;

        Ok(())
    }
}

impl ClipStore for JsonClipStore {
    fn fetch_all(&self) -> CaptureResult<Vec<Clip>> {
        let _guard = self.lock.lock().map_err(|_| CaptureError::storage("clip index lock poisoned"))?;
        let mut clips = self.load_index()?.clips;
        clips.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(clips)
    }

    fn save(&self, clip: Clip) -> CaptureResult<Clip> {
        let _guard = self.lock.lock().map_err(|_| CaptureError::storage("clip index lock poisoned"))?;
        let mut index = self.load_index()?;

        match index.clips.iter_mut().find(|c| c.id == clip.id) {
            Some(existing) => *existing = clip.clone(),
            None => index.clips.push(clip.clone()),
        }
        self.save_index(&index)?;

        log::info!("Saved clip {} ({:.1}s) to library", clip.id, clip.duration_seconds);
        Ok(clip)
    }
}
