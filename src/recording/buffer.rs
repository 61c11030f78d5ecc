/**
 * ============================================================================
 * SEGMENT RING BUFFER MODULE
 * ============================================================================
 *
 * PURPOSE: Rolling window of finalized segments bounded by total duration
 *
 * BEHAVIOR:
 * - Ordered list of segments (oldest first) plus a set of locked ids
 * - append prunes the oldest unlocked segments once the newest ones cover
 *   the window; locked segments are never pruned
 * - latest selects the trailing segments for an export and locks them
 * - Every operation runs under one mutex, so the rotation loop and an
 *   in-flight save never interleave inside an operation
 *
 * ============================================================================
 */

use crate::recording::types::Segment;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
struct RingState {
    segments: VecDeque<Segment>,
    locked: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct SegmentRingBuffer {
    state: Mutex<RingState>,
}

impl SegmentRingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RingState> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a finalized segment and prune the buffer back to `max_window_seconds`.
    ///
    /// Walking newest to oldest, unlocked segments are kept until their
    /// cumulative duration reaches the window; every older unlocked segment is
    /// removed. Locked segments are always kept and do not count toward the
    /// window. A non-positive window disables pruning.
    ///
    /// Returns the removed segments' paths, oldest first, for deletion.
    pub fn append(&self, segment: Segment, max_window_seconds: f64) -> Vec<PathBuf> {
        let mut state = self.lock_state();
        log::debug!(
            "Appending segment {} ({:.2}s) to ring buffer",
            segment.id,
            segment.duration_seconds
        );
        state.segments.push_back(segment);

        if max_window_seconds <= 0.0 {
            return Vec::new();
        }

        let mut keep = vec![true; state.segments.len()];
        let mut total = 0.0;
        for (index, segment) in state.segments.iter().enumerate().rev() {
            if state.locked.contains(&segment.id) {
                continue;
            }
            if total < max_window_seconds {
                total += segment.duration_seconds;
            } else {
                keep[index] = false;
            }
        }

        let mut removed = Vec::new();
        let mut retained = VecDeque::with_capacity(state.segments.len());
        for (segment, keep) in state.segments.drain(..).zip(keep) {
            if keep {
                retained.push_back(segment);
            } else {
                removed.push(segment.path);
            }
        }
        state.segments = retained;

        if !removed.is_empty() {
            log::info!(
                "Pruned {} segment(s) from ring buffer ({} retained)",
                removed.len(),
                state.segments.len()
            );
        }
        removed
    }

    /// Select the trailing segments covering `total_seconds` and lock them.
    ///
    /// Unlocked segments whose file has disappeared are purged first. The
    /// result is chronological; every returned segment stays locked until
    /// passed to [`SegmentRingBuffer::unlock`].
    pub fn latest(&self, total_seconds: f64) -> Vec<Segment> {
        let mut state = self.lock_state();
        let RingState { segments, locked } = &mut *state;

        let before = segments.len();
        segments.retain(|segment| locked.contains(&segment.id) || segment.path.exists());
        if segments.len() != before {
            log::warn!(
                "Purged {} segment(s) whose files went missing",
                before - segments.len()
            );
        }

        let mut remaining = total_seconds;
        let mut selected = Vec::new();
        for segment in segments.iter().rev() {
            if remaining <= 0.0 {
                break;
            }
            if !segment.path.exists() {
                continue;
            }
            selected.push(segment.clone());
            remaining -= segment.duration_seconds;
        }
        selected.reverse();

        for segment in &selected {
            locked.insert(segment.id);
        }
        selected
    }

    // Release export locks; unknown or already-unlocked ids are ignored
    pub fn unlock(&self, segments: &[Segment]) {
        let mut state = self.lock_state();
        for segment in segments {
            state.locked.remove(&segment.id);
        }
    }

    // Drop every segment and lock, returning the files to delete
    pub fn clear(&self) -> Vec<PathBuf> {
        let mut state = self.lock_state();
        state.locked.clear();
        state.segments.drain(..).map(|segment| segment.path).collect()
    }

    pub fn len(&self) -> usize {
        self.lock_state().segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_duration(&self) -> f64 {
        self.lock_state()
            .segments
            .iter()
            .map(|segment| segment.duration_seconds)
            .sum()
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.lock_state().segments.iter().cloned().collect()
    }
}
