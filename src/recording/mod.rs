/**
 * ============================================================================
 * RECORDING MODULE
 * ============================================================================
 *
 * PURPOSE: Background replay capture with instant clip export
 *
 * SUBMODULES:
 * - buffer: Rolling window of finalized live segments
 * - capture: Frame sources (synthetic, and scap behind `screen-capture`)
 * - config: Replay configuration, timing constants and persistence
 * - encoder: Encoder seam used by segment writers
 * - error: Capture error taxonomy
 * - export: Stitching the trailing window into one clip
 * - ffmpeg: FFmpeg-backed encoder, probe and remuxer
 * - library: Clip catalog
 * - manager: Capture lifecycle, rotation and saves
 * - scale: Frame downscaling for scaled resolutions
 * - storage: Directory layout and file housekeeping
 * - timing: Media timestamps and A/V sync tolerances
 * - types: Data structures and models
 * - writer: Single-segment writer worker
 *
 * ARCHITECTURE:
 * 1. A capture source pushes frames to the active segment writer
 * 2. Every rotation interval the active writer is swapped for a standby
 * 3. Finalized segments enter the ring buffer; old ones are pruned
 * 4. A save rotates, then remuxes the trailing window into a clip
 *
 * REQUIREMENTS:
 * - ffmpeg/ffprobe on PATH, or REWIND_FFMPEG/REWIND_FFPROBE set
 * - ffmpeg::init_ffmpeg_paths() must be called on startup
 *
 * ============================================================================
 */

pub mod buffer;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod export;
pub mod ffmpeg;
pub mod library;
pub mod manager;
pub mod scale;
pub mod storage;
pub mod timing;
pub mod types;
pub mod writer;

#[cfg(test)]
pub(crate) mod testing;
