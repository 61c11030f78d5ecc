/**
 * ============================================================================
 * RECORDING ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: Error taxonomy shared by the replay capture pipeline
 *
 * KINDS:
 * - Configuration: invalid output target, rejected track configuration
 * - Capture source: no display / audio device, source start failure
 * - Timing/resource: no frames, finalize timeout, writer unavailable
 * - Export: no segments, unsupported container, passthrough failure
 * - Concurrency guard: save already in progress
 *
 * ============================================================================
 */

use thiserror::Error;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no display available for capture")]
    NoDisplay,

    #[error("no audio input device available")]
    NoAudioDevice,

    #[error("writer unavailable")]
    WriterUnavailable,

    #[error("no frames captured")]
    NoFramesCaptured,

    #[error("export failed: {0}")]
    ExportFailed(String),

    #[error("a replay save is already in progress")]
    SaveInProgress,

    #[error("invalid media duration")]
    InvalidDuration,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("capture source error: {0}")]
    CaptureSource(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    pub fn export(msg: impl Into<String>) -> Self {
        Self::ExportFailed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::CaptureSource(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn is_nothing_captured(&self) -> bool {
        matches!(self, Self::NoFramesCaptured)
    }

    pub fn is_save_in_progress(&self) -> bool {
        matches!(self, Self::SaveInProgress)
    }
}
