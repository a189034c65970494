//! Error types for the capture source controller.

use mplanecam_audio::AudioError;
use mplanecam_capture::CaptureError;
use thiserror::Error;

/// Errors surfaced by [`CaptureSource`](crate::CaptureSource) operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Video session bring-up or streaming failed.
    #[error(transparent)]
    Capture(#[from] CaptureError),

    /// Audio capture could not be started or stopped.
    #[error(transparent)]
    Audio(#[from] AudioError),

    /// The renderer rejected a target operation.
    #[error("Render target error: {0}")]
    Render(String),

    /// `start` was called on a source that is not closed.
    #[error("Source already started")]
    AlreadyStarted,

    /// The operation needs a started source.
    #[error("Source not started")]
    NotStarted,
}

/// Result type for controller operations.
pub type EngineResult<T> = Result<T, EngineError>;
