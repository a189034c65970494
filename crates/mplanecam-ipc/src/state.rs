//! Capture source state machine types.

use serde::{Deserialize, Serialize};

use crate::types::FormatInfo;

/// The lifecycle state of a capture source.
///
/// `Closed -> Starting -> Streaming <-> Reconfiguring`, and back to `Closed` on failure or
/// explicit destroy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SourceState {
    /// No live device.
    #[default]
    Closed,

    /// Bringing up a session.
    Starting {
        /// Current startup phase.
        phase: StartupPhase,
    },

    /// Device is streaming and the periodic step converts frames.
    Streaming {
        /// Negotiated session format.
        format: FormatInfo,
    },

    /// Tearing down and recreating the session with new parameters.
    Reconfiguring,
}

impl SourceState {
    /// Returns true if there is no live device.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns true if the source is streaming.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming { .. })
    }

    /// Returns true while a session is being brought up.
    pub fn is_starting(&self) -> bool {
        matches!(self, Self::Starting { .. })
    }

    /// Returns true while a reconfiguration is in progress.
    pub fn is_reconfiguring(&self) -> bool {
        matches!(self, Self::Reconfiguring)
    }

    /// Returns a simple string representation of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Closed => "Closed",
            Self::Starting { .. } => "Starting",
            Self::Streaming { .. } => "Streaming",
            Self::Reconfiguring => "Reconfiguring",
        }
    }
}

/// Startup phases for a capture session, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartupPhase {
    /// Opening the device node.
    OpenDevice,

    /// Negotiating the format, mapping driver buffers and turning streaming on.
    StartStreaming,

    /// Allocating the RGB frame buffers and render target.
    AllocateFrames,
}

impl StartupPhase {
    /// Returns the display name for this phase.
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenDevice => "Opening device",
            Self::StartStreaming => "Starting stream",
            Self::AllocateFrames => "Allocating frames",
        }
    }
}

/// Reason a session ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopReason {
    /// The host destroyed the source.
    Destroyed,

    /// Bringing up the session failed.
    StartFailed { message: String },

    /// Recreating the session with new parameters failed.
    ReconfigureFailed { message: String },
}

impl StopReason {
    /// Returns a display message for this reason.
    pub fn message(&self) -> String {
        match self {
            Self::Destroyed => "Source destroyed".to_string(),
            Self::StartFailed { message } => format!("Start failed: {message}"),
            Self::ReconfigureFailed { message } => format!("Reconfigure failed: {message}"),
        }
    }
}
