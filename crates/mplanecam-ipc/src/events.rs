//! Events sent from the capture source to the host.

use serde::{Deserialize, Serialize};

use crate::state::{SourceState, StopReason};
use crate::types::{FormatInfo, SourceMetrics};

/// Events that a capture source can send to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceEvent {
    /// Source state has changed.
    StateChanged {
        /// Previous state.
        previous: Box<SourceState>,

        /// Current state.
        current: Box<SourceState>,
    },

    /// The driver settled on a format for a new session.
    FormatNegotiated(FormatInfo),

    /// A live reconfiguration failed; the source has no device until the next one succeeds.
    ReconfigureFailed { message: String },

    /// Audio could not be started; video continues without it.
    AudioUnavailable { message: String },

    /// A session ended.
    Stopped { reason: StopReason },

    /// Updated capture metrics.
    Metrics(SourceMetrics),
}
