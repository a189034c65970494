//! Typed host<->source settings, state and events for the mplane camera source.
//!
//! This crate defines the configuration surface the host persists, the lifecycle
//! state machine of a capture source, and the events a source reports back.

mod events;
mod state;
mod types;

pub use events::SourceEvent;
pub use state::{SourceState, StartupPhase, StopReason};
pub use types::{
    FormatInfo, ParseResolutionError, Resolution, SourceMetrics, SourceSettings,
    DEFAULT_AUDIO_DEVICE, DEFAULT_DEVICE_PATH, MAX_BUFFERS,
};

use crossbeam_channel::{Receiver, Sender};

/// Channel capacity for events (source -> host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SourceEvent>, Receiver<SourceEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
