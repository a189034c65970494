//! PCM audio capture for the mplane camera source.
//!
//! A dedicated thread reads interleaved S16 blocks from an [`AudioDevice`], applies a fixed
//! gain, stamps each block from a monotonic start time plus the frames emitted so far, and
//! hands it to an [`AudioSink`]. The `alsa` feature provides the hardware backend and
//! [`ToneBackend`] a virtual one.

#[cfg(all(feature = "alsa", target_os = "linux"))]
mod alsa_backend;
mod capture;
mod clock;
mod device;
mod error;
mod gain;
mod sink;
mod tone;

#[cfg(all(feature = "alsa", target_os = "linux"))]
pub use alsa_backend::{AlsaBackend, AlsaDevice};
pub use capture::{AudioCaptureConfig, AudioCaptureSession};
pub use clock::{Clock, MonotonicClock, TimestampPacer};
pub use device::{AudioBackend, AudioDevice, AudioParams};
pub use error::AudioError;
pub use gain::apply_gain;
pub use sink::{AudioBlock, AudioSink, ChannelSink, SpeakerLayout, AUDIO_CHANNEL_CAPACITY};
pub use tone::{ToneBackend, ToneDevice, TONE_DEVICE_PREFIX};

/// Result type for audio operations.
pub type AudioResult<T> = Result<T, AudioError>;
