//! Error types for the audio module.

use std::io;

use thiserror::Error;

/// Errors that can occur during audio operations.
#[derive(Debug, Error)]
pub enum AudioError {
    /// The capture endpoint could not be opened or configured.
    #[error("Failed to open audio device {name}: {source}")]
    DeviceOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The device settled on parameters the capture thread cannot use.
    #[error("Audio format not supported: {0}")]
    FormatNotSupported(String),

    /// The capture thread could not be spawned.
    #[error("Failed to spawn audio capture thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// The capture thread panicked.
    #[error("Audio capture thread panicked")]
    ThreadPanicked,
}
