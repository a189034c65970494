//! Common types shared between the host and the capture source.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Upper bound on the number of driver buffers a session will request.
pub const MAX_BUFFERS: u32 = 4;

/// Default capture device node.
pub const DEFAULT_DEVICE_PATH: &str = "/dev/video11";

/// Default ALSA capture endpoint.
pub const DEFAULT_AUDIO_DEVICE: &str = "hw:0,0";

/// Resolution selector offered by the host's property UI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// 1920x1080.
    #[default]
    Hd1080,

    /// 1280x720.
    Hd720,

    /// 640x480.
    Vga,
}

impl Resolution {
    /// All selectable resolutions, largest first.
    pub const ALL: [Resolution; 3] = [Self::Hd1080, Self::Hd720, Self::Vga];

    /// Requested width and height in pixels.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Self::Hd1080 => (1920, 1080),
            Self::Hd720 => (1280, 720),
            Self::Vga => (640, 480),
        }
    }

    /// The selector string, e.g. `"1280x720"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hd1080 => "1920x1080",
            Self::Hd720 => "1280x720",
            Self::Vga => "640x480",
        }
    }

    /// Parse a selector, falling back to the default for unknown strings.
    pub fn parse_lenient(selector: &str) -> Self {
        selector.parse().unwrap_or_default()
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a resolution selector is not one of the offered values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported resolution selector: {0:?}")]
pub struct ParseResolutionError(pub String);

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| ParseResolutionError(s.to_string()))
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let selector = String::deserialize(deserializer)?;
        Ok(Self::parse_lenient(&selector))
    }
}

/// Settings for one capture source instance.
///
/// Every field has a default so partially written settings files still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Capture device node (e.g. "/dev/video11").
    pub device_path: String,

    /// Requested capture resolution.
    pub resolution: Resolution,

    /// Number of driver buffers to request.
    pub buffer_count: u32,

    /// Audio capture endpoint. Empty disables audio.
    pub audio_device: String,

    /// Linear gain applied to every captured sample.
    pub audio_gain: f32,

    /// Audio sample rate in Hz.
    pub sample_rate: u32,

    /// Number of interleaved audio channels.
    pub channels: u16,

    /// Frames per blocking audio read.
    pub period_frames: u32,
}

impl SourceSettings {
    /// Buffer count clamped to what a session may request.
    pub fn effective_buffer_count(&self) -> u32 {
        self.buffer_count.clamp(1, MAX_BUFFERS)
    }

    /// Whether audio capture is enabled.
    pub fn audio_enabled(&self) -> bool {
        !self.audio_device.trim().is_empty()
    }
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            device_path: DEFAULT_DEVICE_PATH.to_string(),
            resolution: Resolution::default(),
            buffer_count: MAX_BUFFERS,
            audio_device: DEFAULT_AUDIO_DEVICE.to_string(),
            audio_gain: 4.0,
            sample_rate: 48_000,
            channels: 2,
            period_frames: 1024,
        }
    }
}

/// Format the driver settled on for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatInfo {
    /// Negotiated width in pixels.
    pub width: u32,

    /// Negotiated height in pixels.
    pub height: u32,

    /// Planes per buffer (1 or 2).
    pub plane_count: u32,

    /// Bytes per luma row.
    pub luma_stride: u32,

    /// Bytes per chroma row.
    pub chroma_stride: u32,

    /// Buffers granted by the driver.
    pub buffer_count: u32,
}

/// Real-time capture metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetrics {
    /// Frames converted per second since the last report.
    pub fps: f32,

    /// Buffers dequeued from the driver.
    pub frames_dequeued: u64,

    /// Frames converted and published to the front buffer.
    pub frames_converted: u64,

    /// Frames uploaded by the render path.
    pub frames_presented: u64,

    /// Dequeued buffers that could not be converted.
    pub frames_dropped: u64,

    /// Hard dequeue errors (not counting "not ready").
    pub dequeue_errors: u64,

    /// Failed buffer resubmissions.
    pub requeue_failures: u64,

    /// Seconds since the current session started streaming.
    pub uptime_seconds: u64,
}
