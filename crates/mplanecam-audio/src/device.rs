//! The audio device protocol consumed by the capture thread.

use std::io;

use mplanecam_ipc::SourceSettings;

/// Stream parameters requested from, and reported by, an audio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    /// Frames per second.
    pub sample_rate: u32,

    /// Interleaved channels per frame.
    pub channels: u16,

    /// Frames per blocking read.
    pub period_frames: u32,
}

impl AudioParams {
    /// Samples in one period across all channels.
    pub fn period_samples(&self) -> usize {
        self.period_frames as usize * self.channels as usize
    }
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            period_frames: 1024,
        }
    }
}

impl From<&SourceSettings> for AudioParams {
    fn from(settings: &SourceSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            period_frames: settings.period_frames,
        }
    }
}

/// An opened, prepared and started capture endpoint delivering interleaved S16 samples.
pub trait AudioDevice: Send + 'static {
    /// The parameters the device actually settled on.
    fn params(&self) -> AudioParams;

    /// Blocks until frames are available and fills `buf` with whole interleaved frames.
    ///
    /// Returns the number of frames read.
    fn read(&mut self, buf: &mut [i16]) -> io::Result<usize>;

    /// Re-prepares the device after a failed read (for example an overrun).
    fn recover(&mut self) -> io::Result<()>;
}

/// Opens capture endpoints by name.
pub trait AudioBackend: Send + Sync {
    /// Device type produced by this backend.
    type Device: AudioDevice;

    /// Opens `name`, applies `params` (nearest supported values win), prepares and starts it.
    fn open(&self, name: &str, params: &AudioParams) -> io::Result<Self::Device>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_from_settings() {
        let settings = SourceSettings {
            sample_rate: 44_100,
            channels: 1,
            period_frames: 512,
            ..Default::default()
        };
        let params = AudioParams::from(&settings);
        assert_eq!(params.sample_rate, 44_100);
        assert_eq!(params.period_samples(), 512);
    }
}
