//! Virtual audio backend producing a sine tone.

use std::f32::consts::TAU;
use std::io;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::device::{AudioBackend, AudioDevice, AudioParams};

/// Endpoint names served by the tone backend start with this prefix.
pub const TONE_DEVICE_PREFIX: &str = "virtual";

/// Opens [`ToneDevice`]s.
#[derive(Debug, Clone, Copy)]
pub struct ToneBackend {
    /// Tone frequency in Hz.
    pub frequency: f32,

    /// Peak amplitude.
    pub amplitude: i16,

    /// When set, reads block for the duration of the audio they return.
    pub realtime: bool,
}

impl Default for ToneBackend {
    fn default() -> Self {
        Self {
            frequency: 440.0,
            amplitude: 4096,
            realtime: true,
        }
    }
}

impl AudioBackend for ToneBackend {
    type Device = ToneDevice;

    fn open(&self, name: &str, params: &AudioParams) -> io::Result<ToneDevice> {
        if !name.starts_with(TONE_DEVICE_PREFIX) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no virtual audio endpoint named {name}"),
            ));
        }
        debug!(name, ?params, "Opened tone generator");
        Ok(ToneDevice {
            backend: *self,
            params: *params,
            phase: 0.0,
            next_deadline: None,
        })
    }
}

/// A sine generator behaving like a blocking capture endpoint.
#[derive(Debug)]
pub struct ToneDevice {
    backend: ToneBackend,
    params: AudioParams,
    phase: f32,
    next_deadline: Option<Instant>,
}

impl ToneDevice {
    fn pace(&mut self, frames: usize) {
        if !self.backend.realtime || self.params.sample_rate == 0 {
            return;
        }
        let period = Duration::from_secs_f64(frames as f64 / f64::from(self.params.sample_rate));
        let deadline = self.next_deadline.unwrap_or_else(Instant::now) + period;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.next_deadline = Some(deadline.max(now));
    }
}

impl AudioDevice for ToneDevice {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn read(&mut self, buf: &mut [i16]) -> io::Result<usize> {
        let channels = usize::from(self.params.channels.max(1));
        let frames = buf.len() / channels;
        let step = TAU * self.backend.frequency / self.params.sample_rate.max(1) as f32;

        for frame in buf.chunks_exact_mut(channels) {
            let value = (self.phase.sin() * f32::from(self.backend.amplitude)) as i16;
            frame.fill(value);
            self.phase = (self.phase + step) % TAU;
        }

        self.pace(frames);
        Ok(frames)
    }

    fn recover(&mut self) -> io::Result<()> {
        self.next_deadline = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> ToneBackend {
        ToneBackend {
            realtime: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_hardware_names() {
        assert!(backend().open("hw:0,0", &AudioParams::default()).is_err());
    }

    #[test]
    fn test_reads_whole_frames_within_amplitude() {
        let mut device = backend().open("virtual", &AudioParams::default()).unwrap();
        let mut buf = vec![0i16; 2048];
        assert_eq!(device.read(&mut buf).unwrap(), 1024);
        assert!(buf.iter().all(|s| s.abs() <= 4096));
        assert!(buf.chunks_exact(2).all(|f| f[0] == f[1]));
        assert!(buf.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_realtime_read_blocks_for_period() {
        let params = AudioParams {
            sample_rate: 1000,
            channels: 1,
            period_frames: 20,
        };
        let mut device = ToneBackend::default().open("virtual", &params).unwrap();
        let mut buf = vec![0i16; 20];
        let start = Instant::now();
        device.read(&mut buf).unwrap();
        device.read(&mut buf).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(35));
    }
}
