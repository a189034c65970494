//! ALSA capture backend.

use std::io;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use tracing::{debug, info};

use crate::device::{AudioBackend, AudioDevice, AudioParams};

fn to_io(err: alsa::Error) -> io::Error {
    io::Error::from_raw_os_error(err.errno())
}

/// Opens ALSA PCM capture endpoints such as `hw:0,0` or `default`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlsaBackend;

impl AudioBackend for AlsaBackend {
    type Device = AlsaDevice;

    fn open(&self, name: &str, params: &AudioParams) -> io::Result<AlsaDevice> {
        let pcm = PCM::new(name, Direction::Capture, false).map_err(to_io)?;

        let settled = {
            let hwp = HwParams::any(&pcm).map_err(to_io)?;
            hwp.set_access(Access::RWInterleaved).map_err(to_io)?;
            hwp.set_format(Format::s16()).map_err(to_io)?;
            hwp.set_channels(u32::from(params.channels)).map_err(to_io)?;
            hwp.set_rate(params.sample_rate, ValueOr::Nearest)
                .map_err(to_io)?;

            let period_us = u64::from(params.period_frames) * 1_000_000
                / u64::from(params.sample_rate.max(1));
            hwp.set_period_time_near(period_us as u32, ValueOr::Nearest)
                .map_err(to_io)?;
            pcm.hw_params(&hwp).map_err(to_io)?;

            let current = pcm.hw_params_current().map_err(to_io)?;
            AudioParams {
                sample_rate: current.get_rate().map_err(to_io)?,
                channels: current.get_channels().map_err(to_io)? as u16,
                period_frames: current.get_period_size().map_err(to_io)? as u32,
            }
        };

        pcm.prepare().map_err(to_io)?;
        pcm.start().map_err(to_io)?;

        info!(
            name,
            sample_rate = settled.sample_rate,
            channels = settled.channels,
            period_frames = settled.period_frames,
            "Opened ALSA capture device"
        );

        Ok(AlsaDevice {
            pcm,
            params: settled,
        })
    }
}

/// A started ALSA capture stream. The PCM handle is closed on drop.
pub struct AlsaDevice {
    pcm: PCM,
    params: AudioParams,
}

impl AudioDevice for AlsaDevice {
    fn params(&self) -> AudioParams {
        self.params
    }

    fn read(&mut self, buf: &mut [i16]) -> io::Result<usize> {
        let io = self.pcm.io_i16().map_err(to_io)?;
        io.readi(buf).map_err(to_io)
    }

    fn recover(&mut self) -> io::Result<()> {
        debug!(state = ?self.pcm.state(), "Re-preparing ALSA capture");
        self.pcm.prepare().map_err(to_io)?;
        self.pcm.start().map_err(to_io)
    }
}
