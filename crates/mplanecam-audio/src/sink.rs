//! The audio sink interface fed by the capture thread.

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

/// Channel capacity for captured audio blocks.
pub const AUDIO_CHANNEL_CAPACITY: usize = 8;

/// Speaker layout tag carried with each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeakerLayout {
    Mono,
    Stereo,
    /// Any other channel count, passed through untouched.
    Other(u16),
}

impl SpeakerLayout {
    pub fn from_channels(channels: u16) -> Self {
        match channels {
            1 => Self::Mono,
            2 => Self::Stereo,
            n => Self::Other(n),
        }
    }

    pub fn channels(self) -> u16 {
        match self {
            Self::Mono => 1,
            Self::Stereo => 2,
            Self::Other(n) => n,
        }
    }
}

/// One block of captured audio.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// Interleaved signed 16-bit samples, native endian.
    pub data: Bytes,

    /// Frames per second.
    pub sample_rate: u32,

    /// Channel layout of `data`.
    pub layout: SpeakerLayout,

    /// Frames in this block.
    pub frames: u32,

    /// Presentation time in monotonic nanoseconds.
    pub timestamp_ns: u64,
}

impl AudioBlock {
    /// Copies `samples` into a new block.
    pub fn from_samples(
        samples: &[i16],
        sample_rate: u32,
        layout: SpeakerLayout,
        timestamp_ns: u64,
    ) -> Self {
        let channels = usize::from(layout.channels().max(1));
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_ne_bytes());
        }
        Self {
            data: Bytes::from(data),
            sample_rate,
            layout,
            frames: (samples.len() / channels) as u32,
            timestamp_ns,
        }
    }

    /// Decodes the samples back out of the block.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(2)
            .map(|b| i16::from_ne_bytes([b[0], b[1]]))
            .collect()
    }
}

/// Receives blocks from the capture thread.
///
/// Called on the capture thread for every block; implementations must not block for long.
pub trait AudioSink: Send + Sync {
    fn output(&self, block: AudioBlock);
}

/// Forwards blocks over a bounded channel, dropping them when the consumer falls behind.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<AudioBlock>,
}

impl ChannelSink {
    pub fn new(sender: Sender<AudioBlock>) -> Self {
        Self { sender }
    }

    /// Creates a sink and the receiving end of its channel.
    pub fn channel() -> (Self, Receiver<AudioBlock>) {
        let (sender, receiver) = crossbeam_channel::bounded(AUDIO_CHANNEL_CAPACITY);
        (Self::new(sender), receiver)
    }
}

impl AudioSink for ChannelSink {
    fn output(&self, block: AudioBlock) {
        match self.sender.try_send(block) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                trace!("Audio channel full, dropping block");
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("Audio consumer gone, dropping block");
            }
        }
    }
}
