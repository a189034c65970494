//! The audio capture thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mplanecam_ipc::SourceSettings;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, TimestampPacer};
use crate::device::{AudioBackend, AudioDevice, AudioParams};
use crate::error::AudioError;
use crate::gain::apply_gain;
use crate::sink::{AudioBlock, AudioSink, SpeakerLayout};
use crate::AudioResult;

/// What to capture and how loud.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioCaptureConfig {
    /// Endpoint name, e.g. `hw:0,0`.
    pub device: String,

    /// Requested stream parameters.
    pub params: AudioParams,

    /// Linear gain applied to every sample.
    pub gain: f32,
}

impl From<&SourceSettings> for AudioCaptureConfig {
    fn from(settings: &SourceSettings) -> Self {
        Self {
            device: settings.audio_device.trim().to_string(),
            params: AudioParams::from(settings),
            gain: settings.audio_gain,
        }
    }
}

/// A running capture thread that owns its device.
///
/// The device moves into the thread and comes back through the join handle, so it is only
/// closed after the thread has stopped reading from it.
pub struct AudioCaptureSession<D: AudioDevice> {
    name: String,
    params: AudioParams,
    capture_thread: Mutex<Option<JoinHandle<D>>>,
    running: Arc<AtomicBool>,
    frames_captured: Arc<AtomicU64>,
}

impl<D: AudioDevice> AudioCaptureSession<D> {
    /// Opens the configured endpoint through `backend` and starts capturing from it.
    pub fn open<B>(
        backend: &B,
        config: &AudioCaptureConfig,
        sink: Arc<dyn AudioSink>,
        clock: Arc<dyn Clock>,
    ) -> AudioResult<Self>
    where
        B: AudioBackend<Device = D>,
    {
        let device = backend
            .open(&config.device, &config.params)
            .map_err(|source| AudioError::DeviceOpen {
                name: config.device.clone(),
                source,
            })?;
        Self::start(&config.device, device, config.gain, sink, clock)
    }

    /// Spawns the capture thread for an already opened device.
    #[instrument(name = "audio_capture_start", skip(device, sink, clock))]
    pub fn start(
        name: &str,
        device: D,
        gain: f32,
        sink: Arc<dyn AudioSink>,
        clock: Arc<dyn Clock>,
    ) -> AudioResult<Self> {
        let params = device.params();
        if params.sample_rate == 0 || params.channels == 0 || params.period_frames == 0 {
            return Err(AudioError::FormatNotSupported(format!("{params:?}")));
        }

        info!(
            sample_rate = params.sample_rate,
            channels = params.channels,
            period_frames = params.period_frames,
            "Starting audio capture"
        );

        let running = Arc::new(AtomicBool::new(true));
        let frames_captured = Arc::new(AtomicU64::new(0));

        let thread_running = Arc::clone(&running);
        let thread_frames = Arc::clone(&frames_captured);
        let handle = thread::Builder::new()
            .name("mplanecam-audio".to_string())
            .spawn(move || capture_thread(device, gain, sink, clock, thread_running, thread_frames))
            .map_err(AudioError::ThreadSpawn)?;

        Ok(Self {
            name: name.to_string(),
            params,
            capture_thread: Mutex::new(Some(handle)),
            running,
            frames_captured,
        })
    }

    /// Clears the running flag, joins the thread and closes the device.
    #[instrument(name = "audio_capture_stop", skip(self), fields(device = %self.name))]
    pub fn stop(&mut self) -> AudioResult<()> {
        let Some(handle) = self.capture_thread.lock().take() else {
            return Ok(());
        };

        info!("Stopping audio capture");
        self.running.store(false, Ordering::SeqCst);

        let device = handle.join().map_err(|_| AudioError::ThreadPanicked)?;
        drop(device);

        info!(
            frames = self.frames_captured.load(Ordering::Relaxed),
            "Audio capture stopped"
        );
        Ok(())
    }

    /// Whether the capture thread is still running.
    pub fn is_active(&self) -> bool {
        self.capture_thread
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters the device settled on.
    pub fn params(&self) -> AudioParams {
        self.params
    }

    /// Frames handed to the sink so far.
    pub fn frames_captured(&self) -> u64 {
        self.frames_captured.load(Ordering::Relaxed)
    }
}

impl<D: AudioDevice> Drop for AudioCaptureSession<D> {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "Audio capture did not stop cleanly");
        }
    }
}

fn capture_thread<D: AudioDevice>(
    mut device: D,
    gain: f32,
    sink: Arc<dyn AudioSink>,
    clock: Arc<dyn Clock>,
    running: Arc<AtomicBool>,
    frames_captured: Arc<AtomicU64>,
) -> D {
    let params = device.params();
    let channels = usize::from(params.channels);
    let layout = SpeakerLayout::from_channels(params.channels);
    let mut buffer = vec![0i16; params.period_samples()];
    let mut pacer = TimestampPacer::new(params.sample_rate);

    debug!("Audio capture thread entering read loop");

    while running.load(Ordering::SeqCst) {
        let frames = match device.read(&mut buffer) {
            Ok(0) => continue,
            Ok(frames) => frames.min(params.period_frames as usize),
            Err(e) => {
                debug!(error = %e, "Audio read failed, re-preparing device");
                if let Err(e) = device.recover() {
                    warn!(error = %e, "Audio device could not be recovered");
                    break;
                }
                continue;
            }
        };

        let samples = &mut buffer[..frames * channels];
        apply_gain(samples, gain);

        let timestamp_ns = pacer.stamp(clock.as_ref(), frames);
        sink.output(AudioBlock::from_samples(
            samples,
            params.sample_rate,
            layout,
            timestamp_ns,
        ));
        frames_captured.fetch_add(frames as u64, Ordering::Relaxed);
    }

    debug!("Audio capture thread exiting");
    device
}
