//! Command-line host for the mplane camera source.
//!
//! Starts a capture source, drives it from a tick thread and a render thread, drains captured
//! audio, optionally switches resolution halfway through, and prints the final metrics.

mod snapshot;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mplanecam_audio::{AudioBackend, AudioBlock, ChannelSink, ToneBackend, TONE_DEVICE_PREFIX};
use mplanecam_capture::{VideoBackend, VirtualBackend, VIRTUAL_PATH_PREFIX};
use mplanecam_engine::CaptureSource;
use mplanecam_ipc::{Resolution, SourceEvent, SourceSettings};

use crate::snapshot::SnapshotRenderer;

/// Drive a multi-planar NV12 camera source from the command line.
#[derive(Debug, Parser)]
#[command(name = "mplanecam-probe", version, about)]
struct Args {
    /// JSON settings file. Flags override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Capture device node, or `virtual` for the test pattern.
    #[arg(short, long)]
    device: Option<String>,

    /// Capture resolution (1920x1080, 1280x720 or 640x480).
    #[arg(short, long)]
    resolution: Option<Resolution>,

    /// Driver buffers to request.
    #[arg(long)]
    buffers: Option<u32>,

    /// Audio endpoint, or `virtual` for a test tone.
    #[arg(long)]
    audio_device: Option<String>,

    /// Disable audio capture.
    #[arg(long, conflicts_with = "audio_device")]
    no_audio: bool,

    /// Linear audio gain.
    #[arg(long)]
    gain: Option<f32>,

    /// How long to run, in seconds.
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Capture step rate in Hz.
    #[arg(long, default_value_t = 60)]
    tick_hz: u32,

    /// Switch to this resolution halfway through the run.
    #[arg(long)]
    switch_to: Option<Resolution>,

    /// Write the last presented frame to this path as PPM.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

impl Args {
    /// Loads the settings file, if any, and applies flag overrides.
    fn settings(&self) -> Result<SourceSettings> {
        let mut settings = match &self.config {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => SourceSettings::default(),
        };

        if let Some(device) = &self.device {
            settings.device_path = device.clone();
        }
        if let Some(resolution) = self.resolution {
            settings.resolution = resolution;
        }
        if let Some(buffers) = self.buffers {
            settings.buffer_count = buffers;
        }
        if let Some(audio_device) = &self.audio_device {
            settings.audio_device = audio_device.clone();
        }
        if self.no_audio {
            settings.audio_device.clear();
        }
        if let Some(gain) = self.gain {
            settings.audio_gain = gain;
        }
        Ok(settings)
    }

    fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz.max(1)))
    }
}

/// Initialize logging.
fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();
    let settings = args.settings()?;
    debug!(?settings, "Loaded settings");
    with_video(&args, settings)
}

fn with_video(args: &Args, settings: SourceSettings) -> Result<()> {
    if settings.device_path.starts_with(VIRTUAL_PATH_PREFIX) {
        return with_audio(VirtualBackend::default(), args, settings);
    }
    with_device_video(args, settings)
}

#[cfg(all(feature = "v4l2", target_os = "linux"))]
fn with_device_video(args: &Args, settings: SourceSettings) -> Result<()> {
    with_audio(mplanecam_capture::V4l2Backend, args, settings)
}

#[cfg(not(all(feature = "v4l2", target_os = "linux")))]
fn with_device_video(args: &Args, settings: SourceSettings) -> Result<()> {
    warn!(
        device = %settings.device_path,
        "Built without V4L2 support, capturing the virtual test pattern instead"
    );
    let settings = SourceSettings {
        device_path: VIRTUAL_PATH_PREFIX.to_string(),
        ..settings
    };
    with_audio(VirtualBackend::default(), args, settings)
}

fn with_audio<V: VideoBackend>(video: V, args: &Args, settings: SourceSettings) -> Result<()> {
    if !settings.audio_enabled() || settings.audio_device.starts_with(TONE_DEVICE_PREFIX) {
        return run(video, ToneBackend::default(), args, settings);
    }
    with_device_audio(video, args, settings)
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn with_device_audio<V: VideoBackend>(video: V, args: &Args, settings: SourceSettings) -> Result<()> {
    run(video, mplanecam_audio::AlsaBackend, args, settings)
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn with_device_audio<V: VideoBackend>(video: V, args: &Args, settings: SourceSettings) -> Result<()> {
    warn!(
        device = %settings.audio_device,
        "Built without ALSA support, capturing a test tone instead"
    );
    let settings = SourceSettings {
        audio_device: TONE_DEVICE_PREFIX.to_string(),
        ..settings
    };
    run(video, ToneBackend::default(), args, settings)
}

fn run<V: VideoBackend, A: AudioBackend>(
    video: V,
    audio: A,
    args: &Args,
    settings: SourceSettings,
) -> Result<()> {
    let (sink, blocks) = ChannelSink::channel();
    let (event_tx, events) = mplanecam_ipc::event_channel();
    let renderer = SnapshotRenderer::new();

    let source = CaptureSource::new(video, audio, Box::new(renderer.clone()), Arc::new(sink))
        .with_events(event_tx);

    let format = source
        .start(&settings)
        .with_context(|| format!("failed to start capture on {}", settings.device_path))?;
    info!(
        width = format.width,
        height = format.height,
        planes = format.plane_count,
        buffers = format.buffer_count,
        "Capture started"
    );

    let running = AtomicBool::new(true);
    let audio_frames = AtomicU64::new(0);
    let tick = args.tick_interval();
    let run_for = Duration::from_secs_f64(args.seconds.max(0.0));

    thread::scope(|scope| {
        scope.spawn(|| {
            while running.load(Ordering::SeqCst) {
                source.step();
                thread::sleep(tick);
            }
        });
        scope.spawn(|| {
            while running.load(Ordering::SeqCst) {
                source.render();
                thread::sleep(tick);
            }
        });
        scope.spawn(|| consume_audio(&blocks, &running, &audio_frames));

        let started = Instant::now();
        let mut switched = args.switch_to.is_none();
        let mut last_report = started;
        while started.elapsed() < run_for {
            thread::sleep(Duration::from_millis(50));

            if !switched && started.elapsed() >= run_for / 2 {
                switched = true;
                if let Some(resolution) = args.switch_to {
                    info!(%resolution, "Switching resolution");
                    if let Err(e) = source.reconfigure(&settings.device_path, resolution) {
                        error!(error = %e, "Resolution switch failed");
                    }
                }
            }

            if last_report.elapsed() >= Duration::from_secs(1) {
                last_report = Instant::now();
                source.emit_metrics();
            }
            log_events(&events);
        }
        running.store(false, Ordering::SeqCst);
    });

    let metrics = source.metrics();
    source.destroy();
    log_events(&events);

    info!(
        frames = audio_frames.load(Ordering::Relaxed),
        "Audio frames received"
    );
    if let Some(path) = &args.snapshot {
        renderer
            .snapshot()
            .save_ppm(path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), "Saved last frame");
    }

    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

fn consume_audio(blocks: &Receiver<AudioBlock>, running: &AtomicBool, frames: &AtomicU64) {
    let mut last_timestamp = None;
    while running.load(Ordering::SeqCst) {
        match blocks.recv_timeout(Duration::from_millis(100)) {
            Ok(block) => {
                if last_timestamp.is_some_and(|last| block.timestamp_ns <= last) {
                    warn!(timestamp_ns = block.timestamp_ns, "Audio timestamp went backwards");
                }
                last_timestamp = Some(block.timestamp_ns);
                frames.fetch_add(u64::from(block.frames), Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn log_events(events: &Receiver<SourceEvent>) {
    for event in events.try_iter() {
        match event {
            SourceEvent::StateChanged { previous, current } => {
                debug!(previous = previous.name(), current = current.name(), "State changed");
            }
            SourceEvent::FormatNegotiated(format) => {
                info!(width = format.width, height = format.height, "Format negotiated");
            }
            SourceEvent::ReconfigureFailed { message } => {
                warn!(%message, "Reconfiguration failed");
            }
            SourceEvent::AudioUnavailable { message } => {
                warn!(%message, "Audio unavailable");
            }
            SourceEvent::Stopped { reason } => {
                info!(reason = %reason.message(), "Source stopped");
            }
            SourceEvent::Metrics(metrics) => {
                info!(
                    fps = metrics.fps,
                    converted = metrics.frames_converted,
                    presented = metrics.frames_presented,
                    dropped = metrics.frames_dropped,
                    "Capture metrics"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_settings_file() {
        let path = std::env::temp_dir().join(format!("mplanecam-probe-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{"device_path":"/dev/video3","resolution":"1280x720","audio_gain":2.0}"#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "mplanecam-probe",
            "--config",
            path.to_str().unwrap(),
            "--resolution",
            "640x480",
            "--no-audio",
        ])
        .unwrap();
        let settings = args.settings().unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(settings.device_path, "/dev/video3");
        assert_eq!(settings.resolution, Resolution::Vga);
        assert_eq!(settings.audio_gain, 2.0);
        assert!(!settings.audio_enabled());
    }

    #[test]
    fn test_rejects_unknown_resolution_flag() {
        assert!(Args::try_parse_from(["mplanecam-probe", "--resolution", "800x600"]).is_err());
    }

    #[test]
    fn test_defaults_without_file() {
        let args = Args::try_parse_from(["mplanecam-probe", "--device", "virtual"]).unwrap();
        let settings = args.settings().unwrap();
        assert_eq!(settings.device_path, "virtual");
        assert_eq!(settings.resolution, Resolution::Hd1080);
        assert_eq!(args.tick_interval(), Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn test_missing_settings_file_is_an_error() {
        let args = Args::try_parse_from(["mplanecam-probe", "--config", "/nonexistent/probe.json"])
            .unwrap();
        assert!(args.settings().is_err());
    }
}
