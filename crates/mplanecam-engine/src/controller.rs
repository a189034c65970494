//! The capture source controller.
//!
//! A [`CaptureSource`] owns one video session and, optionally, one audio capture thread. The
//! host drives it from two threads: a periodic tick calls [`CaptureSource::step`] to pull and
//! convert frames, and the render path calls [`CaptureSource::render`] to upload and draw the
//! latest one. Bring-up, reconfiguration and teardown run under the session lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, trace, warn};

use mplanecam_audio::{
    AudioBackend, AudioCaptureConfig, AudioCaptureSession, AudioSink, Clock, MonotonicClock,
};
use mplanecam_capture::{nv12_to_bgra, CaptureError, CaptureStream, VideoBackend};
use mplanecam_ipc::{
    FormatInfo, Resolution, SourceEvent, SourceMetrics, SourceSettings, SourceState,
    StartupPhase, StopReason,
};

use crate::exchange::{FrameExchange, SessionLocks};
use crate::metrics::CaptureStats;
use crate::render::{RenderState, Renderer};
use crate::{EngineError, EngineResult};

type VideoDevice<V> = <V as VideoBackend>::Device;
type PcmDevice<A> = <A as AudioBackend>::Device;

/// Everything guarded by the session lock.
struct Session<V: VideoBackend, A: AudioBackend> {
    /// Settings of the current session. `None` until started and after destroy.
    settings: Option<SourceSettings>,
    stream: Option<CaptureStream<VideoDevice<V>>>,
    /// Conversion target, swapped with the front buffer on publish.
    back: Vec<u8>,
    audio: Option<AudioCaptureSession<PcmDevice<A>>>,
}

impl<V: VideoBackend, A: AudioBackend> Default for Session<V, A> {
    fn default() -> Self {
        Self {
            settings: None,
            stream: None,
            back: Vec::new(),
            audio: None,
        }
    }
}

/// Raises the reconfiguring flag for its lifetime.
struct Fence<'a>(&'a AtomicBool);

impl<'a> Fence<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for Fence<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A live camera source: one device session, its frame exchange and its audio thread.
pub struct CaptureSource<V: VideoBackend, A: AudioBackend> {
    video: V,
    audio: A,
    sink: Arc<dyn AudioSink>,
    clock: Arc<dyn Clock>,
    locks: SessionLocks<Session<V, A>, RenderState, FrameExchange>,
    reconfiguring: AtomicBool,
    state: RwLock<SourceState>,
    event_tx: Option<Sender<SourceEvent>>,
    stats: CaptureStats,
}

impl<V: VideoBackend, A: AudioBackend> CaptureSource<V, A> {
    /// Creates a closed source. Nothing is opened until [`start`](Self::start).
    pub fn new(video: V, audio: A, renderer: Box<dyn Renderer>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            video,
            audio,
            sink,
            clock: Arc::new(MonotonicClock),
            locks: SessionLocks::new(
                Session::default(),
                RenderState::new(renderer),
                FrameExchange::new(),
            ),
            reconfiguring: AtomicBool::new(false),
            state: RwLock::new(SourceState::Closed),
            event_tx: None,
            stats: CaptureStats::new(),
        }
    }

    /// Reports state changes and failures on `event_tx`.
    pub fn with_events(mut self, event_tx: Sender<SourceEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Replaces the clock used to timestamp audio.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens the device, negotiates a format, maps and queues buffers, starts streaming and
    /// allocates the frame buffers and render target, then starts audio if configured.
    ///
    /// Any video failure unwinds everything acquired so far. Audio failure is reported but
    /// leaves video running.
    #[instrument(name = "source_start", skip(self, settings), fields(device = %settings.device_path))]
    pub fn start(&self, settings: &SourceSettings) -> EngineResult<FormatInfo> {
        let mut guard = self.locks.lock_session();
        if guard.settings.is_some() {
            debug!("Source already started");
            return Err(EngineError::AlreadyStarted);
        }

        info!(resolution = %settings.resolution, "Starting capture source");
        let result = {
            let (session, mut render, mut exchange) = guard.lock_all();
            self.open_session(session, &mut render, &mut exchange, settings)
        };

        match result {
            Ok(info) => {
                guard.settings = Some(settings.clone());
                self.start_audio(&mut guard, settings);
                Ok(info)
            }
            Err(e) => {
                error!(error = %e, "Capture source failed to start");
                self.transition_to(SourceState::Closed);
                self.send_event(SourceEvent::Stopped {
                    reason: StopReason::StartFailed {
                        message: e.to_string(),
                    },
                });
                Err(e)
            }
        }
    }

    /// Pulls at most one completed frame, converts it and publishes it for the render path.
    ///
    /// Never blocks: returns at once while a reconfiguration is in flight, when the session
    /// lock is busy, when there is no device, or when no frame is ready. A dequeued buffer is
    /// always handed back to the driver, whether or not its conversion succeeded.
    pub fn step(&self) {
        if self.reconfiguring.load(Ordering::SeqCst) {
            return;
        }
        let Some(mut guard) = self.locks.try_lock_session() else {
            trace!("Session busy, skipping step");
            return;
        };

        let (session, gate) = guard.split();
        let Session { stream, back, .. } = session;
        let Some(stream) = stream.as_mut() else {
            return;
        };

        let buffer = match stream.dequeue() {
            Ok(Some(buffer)) => buffer,
            Ok(None) => return,
            Err(e @ CaptureError::InvalidIndex { .. }) => {
                warn!(error = %e, "Driver returned an unknown buffer");
                self.stats.record_dropped();
                return;
            }
            Err(e) => {
                debug!(error = %e, "Dequeue failed");
                self.stats.record_dequeue_error();
                return;
            }
        };
        self.stats.record_dequeued();

        let converted = nv12_to_bgra(&buffer.frame(), back);
        match converted {
            Ok(()) => {
                gate.lock().publish(back);
                self.stats.record_converted();
            }
            Err(e) => {
                debug!(index = buffer.index(), error = %e, "Dropping frame");
                self.stats.record_dropped();
            }
        }

        let index = buffer.index();
        if let Err(e) = buffer.requeue() {
            error!(index, error = %e, "Failed to requeue buffer");
            self.stats.record_requeue_failure();
        }
    }

    /// Uploads the latest frame if a new one was published, then draws the target.
    ///
    /// Never takes the session lock. The exchange lock is held only to take the pending frame,
    /// so a slow upload does not stall [`step`](Self::step).
    pub fn render(&self) {
        let mut consumer = self.locks.lock_consumer();
        let (render, gate) = consumer.split();
        if render.present(&gate) {
            self.stats.record_presented();
        }
    }

    /// Switches device node and/or resolution on a live source.
    ///
    /// A no-op when both match the running session. Otherwise the current session is torn
    /// down completely and a new one brought up under the session lock; the periodic step is
    /// fenced off for the duration. On failure the source is left without a device until a
    /// later reconfiguration succeeds.
    #[instrument(name = "source_reconfigure", skip(self))]
    pub fn reconfigure(&self, device_path: &str, resolution: Resolution) -> EngineResult<()> {
        let _fence = Fence::raise(&self.reconfiguring);
        let mut guard = self.locks.lock_session();

        let Some(current) = guard.settings.clone() else {
            return Err(EngineError::NotStarted);
        };
        if guard.stream.is_some()
            && current.device_path == device_path
            && current.resolution == resolution
        {
            debug!("Device and resolution unchanged");
            return Ok(());
        }

        info!(from = %current.device_path, "Reconfiguring capture source");
        self.transition_to(SourceState::Reconfiguring);

        let next = SourceSettings {
            device_path: device_path.to_string(),
            resolution,
            ..current
        };

        let (session, mut render, mut exchange) = guard.lock_all();
        session.stream = None;
        session.back = Vec::new();
        render.release(&mut exchange);
        self.stats.stop();
        session.settings = Some(next.clone());

        match self.open_session(session, &mut render, &mut exchange, &next) {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "Reconfiguration failed, source has no device");
                let message = e.to_string();
                self.transition_to(SourceState::Closed);
                self.send_event(SourceEvent::ReconfigureFailed {
                    message: message.clone(),
                });
                self.send_event(SourceEvent::Stopped {
                    reason: StopReason::ReconfigureFailed { message },
                });
                Err(e)
            }
        }
    }

    /// Restarts audio capture on `device`. An empty name disables audio.
    #[instrument(name = "source_reconfigure_audio", skip(self))]
    pub fn reconfigure_audio(&self, device: &str) -> EngineResult<()> {
        let mut guard = self.locks.lock_session();
        let Some(mut settings) = guard.settings.clone() else {
            return Err(EngineError::NotStarted);
        };

        if let Some(mut audio) = guard.audio.take() {
            if let Err(e) = audio.stop() {
                warn!(error = %e, "Audio capture did not stop cleanly");
            }
        }

        settings.audio_device = device.to_string();
        self.start_audio(&mut guard, &settings);
        guard.settings = Some(settings);
        Ok(())
    }

    /// Stops streaming and audio and releases every resource. Safe to call repeatedly and
    /// after a failed start.
    #[instrument(name = "source_destroy", skip(self))]
    pub fn destroy(&self) {
        let _fence = Fence::raise(&self.reconfiguring);
        let mut guard = self.locks.lock_session();
        let was_started = guard.settings.take().is_some();

        if let Some(stream) = guard.stream.as_mut() {
            if let Err(e) = stream.stop() {
                warn!(error = %e, "Failed to stop streaming");
            }
        }
        if let Some(mut audio) = guard.audio.take() {
            if let Err(e) = audio.stop() {
                warn!(error = %e, "Audio capture did not stop cleanly");
            }
        }

        {
            let (session, mut render, mut exchange) = guard.lock_all();
            session.stream = None;
            session.back = Vec::new();
            render.release(&mut exchange);
        }
        drop(guard);

        self.stats.stop();
        if was_started {
            self.transition_to(SourceState::Closed);
            self.send_event(SourceEvent::Stopped {
                reason: StopReason::Destroyed,
            });
            info!("Capture source destroyed");
        }
    }

    /// Negotiated frame size, or `(0, 0)` without a live session.
    pub fn frame_size(&self) -> (u32, u32) {
        match &*self.state.read() {
            SourceState::Streaming { format } => (format.width, format.height),
            _ => (0, 0),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SourceState {
        self.state.read().clone()
    }

    /// Format of the live session.
    pub fn format(&self) -> Option<FormatInfo> {
        match &*self.state.read() {
            SourceState::Streaming { format } => Some(*format),
            _ => None,
        }
    }

    /// Whether the audio thread is running.
    pub fn has_audio(&self) -> bool {
        self.locks
            .lock_session()
            .audio
            .as_ref()
            .is_some_and(|audio| audio.is_active())
    }

    /// Current capture counters.
    pub fn metrics(&self) -> SourceMetrics {
        self.stats.snapshot()
    }

    /// Sends a metrics event and starts a new FPS window.
    pub fn emit_metrics(&self) {
        self.send_event(SourceEvent::Metrics(self.stats.snapshot()));
        self.stats.mark_reported();
    }

    /// The video backend this source opens devices through.
    pub fn video_backend(&self) -> &V {
        &self.video
    }

    fn open_session(
        &self,
        session: &mut Session<V, A>,
        render: &mut RenderState,
        exchange: &mut FrameExchange,
        settings: &SourceSettings,
    ) -> EngineResult<FormatInfo> {
        let (width, height) = settings.resolution.dimensions();

        self.enter_phase(StartupPhase::OpenDevice);
        let device = self
            .video
            .open(&settings.device_path)
            .map_err(|source| CaptureError::DeviceOpen {
                path: settings.device_path.clone(),
                source,
            })?;

        self.enter_phase(StartupPhase::StartStreaming);
        let stream = CaptureStream::start(device, width, height, settings.effective_buffer_count())?;

        self.enter_phase(StartupPhase::AllocateFrames);
        let format = *stream.format();
        render.allocate(exchange, format.width, format.height)?;
        session.back = vec![0; format.rgb_len()];

        let info = stream.info();
        session.stream = Some(stream);
        self.stats.start();

        info!(
            width = info.width,
            height = info.height,
            planes = info.plane_count,
            buffers = info.buffer_count,
            "Capture source streaming"
        );
        self.transition_to(SourceState::Streaming { format: info });
        self.send_event(SourceEvent::FormatNegotiated(info));
        Ok(info)
    }

    fn start_audio(&self, session: &mut Session<V, A>, settings: &SourceSettings) {
        if !settings.audio_enabled() {
            debug!("Audio disabled");
            return;
        }

        let config = AudioCaptureConfig::from(settings);
        match AudioCaptureSession::open(
            &self.audio,
            &config,
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
        ) {
            Ok(capture) => session.audio = Some(capture),
            Err(e) => {
                warn!(device = %config.device, error = %e, "Audio unavailable, continuing without it");
                self.send_event(SourceEvent::AudioUnavailable {
                    message: e.to_string(),
                });
            }
        }
    }

    /// Startup phases are reported on first start only; a reconfiguration stays in
    /// `Reconfiguring` until it completes.
    fn enter_phase(&self, phase: StartupPhase) {
        if self.reconfiguring.load(Ordering::SeqCst) {
            return;
        }
        debug!(phase = phase.name(), "Startup phase");
        self.transition_to(SourceState::Starting { phase });
    }

    fn transition_to(&self, new_state: SourceState) {
        let previous = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state.clone())
        };

        debug!(
            previous = %previous.name(),
            current = %new_state.name(),
            "State transition"
        );

        self.send_event(SourceEvent::StateChanged {
            previous: Box::new(previous),
            current: Box::new(new_state),
        });
    }

    fn send_event(&self, event: SourceEvent) {
        let Some(event_tx) = &self.event_tx else {
            return;
        };
        if let Err(e) = event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

impl<V: VideoBackend, A: AudioBackend> Drop for CaptureSource<V, A> {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::TextureHandle;
    use crossbeam_channel::Receiver;
    use mplanecam_audio::{ChannelSink, ToneBackend};
    use mplanecam_capture::{
        CaptureDevice, DeviceFormat, Dequeued, FormatRequest, PlaneLocation, VirtualBackend,
        VirtualDevice, VirtualOptions,
    };
    use parking_lot::Mutex;
    use std::io;
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Debug, Clone, PartialEq)]
    enum RenderCall {
        Create(u32, u32),
        Update(usize),
        Destroy,
        Draw(u32, u32),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<RenderCall>>>,
        last_upload: Arc<Mutex<Vec<u8>>>,
        last_initial: Arc<Mutex<Vec<u8>>>,
        fail_create: bool,
        upload_delay: Option<Duration>,
    }

    impl Recorder {
        fn take(&self) -> Vec<RenderCall> {
            std::mem::take(&mut *self.calls.lock())
        }
    }

    impl Renderer for Recorder {
        fn create_target(
            &mut self,
            width: u32,
            height: u32,
            initial: &[u8],
        ) -> EngineResult<TextureHandle> {
            if self.fail_create {
                return Err(EngineError::Render("no context".to_string()));
            }
            self.calls.lock().push(RenderCall::Create(width, height));
            *self.last_initial.lock() = initial.to_vec();
            Ok(TextureHandle(1))
        }

        fn update_target(&mut self, _: TextureHandle, data: &[u8], _: u32) {
            if let Some(delay) = self.upload_delay {
                thread::sleep(delay);
            }
            self.calls.lock().push(RenderCall::Update(data.len()));
            *self.last_upload.lock() = data.to_vec();
        }

        fn destroy_target(&mut self, _: TextureHandle) {
            self.calls.lock().push(RenderCall::Destroy);
        }

        fn draw(&mut self, _: TextureHandle, width: u32, height: u32) {
            self.calls.lock().push(RenderCall::Draw(width, height));
        }
    }

    type TestSource = CaptureSource<VirtualBackend, ToneBackend>;

    struct Harness {
        source: TestSource,
        renderer: Recorder,
        events: Receiver<SourceEvent>,
    }

    fn harness_with(renderer: Recorder, tone: ToneBackend) -> Harness {
        let (sink, _) = ChannelSink::channel();
        let (event_tx, events) = mplanecam_ipc::event_channel();
        let source = CaptureSource::new(
            VirtualBackend::new(VirtualOptions::default()),
            tone,
            Box::new(renderer.clone()),
            Arc::new(sink),
        )
        .with_events(event_tx);
        Harness {
            source,
            renderer,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(Recorder::default(), ToneBackend::default())
    }

    fn video_only(resolution: Resolution) -> SourceSettings {
        SourceSettings {
            device_path: "virtual0".to_string(),
            resolution,
            audio_device: String::new(),
            ..Default::default()
        }
    }

    fn drain(events: &Receiver<SourceEvent>) -> Vec<SourceEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_start_streams_and_reports_format() {
        let h = harness();
        let info = h.source.start(&video_only(Resolution::Vga)).unwrap();

        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.plane_count, 2);
        assert_eq!(info.buffer_count, 4);
        assert!(h.source.state().is_streaming());
        assert_eq!(h.source.frame_size(), (640, 480));
        assert_eq!(h.renderer.take(), vec![RenderCall::Create(640, 480)]);

        let events = drain(&h.events);
        assert!(events.contains(&SourceEvent::FormatNegotiated(info)));
        assert!(events.iter().any(|e| matches!(
            e,
            SourceEvent::StateChanged { current, .. }
                if **current == SourceState::Starting { phase: StartupPhase::OpenDevice }
        )));
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        assert!(matches!(
            h.source.start(&video_only(Resolution::Vga)),
            Err(EngineError::AlreadyStarted)
        ));
    }

    #[test]
    fn test_step_publishes_and_render_uploads_once() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        h.renderer.take();

        h.source.step();
        h.source.render();
        h.source.render();

        assert_eq!(
            h.renderer.take(),
            vec![
                RenderCall::Update(640 * 480 * 4),
                RenderCall::Draw(640, 480),
                RenderCall::Draw(640, 480),
            ]
        );
        // Left edge of the test pattern is black.
        assert_eq!(&h.renderer.last_upload.lock()[..4], &[0, 0, 0, 255]);

        let metrics = h.source.metrics();
        assert_eq!(metrics.frames_dequeued, 1);
        assert_eq!(metrics.frames_converted, 1);
        assert_eq!(metrics.frames_presented, 1);
    }

    #[test]
    fn test_step_keeps_buffers_circulating() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        for _ in 0..20 {
            h.source.step();
        }
        let metrics = h.source.metrics();
        assert_eq!(metrics.frames_converted, 20);
        assert_eq!(metrics.requeue_failures, 0);
        assert_eq!(metrics.dequeue_errors, 0);
    }

    #[test]
    fn test_step_skips_when_session_busy() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        let guard = h.source.locks.lock_session();
        h.source.step();
        drop(guard);
        assert_eq!(h.source.metrics().frames_dequeued, 0);
    }

    #[test]
    fn test_slow_upload_does_not_stall_step() {
        let renderer = Recorder {
            upload_delay: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        let h = harness_with(renderer, ToneBackend::default());
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        h.source.step();
        let source = &h.source;

        let took = thread::scope(|scope| {
            let uploading = scope.spawn(|| source.render());
            thread::sleep(Duration::from_millis(50));
            let started = Instant::now();
            source.step();
            let took = started.elapsed();
            uploading.join().unwrap();
            took
        });

        assert!(took < Duration::from_millis(100), "step took {took:?} during an upload");
        let metrics = h.source.metrics();
        assert_eq!(metrics.frames_converted, 2);
        assert_eq!(metrics.frames_presented, 1);
    }

    #[test]
    fn test_step_without_session_is_noop() {
        let h = harness();
        h.source.step();
        h.source.render();
        assert!(h.renderer.take().is_empty());
        assert_eq!(h.source.frame_size(), (0, 0));
    }

    #[derive(Clone, Default)]
    struct Faults {
        dequeue: Arc<AtomicBool>,
        queue: Arc<AtomicBool>,
    }

    /// Virtual devices whose DQBUF and QBUF can be made to fail on demand.
    #[derive(Default)]
    struct FlakyBackend {
        inner: VirtualBackend,
        faults: Faults,
    }

    struct FlakyDevice {
        inner: VirtualDevice,
        faults: Faults,
    }

    impl VideoBackend for FlakyBackend {
        type Device = FlakyDevice;

        fn open(&self, path: &str) -> io::Result<FlakyDevice> {
            Ok(FlakyDevice {
                inner: self.inner.open(path)?,
                faults: self.faults.clone(),
            })
        }
    }

    impl CaptureDevice for FlakyDevice {
        type Mapping = <VirtualDevice as CaptureDevice>::Mapping;

        fn set_format(&mut self, request: &FormatRequest) -> io::Result<DeviceFormat> {
            self.inner.set_format(request)
        }

        fn get_format(&mut self) -> io::Result<DeviceFormat> {
            self.inner.get_format()
        }

        fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
            self.inner.request_buffers(count)
        }

        fn query_buffer(&mut self, index: u32) -> io::Result<Vec<PlaneLocation>> {
            self.inner.query_buffer(index)
        }

        fn map(&mut self, plane: &PlaneLocation) -> io::Result<Self::Mapping> {
            self.inner.map(plane)
        }

        fn queue(&mut self, index: u32, planes: u32) -> io::Result<()> {
            if self.faults.queue.load(Ordering::SeqCst) {
                return Err(io::Error::other("QBUF failed"));
            }
            self.inner.queue(index, planes)
        }

        fn dequeue(&mut self) -> io::Result<Option<Dequeued>> {
            if self.faults.dequeue.load(Ordering::SeqCst) {
                return Err(io::Error::other("DQBUF failed"));
            }
            self.inner.dequeue()
        }

        fn stream_on(&mut self) -> io::Result<()> {
            self.inner.stream_on()
        }

        fn stream_off(&mut self) -> io::Result<()> {
            self.inner.stream_off()
        }
    }

    #[test]
    fn test_device_errors_are_counted_and_streaming_continues() {
        let backend = FlakyBackend::default();
        let faults = backend.faults.clone();
        let (sink, _) = ChannelSink::channel();
        let source = CaptureSource::new(
            backend,
            ToneBackend::default(),
            Box::new(Recorder::default()),
            Arc::new(sink),
        );
        source.start(&video_only(Resolution::Vga)).unwrap();

        faults.dequeue.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            source.step();
        }
        faults.dequeue.store(false, Ordering::SeqCst);
        let metrics = source.metrics();
        assert_eq!(metrics.dequeue_errors, 3);
        assert_eq!(metrics.frames_dequeued, 0);
        assert!(source.state().is_streaming());

        faults.queue.store(true, Ordering::SeqCst);
        source.step();
        faults.queue.store(false, Ordering::SeqCst);
        let metrics = source.metrics();
        assert_eq!(metrics.requeue_failures, 1);
        assert_eq!(metrics.frames_converted, 1);
        assert!(source.state().is_streaming());

        // The three buffers still circulating keep frames coming.
        for _ in 0..6 {
            source.step();
        }
        let metrics = source.metrics();
        assert_eq!(metrics.frames_converted, 7);
        assert_eq!(metrics.requeue_failures, 1);
    }

    #[test]
    fn test_unchanged_reconfigure_touches_nothing() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        h.renderer.take();
        drain(&h.events);

        h.source.reconfigure("virtual0", Resolution::Vga).unwrap();

        assert_eq!(h.source.video_backend().opened(), 1);
        assert!(h.renderer.take().is_empty());
        assert!(drain(&h.events).is_empty());
        assert!(h.source.state().is_streaming());
    }

    #[test]
    fn test_reconfigure_switches_resolution_and_clears_front() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        h.source.step();
        h.renderer.take();

        h.source.reconfigure("virtual0", Resolution::Hd720).unwrap();
        assert_eq!(h.source.frame_size(), (1280, 720));
        assert_eq!(h.source.video_backend().opened(), 2);

        let initial = h.renderer.last_initial.lock().clone();
        assert_eq!(initial.len(), 1280 * 720 * 4);
        assert!(initial.iter().all(|&b| b == 0));

        // The frame published before the switch is gone.
        h.source.render();
        assert_eq!(
            h.renderer.take(),
            vec![
                RenderCall::Destroy,
                RenderCall::Create(1280, 720),
                RenderCall::Draw(1280, 720),
            ]
        );

        h.source.step();
        h.source.render();
        assert_eq!(
            h.renderer.take(),
            vec![RenderCall::Update(1280 * 720 * 4), RenderCall::Draw(1280, 720)]
        );

        let states: Vec<_> = drain(&h.events)
            .into_iter()
            .filter_map(|e| match e {
                SourceEvent::StateChanged { current, .. } => Some(current.name()),
                _ => None,
            })
            .collect();
        assert_eq!(states.last(), Some(&"Streaming"));
        assert!(states.contains(&"Reconfiguring"));
        assert!(!states.iter().skip_while(|s| **s != "Reconfiguring").any(|s| *s == "Starting"));
    }

    #[test]
    fn test_failed_reconfigure_leaves_no_device_until_retry() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        drain(&h.events);

        assert!(h.source.reconfigure("/dev/missing", Resolution::Vga).is_err());
        assert!(h.source.state().is_closed());
        assert_eq!(h.source.frame_size(), (0, 0));
        h.source.step();
        assert!(drain(&h.events)
            .iter()
            .any(|e| matches!(e, SourceEvent::ReconfigureFailed { .. })));

        // Same parameters retry because no device is live.
        assert!(h.source.reconfigure("/dev/missing", Resolution::Vga).is_err());
        h.source.reconfigure("virtual0", Resolution::Vga).unwrap();
        assert!(h.source.state().is_streaming());
    }

    #[test]
    fn test_reconfigure_before_start_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.source.reconfigure("virtual0", Resolution::Vga),
            Err(EngineError::NotStarted)
        ));
        assert!(!h.source.reconfiguring.load(Ordering::SeqCst));
    }

    #[test]
    fn test_start_failure_unwinds_and_allows_retry() {
        let h = harness_with(
            Recorder {
                fail_create: true,
                ..Default::default()
            },
            ToneBackend::default(),
        );
        assert!(matches!(
            h.source.start(&video_only(Resolution::Vga)),
            Err(EngineError::Render(_))
        ));
        assert!(h.source.state().is_closed());
        assert!(drain(&h.events).iter().any(|e| matches!(
            e,
            SourceEvent::Stopped {
                reason: StopReason::StartFailed { .. }
            }
        )));

        let missing = SourceSettings {
            device_path: "/dev/video99".to_string(),
            ..video_only(Resolution::Vga)
        };
        assert!(matches!(
            h.source.start(&missing),
            Err(EngineError::Capture(CaptureError::DeviceOpen { .. }))
        ));
    }

    #[test]
    fn test_audio_failure_keeps_video() {
        let h = harness();
        let settings = SourceSettings {
            audio_device: "hw:9,9".to_string(),
            ..video_only(Resolution::Vga)
        };
        h.source.start(&settings).unwrap();

        assert!(h.source.state().is_streaming());
        assert!(!h.source.has_audio());
        let unavailable = drain(&h.events)
            .into_iter()
            .filter(|e| matches!(e, SourceEvent::AudioUnavailable { .. }))
            .count();
        assert_eq!(unavailable, 1);
    }

    #[test]
    fn test_audio_blocks_reach_sink_until_destroy() {
        let (sink, blocks) = ChannelSink::channel();
        let source: TestSource = CaptureSource::new(
            VirtualBackend::default(),
            ToneBackend::default(),
            Box::new(Recorder::default()),
            Arc::new(sink),
        );
        let settings = SourceSettings {
            audio_device: "virtual".to_string(),
            period_frames: 480,
            ..video_only(Resolution::Vga)
        };
        source.start(&settings).unwrap();
        assert!(source.has_audio());

        let block = blocks.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(block.frames, 480);

        source.destroy();
        assert!(!source.has_audio());
        while blocks.try_recv().is_ok() {}
        thread::sleep(Duration::from_millis(50));
        assert!(blocks.try_recv().is_err());
    }

    #[test]
    fn test_reconfigure_audio_switches_endpoint() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        assert!(!h.source.has_audio());

        h.source.reconfigure_audio("virtual").unwrap();
        assert!(h.source.has_audio());

        h.source.reconfigure_audio("").unwrap();
        assert!(!h.source.has_audio());
        assert!(h.source.state().is_streaming());
    }

    #[test]
    fn test_destroy_is_idempotent_and_allows_restart() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        h.renderer.take();
        drain(&h.events);

        h.source.destroy();
        h.source.destroy();

        assert!(h.source.state().is_closed());
        assert_eq!(h.renderer.take(), vec![RenderCall::Destroy]);
        let stopped = drain(&h.events)
            .into_iter()
            .filter(|e| matches!(e, SourceEvent::Stopped { reason: StopReason::Destroyed }))
            .count();
        assert_eq!(stopped, 1);

        h.source.start(&video_only(Resolution::Hd720)).unwrap();
        assert_eq!(h.source.frame_size(), (1280, 720));
    }

    #[test]
    fn test_concurrent_tick_render_and_reconfigure() {
        let h = harness();
        h.source.start(&video_only(Resolution::Vga)).unwrap();
        let source = &h.source;
        let running = AtomicBool::new(true);

        thread::scope(|scope| {
            scope.spawn(|| {
                while running.load(Ordering::SeqCst) {
                    source.step();
                }
            });
            scope.spawn(|| {
                while running.load(Ordering::SeqCst) {
                    source.render();
                }
            });
            for resolution in [Resolution::Hd720, Resolution::Vga, Resolution::Hd1080] {
                source.reconfigure("virtual0", resolution).unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            running.store(false, Ordering::SeqCst);
        });

        assert_eq!(h.source.frame_size(), (1920, 1080));
        assert_eq!(h.source.metrics().requeue_failures, 0);
    }
}
