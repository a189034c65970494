//! Capture counters and periodic reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;

use mplanecam_ipc::SourceMetrics;

/// Collects per-session capture counters.
pub struct CaptureStats {
    start_time: RwLock<Option<Instant>>,
    frames_dequeued: AtomicU64,
    frames_converted: AtomicU64,
    frames_presented: AtomicU64,
    frames_dropped: AtomicU64,
    dequeue_errors: AtomicU64,
    requeue_failures: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_converted: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Self {
        Self {
            start_time: RwLock::new(None),
            frames_dequeued: AtomicU64::new(0),
            frames_converted: AtomicU64::new(0),
            frames_presented: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            dequeue_errors: AtomicU64::new(0),
            requeue_failures: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            last_converted: AtomicU64::new(0),
        }
    }

    /// Marks the start of a streaming session and zeroes the counters.
    pub fn start(&self) {
        for counter in [
            &self.frames_dequeued,
            &self.frames_converted,
            &self.frames_presented,
            &self.frames_dropped,
            &self.dequeue_errors,
            &self.requeue_failures,
            &self.last_converted,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        let now = Instant::now();
        *self.start_time.write() = Some(now);
        *self.last_report_time.write() = now;
    }

    /// Marks the end of the session. Counters keep their values.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    pub fn record_dequeued(&self) {
        self.frames_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_converted(&self) {
        self.frames_converted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dequeue_error(&self) {
        self.dequeue_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue_failure(&self) {
        self.requeue_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> SourceMetrics {
        let now = Instant::now();

        let elapsed = now.duration_since(*self.last_report_time.read());
        let converted = self.frames_converted.load(Ordering::Relaxed);
        let last = self.last_converted.load(Ordering::Relaxed);
        let fps = if elapsed.as_secs_f32() > 0.0 {
            converted.saturating_sub(last) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        let uptime_seconds = self
            .start_time
            .read()
            .map(|s| now.duration_since(s).as_secs())
            .unwrap_or(0);

        SourceMetrics {
            fps,
            frames_dequeued: self.frames_dequeued.load(Ordering::Relaxed),
            frames_converted: converted,
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            dequeue_errors: self.dequeue_errors.load(Ordering::Relaxed),
            requeue_failures: self.requeue_failures.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }

    /// Update last report time for FPS calculation.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        self.last_converted.store(
            self.frames_converted.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }
}

impl Default for CaptureStats {
    fn default() -> Self {
        Self::new()
    }
}
