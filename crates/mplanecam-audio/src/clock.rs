//! Monotonic time and timestamp pacing for captured audio.

/// Nanosecond time source.
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds. Must never go backwards.
    fn now_ns(&self) -> u64;
}

/// `CLOCK_MONOTONIC`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

#[cfg(unix)]
impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        // SAFETY: `timespec` is plain integers, so all-zero is a valid value.
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // SAFETY: `ts` is a live, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        // Only EINVAL (unknown clock) and EFAULT (bad pointer) are possible, and neither
        // applies to CLOCK_MONOTONIC with a stack timespec.
        debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

/// Hosts without `clock_gettime` build the hardware-free backends; time is measured from the
/// first reading.
#[cfg(not(unix))]
impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        use std::sync::OnceLock;
        use std::time::Instant;

        static BASE: OnceLock<Instant> = OnceLock::new();
        BASE.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Derives block timestamps from a start time and the number of frames emitted so far.
///
/// The start time is taken from the clock on the first call, so it marks the first
/// successful read rather than thread start. Timestamps advance by exactly the duration of
/// the audio emitted and never drift with scheduling jitter.
#[derive(Debug, Clone)]
pub struct TimestampPacer {
    sample_rate: u32,
    start_ns: Option<u64>,
    frames_emitted: u64,
}

impl TimestampPacer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            start_ns: None,
            frames_emitted: 0,
        }
    }

    /// Timestamp for a block of `frames` frames, then advances past it.
    pub fn stamp(&mut self, clock: &dyn Clock, frames: usize) -> u64 {
        let start = *self.start_ns.get_or_insert_with(|| clock.now_ns());
        let offset = if self.sample_rate == 0 {
            0
        } else {
            (u128::from(self.frames_emitted) * 1_000_000_000 / u128::from(self.sample_rate)) as u64
        };
        self.frames_emitted += frames as u64;
        start + offset
    }

    /// Frames emitted since the first block.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Start time, once the first block has been stamped.
    pub fn start_ns(&self) -> Option<u64> {
        self.start_ns
    }
}
