//! Helpers for tests of the engine and of code built on it.

use alloc::{format, string::String, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use pmm::PAGE_SIZE;
use spin::mutex::SpinMutex;

use crate::{
    Clock,
    log::{self, LogLevel, LogSink},
};

/// A clock whose thread runtime advances by a fixed step on every read.
#[derive(Debug)]
pub struct ManualClock {
    ticks_per_second: u64,
    runtime_nanos: AtomicU64,
    step_nanos: u64,
}

impl ManualClock {
    #[must_use]
    pub const fn new(ticks_per_second: u64) -> Self {
        Self {
            ticks_per_second,
            runtime_nanos: AtomicU64::new(0),
            step_nanos: 1_000,
        }
    }
}

impl Clock for ManualClock {
    fn ticks_per_second(&self) -> u64 {
        self.ticks_per_second
    }

    fn thread_runtime(&self) -> Duration {
        let prev = self.runtime_nanos.fetch_add(self.step_nanos, Ordering::Relaxed);
        Duration::from_nanos(prev + self.step_nanos)
    }
}

#[must_use]
pub fn fill_page(byte: u8) -> [u8; PAGE_SIZE] {
    [byte; PAGE_SIZE]
}

/// Returns a page of pseudo-random bytes that does not compress.
#[must_use]
pub fn noise_page(seed: u64) -> [u8; PAGE_SIZE] {
    let mut state = seed | 1;
    let mut page = [0; PAGE_SIZE];
    for chunk in page.chunks_exact_mut(size_of::<u64>()) {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        chunk.copy_from_slice(&state.to_le_bytes());
    }
    page
}

/// A log sink that keeps every line it receives.
#[derive(Debug)]
pub struct CaptureSink {
    lines: SpinMutex<Vec<String>>,
}

impl LogSink for CaptureSink {
    fn write_line(&self, line: fmt::Arguments<'_>) {
        self.lines.lock().push(format!("{line}"));
    }
}

impl CaptureSink {
    /// Returns whether any captured line contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().iter().any(|line| line.contains(needle))
    }
}

static CAPTURE: CaptureSink = CaptureSink {
    lines: SpinMutex::new(Vec::new()),
};

/// Routes all log output at every level into a shared [`CaptureSink`].
pub fn capture_log() -> &'static CaptureSink {
    log::init(&CAPTURE);
    log::set_max_level(LogLevel::Trace);
    &CAPTURE
}
