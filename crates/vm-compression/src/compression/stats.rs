use core::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use crate::time::Ticks;

/// Number of residency histogram buckets.
///
/// Bucket `n` counts pages that stayed compressed for `[2^n, 2^(n+1))`
/// seconds, except that bucket 0 also takes everything below one second and
/// the last bucket takes everything above.
pub const NUM_LOG_BUCKETS: usize = 8;

/// Snapshot of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub memory_usage: usize,
    pub compression_time: Duration,
    pub decompression_time: Duration,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub zero_page_attempts: u64,
    pub failed_attempts: u64,
    pub total_decompressions: u64,
    pub compressed_page_evictions: u64,
    pub pages_decompressed_within_log_seconds: [u64; NUM_LOG_BUCKETS],
}

const fn log2_floor(value: u64) -> u32 {
    if value == 0 { 0 } else { value.ilog2() }
}

/// Returns the residency bucket for a page compressed at `start` and
/// decompressed at `end`.
#[must_use]
pub fn bucket_for_ticks(start: Ticks, end: Ticks, ticks_per_second: u64) -> usize {
    let secs = end.whole_secs_since(start, ticks_per_second);
    usize::min(log2_floor(secs) as usize, NUM_LOG_BUCKETS - 1)
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    compression_nanos: AtomicU64,
    decompression_nanos: AtomicU64,
    total_attempts: AtomicU64,
    successful_attempts: AtomicU64,
    zero_page_attempts: AtomicU64,
    failed_attempts: AtomicU64,
    total_decompressions: AtomicU64,
    compressed_page_evictions: AtomicU64,
    decompressed_within_log_seconds: [AtomicU64; NUM_LOG_BUCKETS],
}

fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

fn nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl Counters {
    pub(super) fn attempt(&self) {
        add(&self.total_attempts, 1);
    }

    pub(super) fn success(&self) {
        add(&self.successful_attempts, 1);
    }

    pub(super) fn zero_page(&self) {
        add(&self.zero_page_attempts, 1);
    }

    pub(super) fn failure(&self) {
        add(&self.failed_attempts, 1);
    }

    pub(super) fn eviction(&self) {
        add(&self.compressed_page_evictions, 1);
    }

    pub(super) fn decompression(&self, bucket: usize) {
        add(&self.total_decompressions, 1);
        add(&self.decompressed_within_log_seconds[bucket], 1);
    }

    pub(super) fn compression_time(&self, elapsed: Duration) {
        add(&self.compression_nanos, nanos(elapsed));
    }

    pub(super) fn decompression_time(&self, elapsed: Duration) {
        add(&self.decompression_nanos, nanos(elapsed));
    }

    pub(super) fn snapshot(&self, memory_usage: usize) -> Stats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Stats {
            memory_usage,
            compression_time: Duration::from_nanos(load(&self.compression_nanos)),
            decompression_time: Duration::from_nanos(load(&self.decompression_nanos)),
            total_attempts: load(&self.total_attempts),
            successful_attempts: load(&self.successful_attempts),
            zero_page_attempts: load(&self.zero_page_attempts),
            failed_attempts: load(&self.failed_attempts),
            total_decompressions: load(&self.total_decompressions),
            compressed_page_evictions: load(&self.compressed_page_evictions),
            pages_decompressed_within_log_seconds: self
                .decompressed_within_log_seconds
                .each_ref()
                .map(load),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TPS: u64 = 1_000_000;

    fn bucket_after_secs(secs: u64) -> usize {
        let start = Ticks::from_raw(1000);
        bucket_for_ticks(start, start.saturating_add(secs * TPS), TPS)
    }

    #[test]
    fn test_bucket_for_ticks() {
        assert_eq!(bucket_after_secs(0), 0);
        assert_eq!(bucket_after_secs(1), 0);
        assert_eq!(bucket_after_secs(2), 1);
        assert_eq!(bucket_after_secs(3), 1);
        assert_eq!(bucket_after_secs(5), 2);
        assert_eq!(bucket_after_secs(7), 2);
        assert_eq!(bucket_after_secs(64), 6);
        assert_eq!(bucket_after_secs(130), 7);
        assert_eq!(bucket_after_secs(u64::MAX / TPS - 1), 7);
    }

    #[test]
    fn test_sub_second_residency() {
        let start = Ticks::from_raw(0);
        assert_eq!(bucket_for_ticks(start, start.saturating_add(TPS - 1), TPS), 0);
        // A clock that went backwards counts as no residency.
        assert_eq!(bucket_for_ticks(start.saturating_add(TPS * 10), start, TPS), 0);
    }

    #[test]
    fn test_snapshot() {
        let counters = Counters::default();
        counters.attempt();
        counters.success();
        counters.attempt();
        counters.zero_page();
        counters.decompression(2);
        counters.compression_time(Duration::from_micros(3));
        counters.compression_time(Duration::from_micros(4));

        let stats = counters.snapshot(8192);
        assert_eq!(stats.memory_usage, 8192);
        assert_eq!(stats.total_attempts, 2);
        assert_eq!(stats.successful_attempts, 1);
        assert_eq!(stats.zero_page_attempts, 1);
        assert_eq!(stats.total_decompressions, 1);
        assert_eq!(stats.pages_decompressed_within_log_seconds, [0, 0, 1, 0, 0, 0, 0, 0]);
        assert_eq!(stats.compression_time, Duration::from_micros(7));
    }
}
