#![cfg(test)]

use std::{sync::Arc, thread};

use pmm::{PAGE_SIZE, PagePool};
use vm_compression::{
    CompressOutcome, CompressedRef, CompressedStorage, RealRef, Ticks, VmCompression,
    storage::SlotStorage,
    strategy::Lz4Compressor,
    testing::{ManualClock, capture_log, fill_page, noise_page},
};

const TPS: u64 = 1_000_000;
const THRESHOLD: usize = PAGE_SIZE * 70 / 100;

struct Fixture {
    pool: Arc<PagePool>,
    storage: Arc<SlotStorage>,
    compression: VmCompression,
}

fn fixture(page_count: usize) -> Fixture {
    let pool = Arc::new(PagePool::new(page_count));
    let storage = Arc::new(SlotStorage::new(Arc::clone(&pool)));
    let shared: Arc<dyn CompressedStorage> = Arc::<SlotStorage>::clone(&storage);
    let compression = VmCompression::new(
        Arc::clone(&pool),
        Arc::new(ManualClock::new(TPS)),
        shared,
        Arc::new(Lz4Compressor::new()),
        THRESHOLD,
    );
    Fixture {
        pool,
        storage,
        compression,
    }
}

fn text_page() -> [u8; PAGE_SIZE] {
    let text = b"the quick brown fox jumps over the lazy dog; ";
    let mut page = [0; PAGE_SIZE];
    for (i, byte) in page.iter_mut().enumerate() {
        *byte = text[i % text.len()];
    }
    page
}

/// Noise up front and zeros behind, compressing to a bit over half a page.
fn half_noise_page() -> [u8; PAGE_SIZE] {
    let mut page = [0; PAGE_SIZE];
    page[..2200].copy_from_slice(&noise_page(11)[..2200]);
    page
}

fn store(compression: &VmCompression, page: &[u8; PAGE_SIZE], now: Ticks) -> RealRef {
    match compression.compress(page, now) {
        CompressOutcome::Stored(reference) => reference,
        outcome => panic!("expected a stored page, got {outcome:?}"),
    }
}

#[test]
fn round_trip() {
    let Fixture {
        storage,
        compression,
        ..
    } = fixture(16);

    let mut sparse = [0; PAGE_SIZE];
    sparse[100] = 1;
    sparse[4000] = 0xFF;
    let pages = [fill_page(0xAA), text_page(), sparse, half_noise_page()];

    let refs = pages
        .iter()
        .map(|page| store(&compression, page, Ticks::ZERO))
        .collect::<Vec<_>>();
    assert_eq!(storage.live_count(), pages.len());

    for (page, reference) in pages.iter().zip(refs) {
        let mut restored = fill_page(0x55);
        let metadata =
            compression.decompress(CompressedRef::Real(reference), &mut restored, Ticks::ZERO);
        assert_eq!(metadata, 0);
        assert_eq!(&restored, page);
    }
    assert_eq!(storage.live_count(), 0);
    assert_eq!(compression.stats().memory_usage, 0);
}

#[test]
fn zero_page_is_not_stored() {
    let Fixture { compression, .. } = fixture(4);

    let outcome = compression.compress(&fill_page(0), Ticks::ZERO);
    assert_eq!(outcome, CompressOutcome::ZeroPage);

    let stats = compression.stats();
    assert_eq!(stats.total_attempts, 1);
    assert_eq!(stats.zero_page_attempts, 1);
    assert_eq!(stats.memory_usage, 0);
}

#[test]
fn incompressible_page_fails() {
    let Fixture {
        pool, compression, ..
    } = fixture(4);

    for seed in 1..=3 {
        let outcome = compression.compress(&noise_page(seed), Ticks::ZERO);
        assert_eq!(outcome, CompressOutcome::Fail);
    }
    // The scratch page is kept for the next attempt.
    assert_eq!(pool.free_count(), 3);

    let stats = compression.stats();
    assert_eq!(stats.total_attempts, 3);
    assert_eq!(stats.failed_attempts, 3);
    assert_eq!(stats.successful_attempts, 0);
}

#[test]
fn storage_failure_counts_as_failed_attempt() {
    // The only page becomes the scratch page, leaving none for slot storage.
    let Fixture { compression, .. } = fixture(1);

    let outcome = compression.compress(&fill_page(0xAA), Ticks::ZERO);
    assert_eq!(outcome, CompressOutcome::Fail);
    let stats = compression.stats();
    assert_eq!(stats.total_attempts, 1);
    assert_eq!(stats.failed_attempts, 1);
}

#[test]
fn missing_scratch_page_is_not_an_attempt() {
    let Fixture { compression, .. } = fixture(0);

    let outcome = compression.compress(&fill_page(0xAA), Ticks::ZERO);
    assert_eq!(outcome, CompressOutcome::Fail);
    assert_eq!(compression.stats().total_attempts, 0);
}

#[test]
fn large_blob_takes_scratch_page() {
    let Fixture {
        pool,
        storage,
        compression,
    } = fixture(4);

    let page = half_noise_page();
    let reference = store(&compression, &page, Ticks::ZERO);
    assert_eq!(storage.page_count(), 1);
    assert_eq!(pool.free_count(), 3);

    // A new scratch page is allocated for the next attempt.
    let small = store(&compression, &fill_page(1), Ticks::ZERO);
    assert_eq!(pool.free_count(), 1);

    let mut restored = [0; PAGE_SIZE];
    compression.decompress(CompressedRef::Real(reference), &mut restored, Ticks::ZERO);
    assert_eq!(restored, page);
    compression.free(CompressedRef::Real(small));
    assert_eq!(pool.free_count(), 3);
}

#[test]
fn decompress_records_residency() {
    let log = capture_log();
    let Fixture {
        storage,
        compression,
        ..
    } = fixture(8);

    let page = fill_page(0xAA);
    let compressed_at = Ticks::from_raw(1000);
    let reference = store(&compression, &page, compressed_at);

    let mut restored = [0; PAGE_SIZE];
    let now = compressed_at.saturating_add(5 * TPS);
    compression.decompress(CompressedRef::Real(reference), &mut restored, now);
    assert_eq!(restored, page);

    let stats = compression.stats();
    assert_eq!(stats.total_decompressions, 1);
    assert_eq!(stats.pages_decompressed_within_log_seconds, [0, 0, 1, 0, 0, 0, 0, 0]);
    assert_eq!(stats.compressed_page_evictions, 0);
    assert!(stats.decompression_time > std::time::Duration::ZERO);
    assert_eq!(storage.live_count(), 0);
    assert!(log.contains("after 5s"));
}

#[test]
fn decompressed_reference_is_released() {
    let Fixture {
        storage,
        compression,
        ..
    } = fixture(8);

    let reference = store(&compression, &fill_page(0xAA), Ticks::from_raw(1000));
    assert_eq!(storage.live_count(), 1);
    let mut restored = [0; PAGE_SIZE];
    compression.decompress(CompressedRef::Real(reference), &mut restored, Ticks::from_raw(1000));

    assert_eq!(storage.live_count(), 0);
    assert_eq!(compression.stats().memory_usage, 0);
}

#[test]
fn free_counts_eviction() {
    let Fixture {
        storage,
        compression,
        ..
    } = fixture(8);

    let reference = store(&compression, &text_page(), Ticks::ZERO);
    let before = compression.stats();
    compression.free(CompressedRef::Real(reference));

    let after = compression.stats();
    assert_eq!(after.compressed_page_evictions, before.compressed_page_evictions + 1);
    assert_eq!(after.total_decompressions, before.total_decompressions);
    assert_eq!(storage.live_count(), 0);
}

#[test]
fn metadata_follows_reference() {
    let Fixture { compression, .. } = fixture(8);

    let reference = CompressedRef::Real(store(&compression, &text_page(), Ticks::ZERO));
    assert_eq!(compression.metadata(&reference), 0);
    compression.set_metadata(&reference, 0x1234);
    assert_eq!(compression.metadata(&reference), 0x1234);

    let mut restored = [0; PAGE_SIZE];
    assert_eq!(compression.decompress(reference, &mut restored, Ticks::ZERO), 0x1234);
}

#[test]
fn threshold_leaves_room_for_timestamp() {
    let pool = Arc::new(PagePool::new(4));
    for requested in [0, 1, THRESHOLD, PAGE_SIZE - 8, PAGE_SIZE, PAGE_SIZE * 2] {
        let compression = VmCompression::new(
            Arc::clone(&pool),
            Arc::new(ManualClock::new(TPS)),
            Arc::new(SlotStorage::new(Arc::clone(&pool))),
            Arc::new(Lz4Compressor::new()),
            requested,
        );
        let threshold = compression.compression_threshold();
        assert!(threshold + vm_compression::TIMESTAMP_SIZE <= PAGE_SIZE);
        assert_eq!(threshold, requested.min(PAGE_SIZE - 8));
    }
}

#[test]
#[should_panic(expected = "clock reports zero ticks per second")]
fn zero_tick_rate_is_rejected() {
    let pool = Arc::new(PagePool::new(4));
    let _ = VmCompression::new(
        Arc::clone(&pool),
        Arc::new(ManualClock::new(0)),
        Arc::new(SlotStorage::new(Arc::clone(&pool))),
        Arc::new(Lz4Compressor::new()),
        THRESHOLD,
    );
}

#[test]
fn full_page_threshold_stores_nearly_incompressible_page() {
    let pool = Arc::new(PagePool::new(4));
    let compression = VmCompression::new(
        Arc::clone(&pool),
        Arc::new(ManualClock::new(TPS)),
        Arc::new(SlotStorage::new(Arc::clone(&pool))),
        Arc::new(Lz4Compressor::new()),
        PAGE_SIZE,
    );

    let mut page = noise_page(5);
    page[3500..].fill(0);
    let reference = store(&compression, &page, Ticks::ZERO);
    let mut restored = [0; PAGE_SIZE];
    compression.decompress(CompressedRef::Real(reference), &mut restored, Ticks::ZERO);
    assert_eq!(restored, page);
}

#[test]
fn attempts_are_conserved() {
    let Fixture { compression, .. } = fixture(64);

    let mut refs = Vec::new();
    for i in 0..60_u8 {
        let page = match i % 3 {
            0 => fill_page(0),
            1 => noise_page(u64::from(i)),
            _ => fill_page(i),
        };
        if let CompressOutcome::Stored(reference) = compression.compress(&page, Ticks::ZERO) {
            refs.push(reference);
        }
        let stats = compression.stats();
        assert_eq!(
            stats.total_attempts,
            stats.successful_attempts + stats.failed_attempts + stats.zero_page_attempts
        );
    }

    let stats = compression.stats();
    assert_eq!(stats.total_attempts, 60);
    assert_eq!(stats.zero_page_attempts, 20);
    assert_eq!(stats.failed_attempts, 20);
    assert_eq!(stats.successful_attempts, 20);
    assert_eq!(refs.len(), 20);
    for reference in refs {
        compression.free(CompressedRef::Real(reference));
    }
}

#[test]
fn concurrent_round_trips() {
    let Fixture {
        pool,
        storage,
        compression,
    } = fixture(64);

    thread::scope(|s| {
        for t in 0..4_u8 {
            let compression = &compression;
            s.spawn(move || {
                for i in 0..50_u8 {
                    let mut page = fill_page(t + 1);
                    page[usize::from(i) * 8] = i;
                    let reference = store(compression, &page, Ticks::from_raw(u64::from(i)));
                    let mut restored = [0; PAGE_SIZE];
                    compression.decompress(
                        CompressedRef::Real(reference),
                        &mut restored,
                        Ticks::from_raw(u64::from(i)),
                    );
                    assert_eq!(restored, page);
                }
            });
        }
    });

    let stats = compression.stats();
    assert_eq!(stats.successful_attempts, 200);
    assert_eq!(stats.total_decompressions, 200);
    assert_eq!(stats.pages_decompressed_within_log_seconds[0], 200);
    assert_eq!(storage.live_count(), 0);
    // Only the scratch page is still allocated.
    assert_eq!(pool.free_count(), 63);
}

#[test]
fn dump_reports_engine_and_collaborators() {
    let Fixture { compression, .. } = fixture(8);
    let reference = store(&compression, &text_page(), Ticks::ZERO);
    let _ = compression.compress(&fill_page(0), Ticks::ZERO);

    let mut out = String::new();
    compression.dump(&mut out).unwrap();
    assert!(
        out.contains("[zram]: Compression attempts: 2 success: 1 zero page: 1 failed: 0"),
        "{out}"
    );
    assert!(
        out.contains("[zram]: Total decompressions: 0 skipped: 0 within log seconds counts: 0, 0"),
        "{out}"
    );
    assert!(out.contains("[zram]: lz4 compressed: 1 zero: 1"), "{out}");
    assert!(out.contains("[zram]: slot storage pages: 1 blobs: 1"), "{out}");

    compression.free(CompressedRef::Real(reference));
}

#[test]
fn drop_returns_pages() {
    let Fixture {
        pool,
        storage,
        compression,
    } = fixture(8);
    let reference = store(&compression, &text_page(), Ticks::ZERO);
    compression.free(CompressedRef::Real(reference));
    let mut guard = compression.acquire_compressor();
    guard.arm().unwrap();
    drop(guard);
    assert_eq!(pool.free_count(), 6);

    drop(compression);
    drop(storage);
    assert_eq!(pool.free_count(), 8);
}
