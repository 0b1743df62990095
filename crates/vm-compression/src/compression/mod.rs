//! The page compression engine.
//!
//! [`VmCompression`] turns pages into compressed blobs held by a
//! [`CompressedStorage`] and back. Callers get a [`CompressedRef`] for every
//! stored page and are expected to keep it in the page list slot of the
//! evicted page, under the lock of the object that owns the page.
//!
//! Two locks are used, always taken in this order:
//!
//! * `instance_lock` is held by a [`CompressorGuard`] for its whole lifetime,
//!   so at most one page is in flight between the page list and the storage.
//! * `compression_lock` is held for one [`VmCompression::compress`] call and
//!   protects the scratch page the codec writes into. [`CompressorGuard::compress`]
//!   takes it while the guard holds `instance_lock`.
//!
//! The instance state behind both is a leaf lock and never held across
//! either of them.
//!
//! Neither lock is taken on the decompression path; the storage and the codec
//! are safe for concurrent use on their own.

use alloc::sync::Arc;
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use dataview::DataView;
use pmm::{PAGE_SIZE, Page, PagePool};
use spin::mutex::SpinMutex;

pub use self::{
    instance::{CompressorGuard, PageAndMetadata},
    stats::{NUM_LOG_BUCKETS, Stats, bucket_for_ticks},
};
use self::{instance::InstanceState, stats::Counters};
use crate::{
    BootOptions, Clock, CompressedRef, CompressionStorageStrategyKind, CompressionStrategyKind,
    RealRef, Ticks,
    storage::{CompressedData, CompressedStorage, SlotStorage, StoreResult},
    strategy::{CompressResult, CompressionStrategy, Lz4Compressor},
};

mod instance;
mod stats;

/// Width of the timestamp stored after the compressed bytes of every blob.
pub const TIMESTAMP_SIZE: usize = size_of::<u64>();

/// Result of [`VmCompression::compress`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub enum CompressOutcome {
    /// The page could not be compressed or stored. It should stay resident.
    Fail,
    /// The page is all zeros. Nothing was stored.
    ZeroPage,
    /// The page was stored under this reference.
    Stored(RealRef),
}

/// Source of the ids that tie temporary references to their engine.
static NEXT_ENGINE_ID: AtomicUsize = AtomicUsize::new(0);

/// Page compression engine.
///
/// There is one engine per system, built at boot by
/// [`VmCompression::create_default`] and shared by reference.
pub struct VmCompression {
    id: usize,
    pool: Arc<PagePool>,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn CompressedStorage>,
    strategy: Arc<dyn CompressionStrategy>,
    compression_threshold: usize,
    instance_lock: SpinMutex<()>,
    /// Leaf lock, held only for state transitions and page copies.
    instance: SpinMutex<InstanceState>,
    /// Scratch page the codec writes into, allocated on first use.
    compression_lock: SpinMutex<Option<Page>>,
    counters: Counters,
}

impl fmt::Debug for VmCompression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmCompression")
            .field("compression_threshold", &self.compression_threshold)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

/// Clamps `threshold` so a compressed page and its timestamp fit in one page.
const fn ensure_threshold(threshold: usize) -> usize {
    if threshold > PAGE_SIZE - TIMESTAMP_SIZE {
        PAGE_SIZE - TIMESTAMP_SIZE
    } else {
        threshold
    }
}

impl VmCompression {
    /// Creates an engine that accepts compressed pages of up to
    /// `compression_threshold` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `clock` reports a tick rate of zero.
    #[must_use]
    pub fn new(
        pool: Arc<PagePool>,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn CompressedStorage>,
        strategy: Arc<dyn CompressionStrategy>,
        compression_threshold: usize,
    ) -> Self {
        assert_ne!(clock.ticks_per_second(), 0, "clock reports zero ticks per second");
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            clock,
            storage,
            strategy,
            compression_threshold: ensure_threshold(compression_threshold),
            instance_lock: SpinMutex::new(()),
            instance: SpinMutex::new(InstanceState::default()),
            compression_lock: SpinMutex::new(None),
            counters: Counters::default(),
        }
    }

    /// Builds the engine selected by the boot options.
    ///
    /// Returns `None` if compression is disabled or the options are
    /// inconsistent.
    ///
    /// # Panics
    ///
    /// Panics if the threshold option is not between 1 and 100.
    #[must_use]
    pub fn create_default(
        options: &BootOptions,
        pool: &Arc<PagePool>,
        clock: &Arc<dyn Clock>,
    ) -> Option<Arc<Self>> {
        match (
            options.compression_strategy,
            options.compression_storage_strategy,
        ) {
            (CompressionStrategyKind::Lz4, CompressionStorageStrategyKind::Slot) => {}
            (CompressionStrategyKind::None, CompressionStorageStrategyKind::None) => return None,
            (strategy, storage) => {
                error!(
                    "[zram]: Exactly one of kernel.compression.strategy and \
                     kernel.compression.storage-strategy was defined \
                     (strategy: {strategy}, storage: {storage})"
                );
                return None;
            }
        }

        let percent = options.compression_threshold;
        assert!(
            (1..=100).contains(&percent),
            "invalid compression threshold {percent}%, expected 1 to 100"
        );
        let threshold = PAGE_SIZE * percent as usize / 100;

        let storage: Arc<dyn CompressedStorage> = Arc::new(SlotStorage::new(Arc::clone(pool)));
        info!("[zram]: Using compressed storage strategy: slot");
        let strategy: Arc<dyn CompressionStrategy> = Arc::new(Lz4Compressor::new());
        info!("[zram]: Using compression strategy: lz4");
        info!("[zram]: Compression threshold: {percent}% ({threshold} bytes)");

        Some(Arc::new(Self::new(
            Arc::clone(pool),
            Arc::clone(clock),
            storage,
            strategy,
            threshold,
        )))
    }

    /// Largest compressed size that is accepted for storage.
    #[must_use]
    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Compresses `page_src` and stores the result, stamped with `now`.
    ///
    /// Never blocks on page allocation. If no scratch page can be allocated
    /// the attempt fails without being counted.
    pub fn compress(&self, page_src: &[u8; PAGE_SIZE], now: Ticks) -> CompressOutcome {
        let mut buffer_page = self.compression_lock.lock();
        let mut page = match buffer_page.take() {
            Some(page) => page,
            None => match self.pool.alloc_page() {
                Ok(page) => page,
                Err(err) => {
                    trace!("[zram]: no scratch page: {err}");
                    return CompressOutcome::Fail;
                }
            },
        };

        self.counters.attempt();
        let start = self.clock.thread_runtime();
        let result = self.strategy.compress(
            page_src,
            self.pool.physmap_mut(&mut page),
            self.compression_threshold,
        );
        self.counters
            .compression_time(self.clock.thread_runtime().saturating_sub(start));

        let len = match result {
            CompressResult::Fail => {
                self.counters.failure();
                *buffer_page = Some(page);
                return CompressOutcome::Fail;
            }
            CompressResult::ZeroPage => {
                self.counters.zero_page();
                *buffer_page = Some(page);
                return CompressOutcome::ZeroPage;
            }
            CompressResult::Data(len) => len,
        };
        assert!(
            len > 0 && len <= self.compression_threshold,
            "codec produced {len} bytes, limit {}",
            self.compression_threshold
        );

        DataView::from_mut(&mut self.pool.physmap_mut(&mut page)[..]).write(len, &now.as_raw());
        let StoreResult { reference, page } = self.storage.store(page, len + TIMESTAMP_SIZE);
        *buffer_page = page;

        if let Some(reference) = reference {
            self.counters.success();
            CompressOutcome::Stored(reference)
        } else {
            self.counters.failure();
            CompressOutcome::Fail
        }
    }

    /// Restores the page behind `reference` into `page_dest` and releases the
    /// reference. Returns the page metadata.
    pub fn decompress(
        &self,
        reference: CompressedRef,
        page_dest: &mut [u8; PAGE_SIZE],
        now: Ticks,
    ) -> u32 {
        let reference = match reference {
            CompressedRef::Temporary(temp) => {
                return self.decompress_temp_reference(temp, page_dest);
            }
            CompressedRef::Real(reference) => reference,
        };

        let CompressedData { data, metadata } = self.storage.compressed_data(&reference);
        assert!(
            data.len() > TIMESTAMP_SIZE,
            "stored blob of {} bytes has no payload",
            data.len()
        );
        let (payload, timestamp) = data.split_at(data.len() - TIMESTAMP_SIZE);
        let compressed_at = Ticks::from_raw(DataView::from(timestamp).read::<u64>(0));

        let ticks_per_second = self.clock.ticks_per_second();
        self.counters
            .decompression(bucket_for_ticks(compressed_at, now, ticks_per_second));

        let start = self.clock.thread_runtime();
        self.strategy.decompress(payload, page_dest);
        self.counters
            .decompression_time(self.clock.thread_runtime().saturating_sub(start));

        trace!(
            "[zram]: decompressed {reference:?} after {}s",
            now.whole_secs_since(compressed_at, ticks_per_second)
        );
        self.storage.free(reference);
        metadata
    }

    /// Releases `reference` without restoring its page.
    pub fn free(&self, reference: CompressedRef) {
        match reference {
            CompressedRef::Temporary(temp) => self.free_temp_reference(temp),
            CompressedRef::Real(reference) => {
                self.storage.free(reference);
                self.counters.eviction();
            }
        }
    }

    /// Returns the metadata of the page behind `reference`.
    ///
    /// Only the owner of `reference` can call this, so calls for one page are
    /// serialized by the lock of the object that owns the page.
    #[must_use]
    pub fn metadata(&self, reference: &CompressedRef) -> u32 {
        match reference {
            CompressedRef::Temporary(temp) => {
                self.check_owner(temp.engine());
                self.instance.lock().held_metadata()
            }
            CompressedRef::Real(reference) => self.storage.metadata(reference),
        }
    }

    pub fn set_metadata(&self, reference: &CompressedRef, metadata: u32) {
        match reference {
            CompressedRef::Temporary(temp) => {
                self.check_owner(temp.engine());
                self.instance.lock().set_held_metadata(metadata);
            }
            CompressedRef::Real(reference) => self.storage.set_metadata(reference, metadata),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.counters.snapshot(self.storage.memory_usage())
    }

    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let stats = self.stats();
        writeln!(
            out,
            "[zram]: Compression / decompression time {} / {} ns",
            stats.compression_time.as_nanos(),
            stats.decompression_time.as_nanos(),
        )?;
        writeln!(
            out,
            "[zram]: Compression attempts: {} success: {} zero page: {} failed: {}",
            stats.total_attempts,
            stats.successful_attempts,
            stats.zero_page_attempts,
            stats.failed_attempts,
        )?;
        write!(
            out,
            "[zram]: Total decompressions: {} skipped: {} within log seconds counts:",
            stats.total_decompressions, stats.compressed_page_evictions,
        )?;
        for (i, count) in stats.pages_decompressed_within_log_seconds.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(out, "{sep}{count}")?;
        }
        writeln!(out)?;
        self.strategy.dump(out)?;
        self.storage.dump(out)
    }
}

impl Drop for VmCompression {
    fn drop(&mut self) {
        if let Some(page) = self.compression_lock.get_mut().take() {
            self.pool.free_page(page);
        }
        let instance = self.instance.get_mut();
        for page in [instance.take_spare_page(), instance.take_held_page()]
            .into_iter()
            .flatten()
        {
            self.pool.free_page(page);
        }
    }
}
