//! Page compression for kernel memory reclamation.
//!
//! The engine compresses pages chosen for eviction, keeps the compressed
//! bytes in a pluggable storage backend and restores them when the page is
//! touched again. Codecs ([`CompressionStrategy`]) and storage backends
//! ([`CompressedStorage`]) are trait objects chosen at boot by
//! [`VmCompression::create_default`].
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//!
//! use pmm::{PAGE_SIZE, PagePool};
//! use vm_compression::{
//!     BootOptions, Clock, CompressOutcome, CompressedRef, Ticks, VmCompression,
//!     testing::{ManualClock, fill_page},
//! };
//!
//! let pool = Arc::new(PagePool::new(16));
//! let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000_000));
//! let options = BootOptions::parse(
//!     "kernel.compression.strategy=lz4 kernel.compression.storage-strategy=slot",
//! )
//! .unwrap();
//! let compression = VmCompression::create_default(&options, &pool, &clock).unwrap();
//!
//! let page = fill_page(0x5A);
//! let CompressOutcome::Stored(reference) = compression.compress(&page, Ticks::ZERO) else {
//!     panic!("page did not compress");
//! };
//!
//! let mut restored = [0; PAGE_SIZE];
//! compression.decompress(CompressedRef::Real(reference), &mut restored, Ticks::ZERO);
//! assert_eq!(restored, page);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use pmm::PAGE_SIZE;

pub use self::{
    boot_options::{
        BootOptions, BootOptionsError, CompressionStorageStrategyKind, CompressionStrategyKind,
    },
    compressed_ref::{CompressedRef, RealRef, TempRef},
    compression::{
        CompressOutcome, CompressorGuard, NUM_LOG_BUCKETS, PageAndMetadata, Stats,
        TIMESTAMP_SIZE, VmCompression, bucket_for_ticks,
    },
    storage::CompressedStorage,
    strategy::{CompressResult, CompressionStrategy},
    time::{Clock, Ticks},
};

#[macro_use]
pub mod log;

mod boot_options;
mod compressed_ref;
mod compression;
pub mod storage;
pub mod strategy;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod time;
