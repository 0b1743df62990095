//! Backends that hold compressed blobs.

use core::fmt;

use pmm::Page;

pub use self::slot::SlotStorage;
use crate::RealRef;

mod slot;

/// A stored blob, borrowed for as long as its reference is borrowed.
#[derive(Debug, Clone, Copy)]
pub struct CompressedData<'a> {
    pub data: &'a [u8],
    pub metadata: u32,
}

/// Result of [`CompressedStorage::store`].
#[derive(Debug)]
#[must_use]
pub struct StoreResult {
    /// Reference to the stored blob, or `None` if it could not be stored.
    pub reference: Option<RealRef>,
    /// A page handed back to the caller, to be used as the next scratch
    /// buffer. This may or may not be the page that was passed in.
    pub page: Option<Page>,
}

/// A key to blob store for compressed pages.
///
/// Implementations must be safe for concurrent `store`, `compressed_data` and
/// `free` calls. Metadata accessors are called by the owner of a reference
/// only, so calls for one reference never race with each other.
pub trait CompressedStorage: Send + Sync {
    /// Stores the first `len` bytes of `page`, taking ownership of the page.
    fn store(&self, page: Page, len: usize) -> StoreResult;

    /// Returns the blob and metadata behind `reference`.
    fn compressed_data<'a>(&'a self, reference: &'a RealRef) -> CompressedData<'a>;

    /// Releases the blob behind `reference`.
    fn free(&self, reference: RealRef);

    fn metadata(&self, reference: &RealRef) -> u32;

    fn set_metadata(&self, reference: &RealRef, metadata: u32);

    /// Bytes of memory currently held by the backend.
    fn memory_usage(&self) -> usize;

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}
