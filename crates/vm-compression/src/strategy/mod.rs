//! Compression codecs.

use core::fmt;

use pmm::PAGE_SIZE;

pub use self::lz4::Lz4Compressor;

mod lz4;

/// Outcome of running a codec over one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressResult {
    /// The page did not compress to within the size limit.
    Fail,
    /// The page is all zeros; nothing needs to be stored.
    ZeroPage,
    /// The page compressed to this many bytes at the start of the destination.
    Data(usize),
}

/// A page compression algorithm.
///
/// Implementations must tolerate concurrent calls from multiple threads.
pub trait CompressionStrategy: Send + Sync {
    /// Compresses `src` into `dst`, producing at most `max_size` bytes.
    ///
    /// `max_size` never exceeds `PAGE_SIZE`.
    fn compress(
        &self,
        src: &[u8; PAGE_SIZE],
        dst: &mut [u8; PAGE_SIZE],
        max_size: usize,
    ) -> CompressResult;

    /// Restores a page from data previously produced by [`Self::compress`].
    ///
    /// # Panics
    ///
    /// Implementations panic if `src` is not something they produced, since
    /// that can only mean the stored data was corrupted.
    fn decompress(&self, src: &[u8], dst: &mut [u8; PAGE_SIZE]);

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result;
}
