use alloc::boxed::Box;
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use lz4_block::HashTable;
use pmm::PAGE_SIZE;
use spin::mutex::SpinMutex;

use super::{CompressResult, CompressionStrategy};

/// LZ4 block codec with a zero-page fast path.
pub struct Lz4Compressor {
    table: SpinMutex<Box<HashTable>>,
    compressed_pages: AtomicU64,
    failed_pages: AtomicU64,
    zero_pages: AtomicU64,
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lz4Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lz4Compressor")
            .field("compressed_pages", &self.compressed_pages)
            .field("failed_pages", &self.failed_pages)
            .field("zero_pages", &self.zero_pages)
            .finish_non_exhaustive()
    }
}

impl Lz4Compressor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: SpinMutex::new(Box::new(HashTable::new())),
            compressed_pages: AtomicU64::new(0),
            failed_pages: AtomicU64::new(0),
            zero_pages: AtomicU64::new(0),
        }
    }
}

fn is_zero_page(page: &[u8; PAGE_SIZE]) -> bool {
    page.iter().all(|&b| b == 0)
}

impl CompressionStrategy for Lz4Compressor {
    fn compress(
        &self,
        src: &[u8; PAGE_SIZE],
        dst: &mut [u8; PAGE_SIZE],
        max_size: usize,
    ) -> CompressResult {
        assert!(max_size <= PAGE_SIZE, "max_size {max_size} exceeds a page");

        if is_zero_page(src) {
            self.zero_pages.fetch_add(1, Ordering::Relaxed);
            return CompressResult::ZeroPage;
        }

        let mut table = self.table.lock();
        match lz4_block::compress_into(src, &mut dst[..max_size], &mut table) {
            Ok(len) => {
                debug_assert!(len > 0);
                self.compressed_pages.fetch_add(1, Ordering::Relaxed);
                CompressResult::Data(len)
            }
            Err(_) => {
                self.failed_pages.fetch_add(1, Ordering::Relaxed);
                CompressResult::Fail
            }
        }
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8; PAGE_SIZE]) {
        match lz4_block::decompress_into(src, dst) {
            Ok(PAGE_SIZE) => {}
            Ok(len) => panic!("lz4 block decoded to {len} bytes, expected {PAGE_SIZE}"),
            Err(err) => panic!("corrupt lz4 block: {err}"),
        }
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "[zram]: lz4 compressed: {} zero: {} too large: {}",
            self.compressed_pages.load(Ordering::Relaxed),
            self.zero_pages.load(Ordering::Relaxed),
            self.failed_pages.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fill_page, noise_page};

    #[test]
    fn test_zero_page_is_classified() {
        let codec = Lz4Compressor::new();
        let mut dst = [0xFF; PAGE_SIZE];
        let result = codec.compress(&fill_page(0), &mut dst, PAGE_SIZE);
        assert_eq!(result, CompressResult::ZeroPage);
    }

    #[test]
    fn test_round_trip() {
        let codec = Lz4Compressor::new();
        let src = fill_page(0xAA);
        let mut dst = [0; PAGE_SIZE];
        let CompressResult::Data(len) = codec.compress(&src, &mut dst, 3000) else {
            panic!("repeated byte page must compress");
        };
        let mut out = [0; PAGE_SIZE];
        codec.decompress(&dst[..len], &mut out);
        assert_eq!(out, src);
    }

    #[test]
    fn test_threshold_rejects_noise() {
        let codec = Lz4Compressor::new();
        let mut dst = [0; PAGE_SIZE];
        let result = codec.compress(&noise_page(3), &mut dst, PAGE_SIZE / 2);
        assert_eq!(result, CompressResult::Fail);

        let mut dump = String::new();
        codec.dump(&mut dump).unwrap();
        assert!(dump.contains("too large: 1"), "{dump}");
    }

    #[test]
    #[should_panic(expected = "corrupt lz4 block")]
    fn test_corrupt_input_panics() {
        let codec = Lz4Compressor::new();
        let mut out = [0; PAGE_SIZE];
        codec.decompress(&[0x10, b'a', 0x09, 0x00], &mut out);
    }
}
