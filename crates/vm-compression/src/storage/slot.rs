//! Size-classed slot storage.
//!
//! Blobs are rounded up to the smallest slot size that fits them and packed
//! into backing pages that hold slots of a single size. Blobs larger than the
//! biggest shared slot keep the page they arrived in, so storing them costs no
//! copy and no extra page.
//!
//! ```text
//! class 64:   [page 3: ■■■□□□…□]  [page 9: ■■■■■■…■]
//! class 128:  [page 5: ■□□…□]
//! class 4096: [page 2: ■]  [page 7: ■]      (the caller's own pages)
//! ```

use alloc::{sync::Arc, vec::Vec};
use core::{fmt, num::NonZeroU32, ptr, slice};

use pmm::{PAGE_SIZE, Page, PagePool};
use spin::mutex::SpinMutex;

use super::{CompressedData, CompressedStorage, StoreResult};
use crate::RealRef;

/// Available slot sizes.
///
/// The last class stores a blob in a page of its own.
const SLOT_SIZES: [usize; 7] = [64, 128, 256, 512, 1024, 2048, PAGE_SIZE];
const WHOLE_PAGE_CLASS: usize = SLOT_SIZES.len() - 1;
const _: () = assert!(PAGE_SIZE / SLOT_SIZES[0] <= u64::BITS as usize);

/// Returns the smallest class whose slots can hold `len` bytes.
fn class_index(len: usize) -> usize {
    assert!(
        len > 0 && len <= PAGE_SIZE,
        "invalid compressed length {len}"
    );
    SLOT_SIZES
        .iter()
        .position(|&size| size >= len)
        .unwrap_or(WHOLE_PAGE_CLASS)
}

struct SlotPage {
    page: Page,
    class: usize,
    /// Bit `n` is set when slot `n` holds a blob.
    used: u64,
}

impl SlotPage {
    fn slot_size(&self) -> usize {
        SLOT_SIZES[self.class]
    }

    fn slot_count(&self) -> usize {
        PAGE_SIZE / self.slot_size()
    }

    fn used_count(&self) -> usize {
        self.used.count_ones() as usize
    }

    fn is_full(&self) -> bool {
        self.used_count() == self.slot_count()
    }

    fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn take_slot(&mut self) -> usize {
        let slot = (!self.used).trailing_zeros() as usize;
        assert!(slot < self.slot_count(), "no free slot in backing page");
        self.used |= 1 << slot;
        slot
    }

    fn release_slot(&mut self, slot: usize) {
        let bit = 1 << slot;
        assert!(self.used & bit != 0, "slot {slot} is not in use");
        self.used &= !bit;
    }
}

struct Entry {
    page: usize,
    slot: usize,
    len: usize,
    metadata: u32,
}

#[derive(Default)]
struct Inner {
    pages: Vec<Option<SlotPage>>,
    vacant_pages: Vec<usize>,
    /// Backing pages of each class that still have a free slot.
    partial: [Vec<usize>; SLOT_SIZES.len()],
    entries: Vec<Option<Entry>>,
    vacant_entries: Vec<usize>,
    page_count: usize,
    live_count: usize,
}

impl Inner {
    fn insert_page(&mut self, slot_page: SlotPage) -> usize {
        self.page_count += 1;
        if let Some(index) = self.vacant_pages.pop() {
            self.pages[index] = Some(slot_page);
            index
        } else {
            self.pages.push(Some(slot_page));
            self.pages.len() - 1
        }
    }

    fn remove_page(&mut self, index: usize) -> SlotPage {
        let slot_page = self.pages[index].take().expect("backing page is missing");
        self.vacant_pages.push(index);
        self.page_count -= 1;
        slot_page
    }

    fn page_mut(&mut self, index: usize) -> &mut SlotPage {
        self.pages[index].as_mut().expect("backing page is missing")
    }

    fn page(&self, index: usize) -> &SlotPage {
        self.pages[index].as_ref().expect("backing page is missing")
    }

    fn insert_entry(&mut self, entry: Entry) -> RealRef {
        self.live_count += 1;
        let index = if let Some(index) = self.vacant_entries.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        };
        let key = u32::try_from(index + 1)
            .ok()
            .and_then(NonZeroU32::new)
            .expect("compressed reference space exhausted");
        RealRef::new(key)
    }

    fn entry_index(reference: &RealRef) -> usize {
        reference.key().get() as usize - 1
    }

    fn entry(&self, reference: &RealRef) -> &Entry {
        self.entries
            .get(Self::entry_index(reference))
            .and_then(Option::as_ref)
            .unwrap_or_else(|| panic!("{reference:?} is not a live reference"))
    }

    fn entry_mut(&mut self, reference: &RealRef) -> &mut Entry {
        self.entries
            .get_mut(Self::entry_index(reference))
            .and_then(Option::as_mut)
            .unwrap_or_else(|| panic!("{reference:?} is not a live reference"))
    }

    fn remove_entry(&mut self, reference: RealRef) -> Entry {
        let index = Self::entry_index(&reference);
        let entry = self
            .entries
            .get_mut(index)
            .and_then(Option::take)
            .unwrap_or_else(|| panic!("{reference:?} is not a live reference"));
        self.vacant_entries.push(index);
        self.live_count -= 1;
        entry
    }
}

/// Compressed storage that packs blobs into fixed-size slots.
pub struct SlotStorage {
    pool: Arc<PagePool>,
    inner: SpinMutex<Inner>,
}

impl fmt::Debug for SlotStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SlotStorage")
            .field("page_count", &inner.page_count)
            .field("live_count", &inner.live_count)
            .finish_non_exhaustive()
    }
}

impl SlotStorage {
    #[must_use]
    pub fn new(pool: Arc<PagePool>) -> Self {
        Self {
            pool,
            inner: SpinMutex::new(Inner::default()),
        }
    }

    /// Number of blobs currently stored.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.inner.lock().live_count
    }

    /// Number of pages currently backing stored blobs.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.inner.lock().page_count
    }

    /// Returns the address of `slot` within `page`.
    ///
    /// No reference to the whole frame is created, so slots of one page can be
    /// borrowed and written independently.
    fn slot_ptr(&self, slot_page: &SlotPage, slot: usize) -> *mut u8 {
        let frame = self.pool.frame_ptr(&slot_page.page).cast::<u8>();
        unsafe { frame.as_ptr().add(slot * slot_page.slot_size()) }
    }
}

impl Drop for SlotStorage {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for slot_page in inner.pages.iter_mut().filter_map(Option::take) {
            self.pool.free_page(slot_page.page);
        }
    }
}

impl CompressedStorage for SlotStorage {
    fn store(&self, page: Page, len: usize) -> StoreResult {
        let class = class_index(len);
        let mut inner = self.inner.lock();

        if class == WHOLE_PAGE_CLASS {
            let page = inner.insert_page(SlotPage {
                page,
                class,
                used: 1,
            });
            let reference = inner.insert_entry(Entry {
                page,
                slot: 0,
                len,
                metadata: 0,
            });
            return StoreResult {
                reference: Some(reference),
                page: None,
            };
        }

        let page_index = if let Some(&index) = inner.partial[class].last() {
            index
        } else {
            let Ok(backing) = self.pool.alloc_page() else {
                return StoreResult {
                    reference: None,
                    page: Some(page),
                };
            };
            let index = inner.insert_page(SlotPage {
                page: backing,
                class,
                used: 0,
            });
            inner.partial[class].push(index);
            index
        };

        let slot_page = inner.page_mut(page_index);
        let slot = slot_page.take_slot();
        let full = slot_page.is_full();
        let src = &self.pool.physmap(&page)[..len];
        let dst = self.slot_ptr(slot_page, slot);
        // The slot was free, so nothing else refers to its bytes.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), dst, len);
        }
        if full {
            inner.partial[class].pop();
        }

        let reference = inner.insert_entry(Entry {
            page: page_index,
            slot,
            len,
            metadata: 0,
        });
        StoreResult {
            reference: Some(reference),
            page: Some(page),
        }
    }

    fn compressed_data<'a>(&'a self, reference: &'a RealRef) -> CompressedData<'a> {
        let inner = self.inner.lock();
        let entry = inner.entry(reference);
        let slot_page = inner.page(entry.page);
        let ptr = self.slot_ptr(slot_page, entry.slot);
        // The slot is written once, before `reference` is handed out, and the
        // backing page is kept until the slot is freed. Freeing takes the
        // reference by value, and references are unique (`RealRef::new` is
        // crate-private, `RealRef::from_key` is unsafe), so no free can happen
        // while `reference` is borrowed for 'a.
        let data = unsafe { slice::from_raw_parts(ptr, entry.len) };
        CompressedData {
            data,
            metadata: entry.metadata,
        }
    }

    fn free(&self, reference: RealRef) {
        let mut inner = self.inner.lock();
        let entry = inner.remove_entry(reference);

        let slot_page = inner.page_mut(entry.page);
        let was_full = slot_page.is_full();
        slot_page.release_slot(entry.slot);
        let class = slot_page.class;

        if slot_page.is_empty() {
            if !was_full {
                inner.partial[class].retain(|&index| index != entry.page);
            }
            let slot_page = inner.remove_page(entry.page);
            self.pool.free_page(slot_page.page);
        } else if was_full {
            inner.partial[class].push(entry.page);
        }
    }

    fn metadata(&self, reference: &RealRef) -> u32 {
        self.inner.lock().entry(reference).metadata
    }

    fn set_metadata(&self, reference: &RealRef, metadata: u32) {
        self.inner.lock().entry_mut(reference).metadata = metadata;
    }

    fn memory_usage(&self) -> usize {
        self.inner.lock().page_count * PAGE_SIZE
    }

    fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock();
        writeln!(
            out,
            "[zram]: slot storage pages: {} blobs: {}",
            inner.page_count, inner.live_count
        )?;
        for (class, size) in SLOT_SIZES.iter().enumerate() {
            let (pages, slots) = inner
                .pages
                .iter()
                .flatten()
                .filter(|slot_page| slot_page.class == class)
                .fold((0, 0), |(pages, slots), slot_page| {
                    (pages + 1, slots + slot_page.used_count())
                });
            if pages > 0 {
                writeln!(out, "[zram]:   {size:4} byte slots: {slots} in {pages} pages")?;
            }
        }
        Ok(())
    }
}
