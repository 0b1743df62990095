//! Physical page manager for the compression engine.
//!
//! This crate provides a fixed arena of page frames handed out as owned
//! [`Page`] handles. It stands in for the kernel PMM: allocation never blocks
//! and never tries to reclaim memory, so it is safe to call from code that is
//! itself running because memory is scarce.
//!
//! # Free List
//!
//! Free frames are chained through an intrusive singly-linked list. The index
//! of the next free frame is stored in the first word of each free frame, so
//! the free list costs no memory beyond the frames themselves.
//!
//! ```text
//! head ──► ┌──────────┬─────────┐    ┌──────────┬─────────┐
//!          │ next: 7  │ (free)  │ ─► │ next: NIL│ (free)  │
//!          └──────────┴─────────┘    └──────────┴─────────┘
//!             frame 3                   frame 7
//! ```
//!
//! # Ownership
//!
//! A [`Page`] is neither `Clone` nor `Copy`. Whoever holds the handle owns the
//! frame, and the frame's bytes can only be reached by borrowing the handle
//! ([`PagePool::physmap`], [`PagePool::physmap_mut`]). Handing a page to
//! another component is a move, which rules out use-after-free and double-free
//! of frames at compile time.
//!
//! # Examples
//!
//! ```
//! use pmm::{PAGE_SIZE, PagePool};
//!
//! let pool = PagePool::new(4);
//! let mut page = pool.alloc_page().unwrap();
//! pool.physmap_mut(&mut page).fill(0xAA);
//! assert_eq!(pool.physmap(&page)[PAGE_SIZE - 1], 0xAA);
//! assert_eq!(pool.free_count(), 3);
//!
//! pool.free_page(page);
//! assert_eq!(pool.free_count(), 4);
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::{boxed::Box, vec::Vec};
use core::{
    cell::UnsafeCell,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use snafu::{OptionExt as _, Snafu};
use spin::mutex::SpinMutex;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;
const _: () = assert!(PAGE_SIZE == 1 << PAGE_SHIFT);

/// Marks the end of the free list.
const NIL: u32 = u32::MAX;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug, Snafu)]
pub enum AllocError {
    #[snafu(display("no free page left in a pool of {page_count} pages"))]
    OutOfPages {
        #[snafu(implicit)]
        location: snafu::Location,
        page_count: usize,
    },
}

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; PAGE_SIZE]>);
const _: () = assert!(size_of::<Frame>() == PAGE_SIZE);

/// An owned handle to one page frame of a [`PagePool`].
///
/// Dropping a `Page` without passing it to [`PagePool::free_page`] leaks the
/// frame.
#[must_use]
pub struct Page {
    pool_id: usize,
    index: u32,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Page").field(&self.index).finish()
    }
}

impl Page {
    /// Returns the frame number of this page within its pool.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

#[derive(Debug)]
struct FreeList {
    head: u32,
    free_count: usize,
}

/// A fixed arena of page frames.
pub struct PagePool {
    id: usize,
    frames: Box<[Frame]>,
    free_list: SpinMutex<FreeList>,
}

// Frames are only reachable through an owned `Page` (or, while free, under the
// free list lock), so sharing the pool between threads never aliases a frame
// mutably.
unsafe impl Sync for PagePool {}
unsafe impl Send for PagePool {}

impl fmt::Debug for PagePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePool")
            .field("page_count", &self.page_count())
            .field("free_count", &self.free_count())
            .finish()
    }
}

impl PagePool {
    /// Creates a pool holding `page_count` free frames.
    ///
    /// # Panics
    ///
    /// Panics if `page_count` does not fit the frame index space.
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        let page_count_u32 = u32::try_from(page_count).expect("page count too large");
        assert!(page_count_u32 < NIL, "page count too large");

        let frames = (0..page_count)
            .map(|_| Frame(UnsafeCell::new([0; PAGE_SIZE])))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let pool = Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            frames,
            free_list: SpinMutex::new(FreeList {
                head: if page_count == 0 { NIL } else { 0 },
                free_count: page_count,
            }),
        };

        for index in 0..page_count_u32 {
            let next = if index + 1 == page_count_u32 {
                NIL
            } else {
                index + 1
            };
            unsafe {
                pool.write_link(index, next);
            }
        }

        pool
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.lock().free_count
    }

    /// Takes a frame off the free list.
    ///
    /// The contents of the returned page are unspecified.
    pub fn alloc_page(&self) -> Result<Page, AllocError> {
        let mut free_list = self.free_list.lock();
        let index = Some(free_list.head)
            .filter(|&head| head != NIL)
            .context(OutOfPagesSnafu {
                page_count: self.page_count(),
            })?;

        free_list.head = unsafe { self.read_link(index) };
        free_list.free_count -= 1;

        Ok(Page {
            pool_id: self.id,
            index,
        })
    }

    /// Returns a frame to the free list.
    ///
    /// # Panics
    ///
    /// Panics if `page` was allocated from a different pool.
    pub fn free_page(&self, page: Page) {
        self.assert_owns(&page);

        let mut free_list = self.free_list.lock();
        unsafe {
            self.write_link(page.index, free_list.head);
        }
        free_list.head = page.index;
        free_list.free_count += 1;
    }

    /// Returns the bytes of `page`.
    ///
    /// # Panics
    ///
    /// Panics if `page` was allocated from a different pool.
    #[must_use]
    pub fn physmap<'a>(&'a self, page: &'a Page) -> &'a [u8; PAGE_SIZE] {
        unsafe { self.frame_ptr(page).as_ref() }
    }

    /// Returns the bytes of `page` for writing.
    ///
    /// # Panics
    ///
    /// Panics if `page` was allocated from a different pool.
    #[must_use]
    pub fn physmap_mut<'a>(&'a self, page: &'a mut Page) -> &'a mut [u8; PAGE_SIZE] {
        unsafe { self.frame_ptr(page).as_mut() }
    }

    /// Returns a raw pointer to the frame behind `page`.
    ///
    /// Dereferencing the pointer is only sound while `page` is alive and no
    /// conflicting borrow of the same frame exists. Components that keep pages
    /// inside their own locks use this to hand out borrows whose lifetime they
    /// track themselves.
    ///
    /// # Panics
    ///
    /// Panics if `page` was allocated from a different pool.
    #[must_use]
    pub fn frame_ptr(&self, page: &Page) -> NonNull<[u8; PAGE_SIZE]> {
        self.assert_owns(page);
        let frame = &self.frames[page.index()];
        unsafe { NonNull::new_unchecked(frame.0.get()) }
    }

    fn assert_owns(&self, page: &Page) {
        assert_eq!(
            page.pool_id, self.id,
            "page {} does not belong to this pool",
            page.index
        );
    }

    /// Stores the free list link in the first word of a free frame.
    ///
    /// # Safety
    ///
    /// The frame at `index` must be free (not owned by any `Page`).
    #[expect(clippy::cast_ptr_alignment)]
    unsafe fn write_link(&self, index: u32, next: u32) {
        let frame = self.frames[index as usize].0.get();
        unsafe {
            frame.cast::<u32>().write(next);
        }
    }

    /// Reads the free list link from the first word of a free frame.
    ///
    /// # Safety
    ///
    /// The frame at `index` must be free (not owned by any `Page`).
    #[expect(clippy::cast_ptr_alignment)]
    unsafe fn read_link(&self, index: u32) -> u32 {
        let frame = self.frames[index as usize].0.get();
        unsafe {
            frame.cast::<u32>().read()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = PagePool::new(3);
        let pages = (0..3)
            .map(|_| pool.alloc_page().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(pool.free_count(), 0);

        let err = pool.alloc_page().unwrap_err();
        assert!(matches!(err, AllocError::OutOfPages { page_count: 3, .. }));

        for page in pages {
            pool.free_page(page);
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_empty_pool() {
        let pool = PagePool::new(0);
        assert_eq!(pool.page_count(), 0);
        assert!(pool.alloc_page().is_err());
    }

    #[test]
    fn test_freed_page_is_reused_first() {
        let pool = PagePool::new(4);
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();
        let b_index = b.index();
        pool.free_page(b);
        let c = pool.alloc_page().unwrap();
        assert_eq!(c.index(), b_index);
        pool.free_page(a);
        pool.free_page(c);
    }

    #[test]
    fn test_pages_do_not_alias() {
        let pool = PagePool::new(2);
        let mut a = pool.alloc_page().unwrap();
        let mut b = pool.alloc_page().unwrap();
        pool.physmap_mut(&mut a).fill(0x11);
        pool.physmap_mut(&mut b).fill(0x22);
        assert!(pool.physmap(&a).iter().all(|&x| x == 0x11));
        assert!(pool.physmap(&b).iter().all(|&x| x == 0x22));
        pool.free_page(a);
        pool.free_page(b);
    }

    #[test]
    fn test_free_list_link_survives_page_contents() {
        let pool = PagePool::new(3);
        let mut a = pool.alloc_page().unwrap();
        pool.physmap_mut(&mut a).fill(0xFF);
        pool.free_page(a);

        let mut indices = HashSet::new();
        let pages = (0..3)
            .map(|_| pool.alloc_page().unwrap())
            .collect::<Vec<_>>();
        for page in &pages {
            assert!(indices.insert(page.index()));
        }
        assert!(pool.alloc_page().is_err());
        for page in pages {
            pool.free_page(page);
        }
    }

    #[test]
    #[should_panic(expected = "does not belong to this pool")]
    fn test_free_foreign_page() {
        let pool_a = PagePool::new(1);
        let pool_b = PagePool::new(1);
        let page = pool_a.alloc_page().unwrap();
        pool_b.free_page(page);
    }

    #[test]
    fn test_concurrent_alloc_hands_out_distinct_frames() {
        let pool = Arc::new(PagePool::new(64));
        let handles = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    (0..16)
                        .map(|_| pool.alloc_page().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let pages = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect::<Vec<_>>();
        let indices = pages.iter().map(Page::index).collect::<HashSet<_>>();
        assert_eq!(indices.len(), 64);
        assert_eq!(pool.free_count(), 0);
        for page in pages {
            pool.free_page(page);
        }
    }
}
