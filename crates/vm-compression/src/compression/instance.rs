//! The compressor instance and the temporary reference.
//!
//! Evicting a page takes two steps: the page is compressed and the result is
//! committed to storage. Holding the owning object's lock across both would
//! stall every other user of that object, so the reclaim path instead parks
//! the page in the compressor instance and publishes a [`TempRef`] in the page
//! list slot. Anyone who finds the temporary reference while the compression
//! runs can resolve it from the parked page right away.
//!
//! ```text
//!             start                 move / free / decompress
//!   Idle ───────────────▶ Holding ─────────────────────────▶ Holding (consumed)
//!    ▲                       │                                    │
//!    └───────── finalize ────┴────────────────────────────────────┘
//! ```

use core::fmt;

use pmm::{AllocError, PAGE_SIZE, Page};
use spin::mutex::SpinMutexGuard;

use super::{CompressOutcome, VmCompression};
use crate::{CompressedRef, Ticks, TempRef};

/// A page handed back to the caller, with the metadata that goes with it.
#[derive(Debug)]
#[must_use]
pub struct PageAndMetadata {
    pub page: Page,
    pub metadata: u32,
}

#[derive(Debug)]
struct HeldPage {
    page: Page,
    metadata: u32,
    /// Whether the temporary reference is still unconsumed.
    live: bool,
}

#[derive(Debug, Default)]
pub(super) struct InstanceState {
    spare_page: Option<Page>,
    held: Option<HeldPage>,
}

impl InstanceState {
    pub(super) fn is_idle(&self) -> bool {
        self.held.is_none()
    }

    pub(super) fn take_spare_page(&mut self) -> Option<Page> {
        self.spare_page.take()
    }

    /// Only left behind by a guard that panicked.
    pub(super) fn take_held_page(&mut self) -> Option<Page> {
        self.held.take().map(|held| held.page)
    }

    fn live_page(&mut self) -> &mut HeldPage {
        match &mut self.held {
            Some(held) if held.live => held,
            _ => panic!("no live temporary reference"),
        }
    }

    pub(super) fn held_metadata(&mut self) -> u32 {
        self.live_page().metadata
    }

    pub(super) fn set_held_metadata(&mut self, metadata: u32) {
        self.live_page().metadata = metadata;
    }
}

/// Exclusive use of the compressor instance.
///
/// Returned by [`VmCompression::acquire_compressor`]. Only one guard exists
/// at a time; other callers spin until it is dropped. The instance must be
/// idle again when the guard is dropped.
#[must_use]
pub struct CompressorGuard<'a> {
    compression: &'a VmCompression,
    _checkout: SpinMutexGuard<'a, ()>,
}

impl fmt::Debug for CompressorGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompressorGuard").finish_non_exhaustive()
    }
}

impl Drop for CompressorGuard<'_> {
    fn drop(&mut self) {
        assert!(
            self.compression.instance.lock().is_idle(),
            "compressor instance released while holding a page"
        );
    }
}

impl CompressorGuard<'_> {
    /// Makes sure a spare page is available for [`VmCompression::move_temp_reference`].
    ///
    /// Must succeed before [`Self::start`].
    pub fn arm(&mut self) -> Result<(), AllocError> {
        let mut state = self.compression.instance.lock();
        if state.spare_page.is_none() {
            state.spare_page = Some(self.compression.pool.alloc_page()?);
        }
        Ok(())
    }

    /// Parks `page` in the instance and returns the temporary reference that
    /// stands for it.
    ///
    /// # Panics
    ///
    /// Panics if the instance already holds a page or is not armed.
    pub fn start(&mut self, page: Page, metadata: u32) -> CompressedRef {
        let mut state = self.compression.instance.lock();
        assert!(state.is_idle(), "compressor instance already holds a page");
        assert!(state.spare_page.is_some(), "compressor instance is not armed");
        state.held = Some(HeldPage {
            page,
            metadata,
            live: true,
        });
        CompressedRef::Temporary(TempRef::new(self.compression.id))
    }

    /// Compresses the parked page.
    ///
    /// The temporary reference stays resolvable while this runs.
    ///
    /// # Panics
    ///
    /// Panics if no page is parked.
    pub fn compress(&mut self, now: Ticks) -> CompressOutcome {
        let frame = {
            let state = self.compression.instance.lock();
            let Some(held) = &state.held else {
                panic!("compressor instance holds no page");
            };
            self.compression.pool.frame_ptr(&held.page)
        };
        // The parked page is released only by `finalize`, which needs
        // `&mut self`, and nothing writes to it while it is parked.
        let page_src = unsafe { frame.as_ref() };
        self.compression.compress(page_src, now)
    }

    /// Takes the parked page back and returns the instance to idle.
    ///
    /// `reference` is the temporary reference if the caller still had it in
    /// the page list, or `None` if someone else consumed it meanwhile. The
    /// returned metadata includes any updates made through the temporary
    /// reference.
    ///
    /// # Panics
    ///
    /// Panics if no page is parked, or if `reference` disagrees with whether
    /// the temporary reference was consumed.
    pub fn finalize(&mut self, reference: Option<CompressedRef>) -> PageAndMetadata {
        let mut state = self.compression.instance.lock();
        let Some(held) = state.held.take() else {
            panic!("compressor instance holds no page");
        };
        match reference {
            Some(CompressedRef::Temporary(temp)) => {
                self.compression.check_owner(temp.engine());
                assert!(held.live, "temporary reference was already consumed");
            }
            Some(CompressedRef::Real(reference)) => {
                panic!("finalize expects the temporary reference, got {reference:?}");
            }
            None => assert!(!held.live, "temporary reference is still live"),
        }
        PageAndMetadata {
            page: held.page,
            metadata: held.metadata,
        }
    }
}

impl VmCompression {
    /// Checks out the compressor instance, spinning until it is available.
    pub fn acquire_compressor(&self) -> CompressorGuard<'_> {
        let checkout = self.instance_lock.lock();
        assert!(self.instance.lock().is_idle(), "idle compressor instance holds a page");
        CompressorGuard {
            compression: self,
            _checkout: checkout,
        }
    }

    /// # Panics
    ///
    /// Panics if `engine`, taken from a temporary reference, is not this engine.
    pub(super) fn check_owner(&self, engine: usize) {
        assert_eq!(
            engine,
            self.id,
            "temporary reference belongs to another engine"
        );
    }

    /// Resolves `reference` into a page owned by the caller.
    ///
    /// The parked page is copied into the instance's spare page, which is
    /// handed out. The instance must be armed again before its next use.
    ///
    /// # Panics
    ///
    /// Panics if the temporary reference is not live or belongs to another
    /// engine. Also panics if there is no spare page.
    pub fn move_temp_reference(&self, reference: TempRef) -> PageAndMetadata {
        self.check_owner(reference.into_engine());
        let mut state = self.instance.lock();
        let Some(mut spare) = state.spare_page.take() else {
            panic!("compressor instance has no spare page");
        };
        let held = state.live_page();
        self.pool
            .physmap_mut(&mut spare)
            .copy_from_slice(self.pool.physmap(&held.page));
        held.live = false;
        PageAndMetadata {
            page: spare,
            metadata: held.metadata,
        }
    }

    /// Consumes `reference` without restoring its page.
    ///
    /// # Panics
    ///
    /// Panics if the temporary reference is not live or belongs to another
    /// engine.
    pub fn free_temp_reference(&self, reference: TempRef) {
        self.check_owner(reference.into_engine());
        self.instance.lock().live_page().live = false;
    }

    /// Copies the page behind `reference` into `page_dest` and consumes the
    /// reference. Returns the page metadata.
    ///
    /// # Panics
    ///
    /// Panics if the temporary reference is not live or belongs to another
    /// engine.
    pub fn decompress_temp_reference(
        &self,
        reference: TempRef,
        page_dest: &mut [u8; PAGE_SIZE],
    ) -> u32 {
        self.check_owner(reference.into_engine());
        let mut state = self.instance.lock();
        let held = state.live_page();
        page_dest.copy_from_slice(self.pool.physmap(&held.page));
        held.live = false;
        held.metadata
    }
}
