use core::{fmt, num::NonZeroU32};

/// Handle to one blob held by a [`CompressedStorage`](crate::CompressedStorage).
///
/// Values are minted and reused only by the storage backend. A `RealRef` is
/// neither `Clone` nor `Copy`: the page list entry that holds it is its only
/// owner, and giving it back to the engine (`decompress`, `free`) consumes it.
#[derive(PartialEq, Eq, Hash)]
pub struct RealRef(NonZeroU32);

impl fmt::Debug for RealRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RealRef({})", self.0)
    }
}

impl RealRef {
    pub(crate) const fn new(key: NonZeroU32) -> Self {
        Self(key)
    }

    /// Wraps a key minted by a storage backend outside this crate.
    ///
    /// # Safety
    ///
    /// No other `RealRef` with the same key may exist while the returned one
    /// is alive. Borrows of stored blobs rely on the reference being unique:
    /// a second one could free the blob while the first is still borrowed.
    #[must_use]
    pub const unsafe fn from_key(key: NonZeroU32) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn key(&self) -> NonZeroU32 {
        self.0
    }
}

/// The reference published for data the compressor instance still holds.
///
/// Only the compressor instance can create one, and there is one instance per
/// engine, so at most one `TempRef` per engine exists at a time. It records
/// the engine that issued it and is rejected by any other engine.
#[derive(Debug, PartialEq, Eq)]
pub struct TempRef {
    engine: usize,
}

impl TempRef {
    pub(crate) const fn new(engine: usize) -> Self {
        Self { engine }
    }

    pub(crate) const fn engine(&self) -> usize {
        self.engine
    }

    /// Consumes the reference, returning the id of the engine that issued it.
    pub(crate) const fn into_engine(self) -> usize {
        self.engine
    }
}

/// A reference to compressed page contents.
#[derive(Debug, PartialEq, Eq)]
pub enum CompressedRef {
    /// Data committed to the storage backend.
    Real(RealRef),
    /// Data still held by the compressor instance, not yet in storage.
    Temporary(TempRef),
}

impl CompressedRef {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

impl From<RealRef> for CompressedRef {
    fn from(reference: RealRef) -> Self {
        Self::Real(reference)
    }
}
