use core::{fmt, time::Duration};

/// A point on the monotonic hardware tick counter.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticks(u64);

impl fmt::Debug for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}t", self.0)
    }
}

impl Ticks {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_raw(ticks: u64) -> Self {
        Self(ticks)
    }

    #[must_use]
    pub const fn as_raw(self) -> u64 {
        self.0
    }

    /// Ticks elapsed since `earlier`, or zero if `earlier` is not earlier.
    #[must_use]
    pub fn saturating_ticks_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// Whole seconds elapsed since `earlier`; partial seconds are dropped.
    #[must_use]
    pub fn whole_secs_since(self, earlier: Self, ticks_per_second: u64) -> u64 {
        self.saturating_ticks_since(earlier) / ticks_per_second
    }

    #[must_use]
    pub fn saturating_add(self, ticks: u64) -> Self {
        Self(self.0.saturating_add(ticks))
    }
}

/// Time sources the compression engine needs from the platform.
pub trait Clock: Send + Sync {
    /// Rate of the tick counter used for compression timestamps.
    ///
    /// Must be non-zero and constant for the lifetime of the clock.
    fn ticks_per_second(&self) -> u64;

    /// CPU time consumed so far by the calling thread.
    fn thread_runtime(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_secs_truncates() {
        let start = Ticks::from_raw(1000);
        let end = start.saturating_add(2_500);
        assert_eq!(end.whole_secs_since(start, 1000), 2);
        assert_eq!(start.whole_secs_since(end, 1000), 0);
    }
}
