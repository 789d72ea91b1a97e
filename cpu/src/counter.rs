// monotonically increasing atomic event counter
//
// used for call accounting (calls sent/received per peer), byte totals
// and sequentialization keys. counts only ever grow; readers tolerate
// slightly stale values, so loads are relaxed unless the caller needs
// happens-before with the counted event
//
// cache-padded so per-peer counter arrays don't false-share

use crate::cache_padded::CachePadded;
use core::sync::atomic::{AtomicU64, Ordering};

pub struct AtomicCounter {
    count: CachePadded<AtomicU64>,
}

impl AtomicCounter {
    #[inline]
    pub const fn new() -> Self {
        Self {
            count: CachePadded::new(AtomicU64::new(0)),
        }
    }

    // current value, relaxed; fine for observability reads
    #[inline(always)]
    pub fn value(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn inc(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn add(&self, delta: u64) {
        self.count.fetch_add(delta, Ordering::Relaxed);
    }

    // fetch-and-add returning the pre-increment value
    // used to allocate sequentialization keys: each caller gets a unique,
    // monotonically increasing value
    #[inline(always)]
    pub fn fetch_inc(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel)
    }

    // compare-and-swap; Ok(current) on success, Err(actual) on failure
    #[inline(always)]
    pub fn compare_exchange(&self, current: u64, new: u64) -> Result<u64, u64> {
        self.count
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AtomicCounter")
            .field("count", &self.value())
            .finish()
    }
}
