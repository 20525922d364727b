//! Free-sector allocation.
//!
//! The real free-sector bitmap lives outside this crate's scope; the
//! inode module only ever calls [`SectorAllocator::allocate`] for a single
//! sector at a time and never assumes the sectors it gets back are
//! contiguous with anything else. [`BitmapAllocator`] is a reference
//! implementation, built on the same `bitmaps` crate the buffer cache's
//! upstream lineage already depended on, kept here so the test suite has
//! a real allocator to exercise deferred delete against.

use std::sync::Mutex;

use bitmaps::Bitmap;

use crate::device::SectorId;
use crate::error::AllocError;

/// Total addressable sectors tracked by [`BitmapAllocator`]. Generous
/// enough to cover the doubly-indirect growth scenarios in the test
/// suite without approaching `FS_LIMIT`'s roughly 16 384-sector span.
const CAPACITY: usize = 1024;

/// Reserves and releases sector ranges.
///
/// Implementations must be safe to call concurrently; the inode module's
/// growth protocol calls `allocate` while holding only the inode's own
/// growth lock, never a cache slot lock.
pub trait SectorAllocator: Send + Sync {
    /// Reserves `count` contiguous sectors, returning the first one.
    /// The inode module only ever requests `count == 1`.
    fn allocate(&self, count: usize) -> Result<SectorId, AllocError>;

    /// Returns `count` sectors starting at `first` to the free pool.
    fn release(&self, first: SectorId, count: usize);
}

/// A bitmap-backed free-sector allocator over sectors `1..CAPACITY`.
/// Sector `0` is reserved and is never allocated, matching the data model.
pub struct BitmapAllocator {
    used: Mutex<Bitmap<CAPACITY>>,
}

impl BitmapAllocator {
    pub fn new() -> Self {
        let mut used = Bitmap::new();
        // Sector 0 is reserved; mark it permanently used so it is never handed out.
        used.set(0, true);
        Self {
            used: Mutex::new(used),
        }
    }

    /// Number of sectors currently marked free, for test assertions.
    pub fn free_count(&self) -> usize {
        let used = self.used.lock().unwrap();
        CAPACITY - used.len()
    }

    /// Whether `sector` is currently marked allocated.
    pub fn is_allocated(&self, sector: SectorId) -> bool {
        self.used.lock().unwrap().get(sector as usize)
    }
}

impl Default for BitmapAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SectorAllocator for BitmapAllocator {
    fn allocate(&self, count: usize) -> Result<SectorId, AllocError> {
        assert_eq!(count, 1, "BitmapAllocator only supports single-sector allocation");
        let mut used = self.used.lock().unwrap();
        for idx in 1..CAPACITY {
            if !used.get(idx) {
                used.set(idx, true);
                return Ok(idx as SectorId);
            }
        }
        Err(AllocError::OutOfSectors)
    }

    fn release(&self, first: SectorId, count: usize) {
        let mut used = self.used.lock().unwrap();
        for idx in first..first + count as SectorId {
            assert!(used.get(idx as usize), "releasing sector {idx} that was not allocated");
            used.set(idx as usize, false);
        }
    }
}
