//! Block device abstraction.
//!
//! The real device is an external collaborator: the cache only ever moves
//! whole 512-byte sectors through [`BlockDevice::read_sector`] and
//! [`BlockDevice::write_sector`]. [`MemDevice`] is an in-memory reference
//! implementation kept here so the rest of the crate has something to test
//! against; it is not meant to be a production backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::DeviceError;
use crate::inode::SECTOR_SIZE;

/// Identifies a block device among the ones registered with a
/// [`crate::cache::BufferCache`].
pub type DeviceId = u32;

/// Identifies a sector within a device. Sector `0` is reserved by the
/// inode module and is never handed out by a [`crate::alloc::SectorAllocator`].
pub type SectorId = u32;

/// A synchronous, whole-sector block device.
///
/// Implementations must be safe to call concurrently from multiple
/// threads; the cache relies on this to let independent sectors make
/// progress in parallel.
pub trait BlockDevice: Send + Sync {
    /// Stable identity used to key cache entries for this device.
    fn id(&self) -> DeviceId;

    /// Reads exactly one sector into `dst`.
    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError>;

    /// Writes exactly one sector from `src`.
    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<(), DeviceError>;
}

/// An in-memory block device, for tests and the reference build.
///
/// Tracks the number of `read_sector`/`write_sector` calls so tests can
/// assert on cache hit/miss behavior without instrumenting the cache
/// itself.
pub struct MemDevice {
    id: DeviceId,
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemDevice {
    /// Creates a device with `sector_count` zeroed sectors.
    pub fn new(id: DeviceId, sector_count: usize) -> Self {
        Self {
            id,
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of completed `read_sector` calls.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of completed `write_sector` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Directly inspects a sector's contents, bypassing any cache.
    /// Used by tests to check write-back correctness.
    pub fn raw_sector(&self, sector: SectorId) -> [u8; SECTOR_SIZE] {
        self.sectors.lock().unwrap()[sector as usize]
    }

    /// Directly seeds a sector's contents, bypassing any cache.
    pub fn seed_sector(&self, sector: SectorId, data: &[u8; SECTOR_SIZE]) {
        self.sectors.lock().unwrap()[sector as usize] = *data;
    }
}

impl BlockDevice for MemDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    fn read_sector(&self, sector: SectorId, dst: &mut [u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let sectors = self.sectors.lock().unwrap();
        let src = sectors
            .get(sector as usize)
            .ok_or(DeviceError::OutOfRange(sector))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&self, sector: SectorId, src: &[u8; SECTOR_SIZE]) -> Result<(), DeviceError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut sectors = self.sectors.lock().unwrap();
        let dst = sectors
            .get_mut(sector as usize)
            .ok_or(DeviceError::OutOfRange(sector))?;
        dst.copy_from_slice(src);
        Ok(())
    }
}
