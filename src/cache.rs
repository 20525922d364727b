//! Sector buffer cache.
//!
//! The buffer cache is a fixed set of N frames standing in front of one or
//! more block devices. Caching sectors in memory reduces the number of
//! device reads and gives the inode module a synchronization point for
//! sectors touched by multiple threads.
//!
//! Interface:
//! * To read bytes out of a sector, call [`BufferCache::read`].
//! * To write bytes into a sector, call [`BufferCache::write`].
//! * To force dirty frames back to a device, call [`BufferCache::flush`].
//! * [`BufferCache::destroy`] releases the cache; flush first or accept
//!   data loss.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, trace};

use crate::device::{BlockDevice, DeviceId, SectorId};
use crate::error::FsError;
use crate::inode::SECTOR_SIZE;
use crate::lock::{SleepLock, SpinLock};

type Key = (DeviceId, SectorId);

bitflags! {
    /// A slot's metadata bits: whether its frame has been written since
    /// its last load/flush, and whether it has been touched since the
    /// clock sweep last cleared it.
    struct SlotFlags: u8 {
        const DIRTY = 0b01;
        const REFERENCED = 0b10;
    }
}

struct SlotInner {
    resident: Option<Key>,
    flags: SlotFlags,
    data: [u8; SECTOR_SIZE],
}

impl SlotInner {
    fn empty() -> Self {
        Self {
            resident: None,
            flags: SlotFlags::empty(),
            data: [0u8; SECTOR_SIZE],
        }
    }

    fn dirty(&self) -> bool {
        self.flags.contains(SlotFlags::DIRTY)
    }

    fn referenced(&self) -> bool {
        self.flags.contains(SlotFlags::REFERENCED)
    }

    fn set_dirty(&mut self, value: bool) {
        self.flags.set(SlotFlags::DIRTY, value);
    }

    fn set_referenced(&mut self, value: bool) {
        self.flags.set(SlotFlags::REFERENCED, value);
    }
}

/// One cache residency: a 512-byte frame plus its `resident`/`dirty`/
/// `referenced` metadata, all guarded by one lock so that a reader or
/// writer can act on them atomically.
struct Slot {
    inner: SleepLock<SlotInner>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            inner: SleepLock::new(SlotInner::empty()),
        }
    }
}

/// Fixed-capacity, write-back sector cache with clock-sweep eviction.
///
/// `N` slots are allocated at construction and never grow; every sector
/// that does not fit evicts another under the second-chance clock-sweep
/// algorithm (see [`BufferCache::select_victim`]).
pub struct BufferCache {
    slots: Vec<Slot>,
    /// `(device, sector) -> slot index`. A short critical section: never
    /// held while performing device I/O or while a slot lock is held.
    index: SpinLock<HashMap<Key, usize>>,
    clock_hand: SpinLock<usize>,
    devices: SpinLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
}

impl BufferCache {
    /// Allocates `config.cache_slots` frames and an empty index.
    pub fn new(config: &crate::config::Config) -> Self {
        assert!(config.cache_slots > 0, "cache must have at least one slot");
        let mut slots = Vec::with_capacity(config.cache_slots);
        slots.resize_with(config.cache_slots, Slot::empty);
        Self {
            slots,
            index: SpinLock::new(HashMap::new()),
            clock_hand: SpinLock::new(0),
            devices: SpinLock::new(HashMap::new()),
        }
    }

    /// Number of slots (N).
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Registers a device so its sectors can be addressed by
    /// [`BlockDevice::id`] in `read`/`write`/`flush`.
    pub fn register_device(&self, device: Arc<dyn BlockDevice>) {
        self.devices.lock().insert(device.id(), device);
    }

    fn device(&self, id: DeviceId) -> Arc<dyn BlockDevice> {
        self.devices
            .lock()
            .get(&id)
            .unwrap_or_else(|| panic!("device {id} was never registered with this cache"))
            .clone()
    }

    /// Consumes the cache. Any frames not flushed first are discarded.
    pub fn destroy(self) {
        drop(self);
    }

    /// Copies `length` bytes starting at `offset` within `sector` into `dst`.
    pub fn read(
        &self,
        device: DeviceId,
        sector: SectorId,
        dst: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<(), FsError> {
        assert!(offset + length <= SECTOR_SIZE, "read out of sector bounds");
        let key = (device, sector);
        let idx = self.lookup_or_select(key);
        let mut slot = self.slots[idx].inner.lock();

        if slot.resident != Some(key) {
            trace!(device, sector, slot = idx, "cache miss (read)");
            self.install(&mut slot, idx, key, false)?;
        } else {
            trace!(device, sector, slot = idx, "cache hit (read)");
        }

        dst.copy_from_slice(&slot.data[offset..offset + length]);
        slot.set_referenced(true);
        Ok(())
    }

    /// Copies `length` bytes from `src` into the frame for `sector` at `offset`.
    pub fn write(
        &self,
        device: DeviceId,
        sector: SectorId,
        src: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), FsError> {
        assert!(offset + length <= SECTOR_SIZE, "write out of sector bounds");
        let key = (device, sector);
        let idx = self.lookup_or_select(key);
        let mut slot = self.slots[idx].inner.lock();

        if slot.resident != Some(key) {
            let full_overwrite = offset == 0 && length == SECTOR_SIZE;
            trace!(device, sector, slot = idx, full_overwrite, "cache miss (write)");
            self.install(&mut slot, idx, key, full_overwrite)?;
        } else {
            trace!(device, sector, slot = idx, "cache hit (write)");
        }

        slot.data[offset..offset + length].copy_from_slice(src);
        slot.set_dirty(true);
        slot.set_referenced(true);
        Ok(())
    }

    /// Writes back every dirty slot resident on `device` and clears its
    /// dirty flag. Acquires every slot lock in ascending index order and
    /// releases them in reverse.
    pub fn flush(&self, device: DeviceId) -> Result<(), FsError> {
        let mut guards = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            guards.push(slot.inner.lock());
        }

        let mut first_error = None;
        for slot in guards.iter_mut() {
            let Some((d, s)) = slot.resident else { continue };
            if d != device || !slot.dirty() {
                continue;
            }
            match self.device(d).write_sector(s, &slot.data) {
                Ok(()) => {
                    slot.set_dirty(false);
                }
                Err(e) if first_error.is_none() => {
                    first_error = Some(FsError::Device(e));
                }
                Err(_) => {}
            }
        }

        while guards.pop().is_some() {}
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Looks up `key` under the short index critical section. Returns the
    /// resident slot on a hit, or a freshly chosen victim slot index on a
    /// miss. The caller must recheck residency after taking the slot's
    /// lock: a concurrent loader may have installed `key` into that very
    /// slot (or any other) between this lookup and the lock acquisition.
    fn lookup_or_select(&self, key: Key) -> usize {
        if let Some(&idx) = self.index.lock().get(&key) {
            return idx;
        }
        self.select_victim()
    }

    /// Second-chance clock sweep. If every slot is currently referenced,
    /// clears every reference bit and resets the hand to slot 0 before
    /// searching, guaranteeing the search below terminates in one more
    /// pass. Otherwise advances the hand, wrapping modulo N, until it
    /// finds a slot whose reference bit is clear.
    fn select_victim(&self) -> usize {
        let n = self.slots.len();
        let mut hand = self.clock_hand.lock();

        if (0..n).all(|i| self.slots[i].inner.lock().referenced()) {
            debug!("clock sweep exhausted, resetting all reference bits");
            for slot in &self.slots {
                slot.inner.lock().set_referenced(false);
            }
            *hand = 0;
        }

        loop {
            let idx = *hand;
            *hand = (idx + 1) % n;
            if !self.slots[idx].inner.lock().referenced() {
                return idx;
            }
        }
    }

    /// Installs `key` into `slot`, evicting its prior resident first if
    /// any. When `skip_read` is set (a full-sector overwrite) the new
    /// contents are never read from the device, matching the write path's
    /// partial-sector semantics.
    fn install(
        &self,
        slot: &mut SlotInner,
        idx: usize,
        key: Key,
        skip_read: bool,
    ) -> Result<(), FsError> {
        if let Some(old_key) = slot.resident.take() {
            if slot.dirty() {
                debug!(
                    device = old_key.0,
                    sector = old_key.1,
                    slot = idx,
                    "evicting dirty slot"
                );
                self.device(old_key.0)
                    .write_sector(old_key.1, &slot.data)
                    .map_err(FsError::Device)?;
            }
            self.index.lock().remove(&old_key);
            slot.set_dirty(false);
            slot.data = [0u8; SECTOR_SIZE];
        }
        slot.set_referenced(false);

        if skip_read {
            slot.data = [0u8; SECTOR_SIZE];
        } else {
            self.device(key.0)
                .read_sector(key.1, &mut slot.data)
                .map_err(FsError::Device)?;
        }
        slot.resident = Some(key);
        self.index.lock().insert(key, idx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::MemDevice;
    use std::sync::Arc;

    fn fixture(slots: usize, sectors: usize) -> (BufferCache, Arc<MemDevice>) {
        let cache = BufferCache::new(&Config::with_cache_slots(slots));
        let dev = Arc::new(MemDevice::new(1, sectors));
        cache.register_device(dev.clone());
        (cache, dev)
    }

    #[test]
    fn cold_read_miss_then_warm_hit() {
        let (cache, dev) = fixture(4, 64);
        let mut seed = [0u8; SECTOR_SIZE];
        for (i, b) in seed.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        dev.seed_sector(42, &seed);

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(1, 42, &mut buf, 0, SECTOR_SIZE).unwrap();
        assert_eq!(buf, seed);
        assert_eq!(dev.read_count(), 1);

        let mut buf2 = [0u8; SECTOR_SIZE];
        cache.read(1, 42, &mut buf2, 0, SECTOR_SIZE).unwrap();
        assert_eq!(buf2, seed);
        assert_eq!(dev.read_count(), 1, "second read must be served from cache");
    }

    #[test]
    fn write_then_flush_is_visible_on_device() {
        let (cache, dev) = fixture(4, 64);
        let mut payload = [0xABu8; SECTOR_SIZE];
        payload[0] = 0x11;
        cache.write(1, 7, &payload, 0, SECTOR_SIZE).unwrap();
        assert_eq!(dev.write_count(), 0, "write must not hit the device before flush");

        cache.flush(1).unwrap();
        assert_eq!(dev.raw_sector(7), payload);
    }

    #[test]
    fn partial_write_preserves_surrounding_bytes() {
        let (cache, dev) = fixture(4, 64);
        let mut original = [0u8; SECTOR_SIZE];
        for (i, b) in original.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        dev.seed_sector(9, &original);

        let patch = [0xFFu8; 16];
        cache.write(1, 9, &patch, 100, patch.len()).unwrap();
        cache.flush(1).unwrap();

        let after = dev.raw_sector(9);
        assert_eq!(&after[100..116], &patch[..]);
        assert_eq!(&after[..100], &original[..100]);
        assert_eq!(&after[116..], &original[116..]);
    }

    #[test]
    fn eviction_writes_back_dirty_victim() {
        let (cache, dev) = fixture(4, 16);
        for sector in 1..=4u32 {
            cache.write(1, sector, &[sector as u8], 0, 1).unwrap();
        }
        assert_eq!(dev.write_count(), 0);

        // Fifth distinct sector forces an eviction (capacity is 4).
        let mut buf = [0u8; 1];
        cache.read(1, 5, &mut buf, 0, 1).unwrap();

        assert_eq!(dev.write_count(), 1, "exactly one victim must be written back");
    }

    #[test]
    fn never_more_resident_sectors_than_capacity() {
        let (cache, _dev) = fixture(4, 64);
        for sector in 0..20u32 {
            let mut buf = [0u8; 1];
            cache.read(1, sector, &mut buf, 0, 1).unwrap();
        }
        let resident = cache
            .slots
            .iter()
            .filter(|s| s.inner.lock().resident.is_some())
            .count();
        assert!(resident <= cache.capacity());
    }

    #[test]
    fn clock_reset_then_selects_slot_zero() {
        let (cache, _dev) = fixture(4, 64);
        // Touch every slot once so all reference bits are set.
        for sector in 0..4u32 {
            let mut buf = [0u8; 1];
            cache.read(1, sector, &mut buf, 0, 1).unwrap();
        }
        let victim = cache.select_victim();
        assert_eq!(victim, 0, "after an all-referenced reset, slot 0 is the first candidate");
    }

    #[test]
    fn unique_residency_across_slots() {
        let (cache, _dev) = fixture(8, 64);
        for sector in 0..8u32 {
            let mut buf = [0u8; 1];
            cache.read(1, sector, &mut buf, 0, 1).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        for slot in &cache.slots {
            if let Some(key) = slot.inner.lock().resident {
                assert!(seen.insert(key), "sector {key:?} resident in more than one slot");
            }
        }
    }
}
