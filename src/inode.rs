//! Multi-level inode: on-disk layout, growth, and deferred delete.
//!
//! An inode maps a byte offset to a sector through a small direct table
//! plus one singly- and one doubly-indirect sector. [`DiskInode`] is the
//! exact 512-byte on-disk record; an [`InodeHandle`] is the in-memory,
//! reference-counted handle returned by [`InodeTable::open`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use static_assertions::const_assert_eq;
use tracing::{debug, trace, warn};
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::alloc::SectorAllocator;
use crate::cache::BufferCache;
use crate::device::{DeviceId, SectorId};
use crate::error::FsError;
use crate::lock::SleepLock;

/// Bytes in one sector, and in one [`DiskInode`] record.
pub const SECTOR_SIZE: usize = 512;

/// Pointers held directly in the inode record.
pub const DIRECT_COUNT: usize = 124;
/// Pointers held in one indirect sector.
pub const INDIRECT_COUNT: usize = SECTOR_SIZE / 4;

/// Largest logical sector index representable by this inode's sector-map
/// tree: `DIRECT_COUNT` direct sectors, plus `INDIRECT_COUNT` from the
/// singly-indirect sector, plus `INDIRECT_COUNT * INDIRECT_COUNT` from
/// the doubly-indirect one. This is the structural limit of the pointer
/// tree, not the enforced file size cap — see [`FS_LIMIT`].
pub const MAX_FILE_SECTORS: usize = DIRECT_COUNT + INDIRECT_COUNT + INDIRECT_COUNT * INDIRECT_COUNT;

/// Largest byte length `write_at` will grow a file to. Smaller than the
/// structural capacity implied by [`MAX_FILE_SECTORS`]: the pointer tree
/// could in principle address more, but growth is capped here regardless.
pub const FS_LIMIT: u64 = (1u64 << 23) - SECTOR_SIZE as u64;

/// Tags a sector as holding a valid [`DiskInode`].
const INODE_MAGIC: u32 = 0x494e_4f44;

/// The on-disk inode record: exactly one sector.
///
/// Layout (little-endian throughout, 4 bytes per field, fixed field
/// order): `direct` (`DIRECT_COUNT` sector ids, offset 0), `singly_indirect`
/// (offset 496), `doubly_indirect` (offset 500), `length` (offset 504),
/// `magic` (offset 508) — `DIRECT_COUNT * 4 + 4 + 4 + 4 + 4 ==
/// SECTOR_SIZE` exactly, so there is no padding tail. `length` is a
/// 32-bit byte offset, comfortably covering [`FS_LIMIT`]. A pointer value
/// of `0` means "not yet allocated" and is always skipped rather than
/// dereferenced.
#[derive(Debug, Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct DiskInode {
    direct: [U32; DIRECT_COUNT],
    singly_indirect: U32,
    doubly_indirect: U32,
    length: U32,
    magic: U32,
}

const_assert_eq!(std::mem::size_of::<DiskInode>(), SECTOR_SIZE);

impl DiskInode {
    fn new(length: u32) -> Self {
        Self {
            direct: [U32::new(0); DIRECT_COUNT],
            singly_indirect: U32::new(0),
            doubly_indirect: U32::new(0),
            length: length.into(),
            magic: INODE_MAGIC.into(),
        }
    }

    fn length(&self) -> u64 {
        self.length.get() as u64
    }

    fn sectors_in_use(&self) -> usize {
        let full_sectors = self.length().div_ceil(SECTOR_SIZE as u64) as usize;
        full_sectors
    }
}

/// Life cycle state shared by every [`InodeHandle`] open on the same sector.
struct Registration {
    open_count: usize,
    deny_write_count: usize,
    removed: bool,
}

/// Per-inode growth/deallocation serialization, plus the shared
/// registration counters. The registry map's own lock protects
/// registration only (inserting/removing entries as handles come and
/// go); mutation of an individual inode's counters and pointer table is
/// serialized by this per-inode lock, so two threads opening or closing
/// *different* inodes never contend with each other.
struct InodeState {
    registration: Mutex<Registration>,
    growth: SleepLock<()>,
}

/// Registry of inodes open on one device backed by one [`BufferCache`].
///
/// Cheap to clone: every field is either `Copy` or an `Arc`, so an
/// [`InodeHandle`] carries its own clone rather than borrowing from the
/// table that produced it. A table can be dropped while handles opened
/// from it are still live.
#[derive(Clone)]
pub struct InodeTable {
    device: DeviceId,
    cache: Arc<BufferCache>,
    allocator: Arc<dyn SectorAllocator>,
    states: Arc<Mutex<HashMap<SectorId, Arc<InodeState>>>>,
}

impl InodeTable {
    pub fn new(device: DeviceId, cache: Arc<BufferCache>, allocator: Arc<dyn SectorAllocator>) -> Self {
        Self {
            device,
            cache,
            allocator,
            states: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn state_for(&self, sector: SectorId) -> Arc<InodeState> {
        self.states
            .lock()
            .unwrap()
            .entry(sector)
            .or_insert_with(|| {
                Arc::new(InodeState {
                    registration: Mutex::new(Registration {
                        open_count: 0,
                        deny_write_count: 0,
                        removed: false,
                    }),
                    growth: SleepLock::new(()),
                })
            })
            .clone()
    }

    fn read_disk_inode(&self, sector: SectorId) -> Result<DiskInode, FsError> {
        let mut raw = [0u8; SECTOR_SIZE];
        self.cache.read(self.device, sector, &mut raw, 0, SECTOR_SIZE)?;
        let disk = DiskInode::read_from(&raw[..]).expect("sector-sized buffer always parses");
        Ok(disk)
    }

    fn write_disk_inode(&self, sector: SectorId, disk: &DiskInode) -> Result<(), FsError> {
        self.cache.write(self.device, sector, disk.as_bytes(), 0, SECTOR_SIZE)
    }

    /// Formats `sector` as a fresh inode of `length` bytes, allocating
    /// whatever data sectors and indirect blocks are needed to cover it.
    /// On allocation failure the sectors allocated by this call are
    /// released and `sector` is left holding an empty (zero-length)
    /// record; the caller is responsible for reclaiming `sector` itself.
    /// Does not open the inode; call [`InodeTable::open`] next.
    pub fn create(&self, sector: SectorId, length: u64) -> Result<(), FsError> {
        if length > FS_LIMIT {
            return Err(FsError::OutOfRange);
        }
        let mut disk = DiskInode::new(0);
        self.write_disk_inode(sector, &disk)?;
        if length > 0 {
            if let Err(e) = extend_disk_inode(self, sector, &mut disk, length) {
                debug!(sector, error = %e, "create: initial growth failed");
                return Err(e);
            }
        }
        debug!(sector, length, "created inode");
        Ok(())
    }

    /// Opens `sector`, incrementing its open count. The sector must
    /// already hold a valid inode record (see [`InodeTable::create`]).
    pub fn open(&self, sector: SectorId) -> Result<InodeHandle, FsError> {
        let disk = self.read_disk_inode(sector)?;
        assert_eq!(disk.magic.get(), INODE_MAGIC, "sector {sector} has no valid inode");

        let state = self.state_for(sector);
        {
            let mut reg = state.registration.lock().unwrap();
            assert!(!reg.removed, "cannot open an inode pending removal");
            reg.open_count += 1;
        }
        trace!(sector, "opened inode");

        Ok(InodeHandle {
            table: self.clone(),
            sector,
            state,
        })
    }
}

/// A reference-counted, open handle to an inode.
///
/// Dropping the last handle to an inode whose [`InodeHandle::remove`] was
/// called earlier deallocates its sectors (deferred delete).
pub struct InodeHandle {
    table: InodeTable,
    sector: SectorId,
    state: Arc<InodeState>,
}

impl InodeHandle {
    /// Current length in bytes.
    pub fn length(&self) -> Result<u64, FsError> {
        Ok(self.table.read_disk_inode(self.sector)?.length())
    }

    /// Produces an independent handle to the same inode, incrementing
    /// its open count.
    pub fn reopen(&self) -> InodeHandle {
        self.state.registration.lock().unwrap().open_count += 1;
        InodeHandle {
            table: self.table.clone(),
            sector: self.sector,
            state: self.state.clone(),
        }
    }

    /// Marks the inode for removal. The sectors are not reclaimed until
    /// every open handle (including this one) is dropped.
    pub fn remove(&self) {
        let mut reg = self.state.registration.lock().unwrap();
        reg.removed = true;
        debug!(sector = self.sector, "marked inode for removal");
    }

    /// Forbids writers until a matching [`InodeHandle::allow_write`].
    /// `deny_write`/`allow_write` are simple paired calls rather than an
    /// RAII guard, since a caller may need to hold the denial open across
    /// several unrelated operations before releasing it.
    pub fn deny_write(&self) {
        let mut reg = self.state.registration.lock().unwrap();
        reg.deny_write_count += 1;
    }

    /// Reverses one prior [`InodeHandle::deny_write`] call.
    pub fn allow_write(&self) {
        let mut reg = self.state.registration.lock().unwrap();
        assert!(reg.deny_write_count > 0, "allow_write without matching deny_write");
        reg.deny_write_count -= 1;
    }

    /// Reads up to `dst.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read: short when the read runs past the
    /// current end of file, or when a device error interrupts the
    /// transfer partway through — there is no exception-style failure
    /// path here, only a count smaller than the caller asked for.
    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> usize {
        let Ok(disk) = self.table.read_disk_inode(self.sector) else {
            return 0;
        };
        let length = disk.length();
        if offset >= length {
            return 0;
        }
        let to_read = dst.len().min((length - offset) as usize);
        let mut done = 0usize;
        while done < to_read {
            let file_offset = offset + done as usize as u64;
            let sector_index = (file_offset / SECTOR_SIZE as u64) as usize;
            let within = (file_offset % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(to_read - done);

            let sector = match self.bmap(&disk, sector_index) {
                Ok(s) => s,
                Err(_) => break,
            };
            match sector {
                Some(sector) => {
                    let read = self.table.cache.read(
                        self.table.device,
                        sector,
                        &mut dst[done..done + chunk],
                        within,
                        chunk,
                    );
                    if read.is_err() {
                        break;
                    }
                }
                None => {
                    dst[done..done + chunk].fill(0);
                }
            }
            done += chunk;
        }
        done
    }

    /// Writes `src.len()` bytes starting at `offset`, extending the file
    /// (allocating sectors as needed) if the write runs past the current
    /// end of file. Returns the number of bytes actually written: `0` if
    /// writes are currently denied, if the write would cross `FS_LIMIT`,
    /// or if extension fails; otherwise a short count if a device error
    /// interrupts the transfer partway through.
    pub fn write_at(&self, src: &[u8], offset: u64) -> usize {
        if self.state.registration.lock().unwrap().deny_write_count > 0 {
            return 0;
        }
        let end = offset + src.len() as u64;
        if end > FS_LIMIT {
            return 0;
        }

        let Ok(mut disk) = self.table.read_disk_inode(self.sector) else {
            return 0;
        };

        if end > disk.length() {
            // Growth is only held around the extension itself: a write that
            // doesn't cross the current end of file must not serialize behind
            // unrelated growth elsewhere in the same inode. Re-read under the
            // lock in case another thread's growth already covers `end`.
            let _growth = self.state.growth.lock();
            let Ok(fresh) = self.table.read_disk_inode(self.sector) else {
                return 0;
            };
            disk = fresh;
            if end > disk.length() && self.extend_locked(&mut disk, end).is_err() {
                return 0;
            }
        }

        let mut done = 0usize;
        while done < src.len() {
            let file_offset = offset + done as u64;
            let sector_index = (file_offset / SECTOR_SIZE as u64) as usize;
            let within = (file_offset % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(src.len() - done);

            let sector = match self.bmap(&disk, sector_index) {
                Ok(Some(s)) => s,
                Ok(None) => panic!("sector {sector_index} must exist after extend_locked"),
                Err(_) => break,
            };
            let wrote = self
                .table
                .cache
                .write(self.table.device, sector, &src[done..done + chunk], within, chunk);
            if wrote.is_err() {
                break;
            }
            done += chunk;
        }
        done
    }

    /// Resolves the sector holding byte range `[index*SECTOR_SIZE, ...)`.
    /// Read-only: never allocates. Growth (extending the file so that a
    /// sector exists) happens in [`InodeHandle::extend_locked`], which
    /// runs before this is called from `write_at`.
    fn bmap(&self, disk: &DiskInode, index: usize) -> Result<Option<SectorId>, FsError> {
        if index < DIRECT_COUNT {
            let existing = disk.direct[index].get();
            return Ok(if existing == 0 { None } else { Some(existing) });
        }

        let index = index - DIRECT_COUNT;
        if index < INDIRECT_COUNT {
            let indirect_sector = disk.singly_indirect.get();
            if indirect_sector == 0 {
                return Ok(None);
            }
            return self.read_pointer(indirect_sector, index);
        }

        let index = index - INDIRECT_COUNT;
        let outer_index = index / INDIRECT_COUNT;
        let inner_index = index % INDIRECT_COUNT;
        let doubly_sector = disk.doubly_indirect.get();
        if doubly_sector == 0 {
            return Ok(None);
        }
        let Some(inner_sector) = self.read_pointer(doubly_sector, outer_index)? else {
            return Ok(None);
        };
        self.read_pointer(inner_sector, inner_index)
    }

    fn read_pointer(&self, table_sector: SectorId, index: usize) -> Result<Option<SectorId>, FsError> {
        read_pointer(&self.table, table_sector, index)
    }

    /// Grows the file to `new_length` bytes, allocating every sector and
    /// index block needed along the way. On allocation failure, releases
    /// only the sectors newly allocated by *this* call (never the
    /// singly/doubly-indirect index sectors themselves if they already
    /// existed) and returns the error, leaving the file at its old length.
    fn extend_locked(&self, disk: &mut DiskInode, new_length: u64) -> Result<(), FsError> {
        extend_disk_inode(&self.table, self.sector, disk, new_length)
    }

    /// Walks every pointer in use and releases it, then releases the
    /// singly- and doubly-indirect index sectors themselves (each
    /// exactly once). A pointer value of `0` is always skipped rather
    /// than dereferenced.
    fn deallocate(&self, disk: &DiskInode) {
        let sectors_in_use = disk.sectors_in_use();

        let direct_count = sectors_in_use.min(DIRECT_COUNT);
        for slot in disk.direct.iter().take(direct_count) {
            let sector = slot.get();
            if sector != 0 {
                self.table.allocator.release(sector, 1);
            }
        }

        if sectors_in_use <= DIRECT_COUNT {
            return;
        }
        let remaining = sectors_in_use - DIRECT_COUNT;
        let indirect_sector = disk.singly_indirect.get();
        if indirect_sector != 0 {
            let count = remaining.min(INDIRECT_COUNT);
            for i in 0..count {
                if let Ok(Some(sector)) = self.read_pointer(indirect_sector, i) {
                    self.table.allocator.release(sector, 1);
                }
            }
            self.table.allocator.release(indirect_sector, 1);
        }

        if remaining <= INDIRECT_COUNT {
            return;
        }
        let remaining = remaining - INDIRECT_COUNT;
        let doubly_sector = disk.doubly_indirect.get();
        if doubly_sector == 0 {
            return;
        }
        let outer_count = remaining.div_ceil(INDIRECT_COUNT);
        for outer in 0..outer_count {
            let Ok(Some(inner_sector)) = self.read_pointer(doubly_sector, outer) else {
                continue;
            };
            let inner_count = remaining.saturating_sub(outer * INDIRECT_COUNT).min(INDIRECT_COUNT);
            for i in 0..inner_count {
                if let Ok(Some(sector)) = self.read_pointer(inner_sector, i) {
                    self.table.allocator.release(sector, 1);
                }
            }
            self.table.allocator.release(inner_sector, 1);
        }
        self.table.allocator.release(doubly_sector, 1);
    }
}

fn read_pointer(table: &InodeTable, table_sector: SectorId, index: usize) -> Result<Option<SectorId>, FsError> {
    let mut entry = [0u8; 4];
    table.cache.read(table.device, table_sector, &mut entry, index * 4, 4)?;
    let value = u32::from_le_bytes(entry);
    Ok(if value == 0 { None } else { Some(value) })
}

fn write_pointer(table: &InodeTable, table_sector: SectorId, index: usize, value: SectorId) -> Result<(), FsError> {
    table
        .cache
        .write(table.device, table_sector, &value.to_le_bytes(), index * 4, 4)
}

fn zero_sector(table: &InodeTable, sector: SectorId) -> Result<(), FsError> {
    let zero = [0u8; SECTOR_SIZE];
    table.cache.write(table.device, sector, &zero, 0, SECTOR_SIZE)
}

fn ensure_index_sector(
    table: &InodeTable,
    field: &mut U32,
    newly_allocated: &mut Vec<SectorId>,
) -> Result<SectorId, FsError> {
    let current = field.get();
    if current != 0 {
        return Ok(current);
    }
    let sector = table.allocator.allocate(1)?;
    newly_allocated.push(sector);
    zero_sector(table, sector)?;
    *field = sector.into();
    Ok(sector)
}

/// Allocates whatever this logical sector `index` still needs and wires its
/// pointer(s) in. `newly_allocated` collects every sector id this call hands
/// out (released wholesale on rollback); `written_pointers` collects every
/// `(table_sector, entry_index)` this call wrote into an index sector that
/// *predates* this call (i.e. `table_sector` is not itself in
/// `newly_allocated`) — those entries are committed directly to the cache as
/// they're written, so unlike a fresh index sector (which rollback discards
/// in full) they must be individually cleared on rollback, or the
/// pre-existing index sector is left pointing at a sector just handed back
/// to the allocator.
fn allocate_one(
    table: &InodeTable,
    disk: &mut DiskInode,
    index: usize,
    newly_allocated: &mut Vec<SectorId>,
    written_pointers: &mut Vec<(SectorId, usize)>,
) -> Result<(), FsError> {
    if index < DIRECT_COUNT {
        if disk.direct[index].get() == 0 {
            let sector = table.allocator.allocate(1)?;
            newly_allocated.push(sector);
            zero_sector(table, sector)?;
            disk.direct[index] = sector.into();
        }
        return Ok(());
    }

    let index = index - DIRECT_COUNT;
    if index < INDIRECT_COUNT {
        let indirect_sector = ensure_index_sector(table, &mut disk.singly_indirect, newly_allocated)?;
        if read_pointer(table, indirect_sector, index)?.is_none() {
            let sector = table.allocator.allocate(1)?;
            newly_allocated.push(sector);
            zero_sector(table, sector)?;
            write_pointer(table, indirect_sector, index, sector)?;
            written_pointers.push((indirect_sector, index));
        }
        return Ok(());
    }

    let index = index - INDIRECT_COUNT;
    let outer_index = index / INDIRECT_COUNT;
    let inner_index = index % INDIRECT_COUNT;

    let doubly_sector = ensure_index_sector(table, &mut disk.doubly_indirect, newly_allocated)?;
    let inner_sector = match read_pointer(table, doubly_sector, outer_index)? {
        Some(s) => s,
        None => {
            let s = table.allocator.allocate(1)?;
            newly_allocated.push(s);
            write_pointer(table, doubly_sector, outer_index, s)?;
            written_pointers.push((doubly_sector, outer_index));
            zero_sector(table, s)?;
            s
        }
    };
    if read_pointer(table, inner_sector, inner_index)?.is_none() {
        let sector = table.allocator.allocate(1)?;
        newly_allocated.push(sector);
        zero_sector(table, sector)?;
        write_pointer(table, inner_sector, inner_index, sector)?;
        written_pointers.push((inner_sector, inner_index));
    }
    Ok(())
}

/// Grows `disk` (the on-disk record resident at `sector`) to `new_length`
/// bytes, allocating data sectors and indirect index blocks as needed,
/// then writes the updated record back through the cache. Shared by
/// [`InodeTable::create`] (initial allocation) and
/// [`InodeHandle::extend_locked`] (growth on write); both already hold
/// whatever serialization they need before calling this (`create` runs
/// before the inode is registered for opening, `extend_locked` runs under
/// the inode's growth lock).
fn extend_disk_inode(
    table: &InodeTable,
    sector: SectorId,
    disk: &mut DiskInode,
    new_length: u64,
) -> Result<(), FsError> {
    let old_sectors = disk.sectors_in_use();
    let new_sectors = new_length.div_ceil(SECTOR_SIZE as u64) as usize;
    let mut newly_allocated: Vec<SectorId> = Vec::new();
    let mut written_pointers: Vec<(SectorId, usize)> = Vec::new();

    let result = (|| -> Result<(), FsError> {
        for index in old_sectors..new_sectors {
            allocate_one(table, disk, index, &mut newly_allocated, &mut written_pointers)?;
        }
        Ok(())
    })();

    if let Err(e) = result {
        warn!(sector, error = %e, "rolling back partial growth");
        // A pre-existing index sector's entries are committed to the cache as
        // they're written, unlike a fresh index sector (released whole below);
        // clear those stale pointers before anything can observe them.
        for &(table_sector, entry_index) in &written_pointers {
            if !newly_allocated.contains(&table_sector) {
                let _ = write_pointer(table, table_sector, entry_index, 0);
            }
        }
        for s in newly_allocated {
            table.allocator.release(s, 1);
        }
        return Err(e);
    }

    disk.length = (new_length as u32).into();
    table.write_disk_inode(sector, disk)?;
    Ok(())
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        let should_deallocate = {
            let mut reg = self.state.registration.lock().unwrap();
            reg.open_count -= 1;
            reg.open_count == 0 && reg.removed
        };

        if should_deallocate {
            if let Ok(disk) = self.table.read_disk_inode(self.sector) {
                debug!(sector = self.sector, "last close of removed inode, deallocating");
                self.deallocate(&disk);
            }
        }

        if self.state.registration.lock().unwrap().open_count == 0 {
            self.table.states.lock().unwrap().remove(&self.sector);
        }
    }
}
