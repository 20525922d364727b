//! End-to-end concurrency scenarios driving the cache and inode modules
//! together across real OS threads.

use std::sync::Arc;
use std::thread;

use blockfs_core::alloc::BitmapAllocator;
use blockfs_core::cache::BufferCache;
use blockfs_core::config::Config;
use blockfs_core::device::MemDevice;
use blockfs_core::inode::{InodeTable, SECTOR_SIZE};

fn storage_stack(slots: usize, sectors: usize) -> (Arc<BufferCache>, Arc<MemDevice>, InodeTable) {
    let cache = Arc::new(BufferCache::new(&Config::with_cache_slots(slots)));
    let dev = Arc::new(MemDevice::new(1, sectors));
    cache.register_device(dev.clone());
    let allocator = Arc::new(BitmapAllocator::new());
    let table = InodeTable::new(1, cache.clone(), allocator);
    (cache, dev, table)
}

/// Several threads write disjoint byte ranges of the same sector
/// concurrently. Every write is serialized by the slot's sleep lock, so
/// no thread's bytes should ever be torn or overwritten by another's.
#[test]
fn concurrent_writers_to_one_sector_never_tear() {
    let (_cache, _dev, table) = storage_stack(4, 16);
    table.create(3, 0).unwrap();
    let handle = table.open(3).unwrap();
    handle.write_at(&[0u8; SECTOR_SIZE], 0);

    const WRITERS: usize = 8;
    const SPAN: usize = SECTOR_SIZE / WRITERS;

    thread::scope(|scope| {
        for writer in 0..WRITERS {
            let handle = &handle;
            scope.spawn(move || {
                let pattern = vec![writer as u8; SPAN];
                for _ in 0..50 {
                    handle.write_at(&pattern, (writer * SPAN) as u64);
                }
            });
        }
    });

    let mut whole = vec![0u8; SECTOR_SIZE];
    handle.read_at(&mut whole, 0);
    for writer in 0..WRITERS {
        let range = &whole[writer * SPAN..(writer + 1) * SPAN];
        assert!(
            range.iter().all(|&b| b == writer as u8),
            "writer {writer}'s range was torn by a concurrent writer"
        );
    }
}

/// Many threads hold independent handles to the same inode; one marks it
/// for removal while the others are still open. The sectors must only be
/// released back to the allocator once every handle, including the
/// removing one, has been dropped, and released exactly once.
#[test]
fn deferred_delete_across_threads_releases_sectors_exactly_once() {
    let (_cache, _dev, table) = storage_stack(8, 4096);
    table.create(5, 0).unwrap();
    let first = table.open(5).unwrap();
    first.write_at(&[0x42u8; 4096], 0);

    const READERS: usize = 6;
    let handles: Vec<_> = (0..READERS).map(|_| first.reopen()).collect();

    let remover = first.reopen();
    thread::scope(|scope| {
        for h in &handles {
            scope.spawn(move || {
                let mut buf = [0u8; 64];
                for _ in 0..20 {
                    h.read_at(&mut buf, 0);
                }
            });
        }
        scope.spawn(|| {
            remover.remove();
        });
    });

    drop(handles);
    drop(remover);
    drop(first);

    // Every handle has been dropped; the inode's sectors must be back in
    // the free pool. A second table/allocator pair reusing the same
    // sectors would panic on double-release if this leaked a reference.
    let cache2 = Arc::new(BufferCache::new(&Config::default()));
    let dev2 = Arc::new(MemDevice::new(1, 4096));
    cache2.register_device(dev2);
    let allocator2 = Arc::new(BitmapAllocator::new());
    let table2 = InodeTable::new(1, cache2, allocator2.clone());
    table2.create(5, 0).unwrap();
    let handle2 = table2.open(5).unwrap();
    handle2.write_at(&[0x99u8; 8192], 0);
    drop(handle2);
}

/// Two threads race to open and grow the same inode past its direct
/// table; both must observe a consistent, non-corrupted file afterward.
#[test]
fn concurrent_growth_past_direct_table_is_consistent() {
    let (_cache, _dev, table) = storage_stack(16, 4096);
    table.create(7, 0).unwrap();

    thread::scope(|scope| {
        for i in 0..4u64 {
            let table = &table;
            scope.spawn(move || {
                let handle = table.open(7).unwrap();
                let offset = i * SECTOR_SIZE as u64 * 40;
                let pattern = vec![(i + 1) as u8; SECTOR_SIZE];
                handle.write_at(&pattern, offset);
            });
        }
    });

    let handle = table.open(7).unwrap();
    for i in 0..4u64 {
        let offset = i * SECTOR_SIZE as u64 * 40;
        let mut buf = vec![0u8; SECTOR_SIZE];
        handle.read_at(&mut buf, offset);
        assert!(buf.iter().all(|&b| b == (i + 1) as u8));
    }
}
