//! Block cache.
//!
//! The block cache keeps copies of recently used disk blocks in memory,
//! cutting down disk traffic and giving every block a single
//! synchronization point. Interface:
//!
//! * `acquire` returns a `Buf` holding the block's sleep lock, with the
//!   contents read in.
//! * Dropping the `Buf` releases the block and may evict cold entries.
//! * Only one holder can use a block at a time; do not keep buffers longer
//!   than necessary.
//!
//! Cached blocks sit in one list ordered most recently used first. A
//! release walks the list tail and frees entries with no handles and no
//! transaction pin until the cache is back below `EVICTION_THRESHOLD`, so
//! the pinned working set of the log never shrinks.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::lock::{SleepLock, SpinLock};
use crate::param::{BLOCK_SIZE, EVICTION_THRESHOLD};

/// What the block device driver exposes to the kernel. Fixed 512-byte
/// blocks; I/O is synchronous and assumed not to fail (the driver panics on
/// hardware errors).
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_no: u32, buf: &mut [u8; BLOCK_SIZE]);
    fn write_block(&self, block_no: u32, buf: &[u8; BLOCK_SIZE]);
}

/// A block-sized byte buffer, aligned so on-disk records (which hold
/// `u32`s) can be viewed in place.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct AlignedBlock(pub [u8; BLOCK_SIZE]);

impl AlignedBlock {
    pub const fn zeroed() -> Self {
        Self([0; BLOCK_SIZE])
    }
}

struct BlockData {
    /// Has the block been read from disk?
    valid: bool,
    data: AlignedBlock,
}

pub struct Block {
    pub block_no: u32,

    /// In the running transaction's write set; never evicted while set.
    pinned: AtomicBool,

    inner: SleepLock<BlockData>,
}

impl Block {
    fn new(block_no: u32) -> Self {
        Self {
            block_no,
            pinned: AtomicBool::new(false),
            inner: SleepLock::new(
                "block",
                BlockData {
                    valid: false,
                    data: AlignedBlock::zeroed(),
                },
            ),
        }
    }

    pub(crate) fn pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub(crate) fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    /// Copies the cached contents out, taking the sleep lock for the
    /// duration. Used by the commit path to snapshot blocks it does not
    /// otherwise hold.
    pub(crate) fn snapshot(&self) -> [u8; BLOCK_SIZE] {
        let guard = self.inner.lock_unalertable();
        guard.data.0
    }
}

pub struct Bcache {
    device: &'static dyn BlockDevice,

    /// Cached blocks, most recently used first.
    shared: SpinLock<Vec<Arc<Block>>>,
}

impl Bcache {
    pub fn new(device: &'static dyn BlockDevice) -> Self {
        Self {
            device,
            shared: SpinLock::new("bcache", Vec::new()),
        }
    }

    pub fn device(&self) -> &'static dyn BlockDevice {
        self.device
    }

    pub fn num_cached(&self) -> usize {
        self.shared.lock().len()
    }

    /// Returns the block in the acquired state: sleep lock held, contents
    /// valid. Fails only if the process is killed while waiting for the
    /// lock.
    pub fn acquire(&self, block_no: u32) -> Result<Buf<'_>, ()> {
        let block = {
            let mut list = self.shared.lock();
            match list.iter().position(|b| b.block_no == block_no) {
                Some(pos) => {
                    // Cache hit: promote to the head.
                    let b = list.remove(pos);
                    list.insert(0, Arc::clone(&b));
                    b
                }
                None => {
                    let b = Arc::new(Block::new(block_no));
                    list.insert(0, Arc::clone(&b));
                    b
                }
            }
        };

        {
            let mut guard = block.inner.lock()?;
            if !guard.valid {
                self.device.read_block(block_no, &mut guard.data.0);
                guard.valid = true;
            }
            // The lock stays held; `Buf` releases it on drop.
            mem::forget(guard);
        }
        Ok(Buf { cache: self, block })
    }

    /// Write-through to disk, for bootstrap writes outside any
    /// transaction.
    pub fn write_through(&self, buf: &Buf<'_>) {
        self.device.write_block(buf.block_no(), buf.data());
    }

    fn evict(&self) {
        let mut list = self.shared.lock();
        let mut i = list.len();
        while i > 0 && list.len() > EVICTION_THRESHOLD {
            i -= 1;
            let b = &list[i];
            if Arc::strong_count(b) == 1 && !b.pinned() {
                list.remove(i);
            }
        }
    }
}

/// An acquired cache block. The sleep lock is held for the lifetime of the
/// `Buf`; dropping it releases the block and runs an eviction pass.
pub struct Buf<'s> {
    cache: &'s Bcache,
    block: Arc<Block>,
}

impl Buf<'_> {
    pub fn block_no(&self) -> u32 {
        self.block.block_no
    }

    pub fn data(&self) -> &[u8; BLOCK_SIZE] {
        // SAFETY: the sleep lock is held by this Buf.
        unsafe { &(*self.block.inner.get_mut_raw()).data.0 }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        // SAFETY: the sleep lock is held and `&mut self` is exclusive.
        unsafe { &mut (*self.block.inner.get_mut_raw()).data.0 }
    }

    pub(crate) fn pin(&self) {
        self.block.pinned.store(true, Ordering::Release);
    }

    pub(crate) fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // SAFETY: acquire() left the lock held.
        unsafe { self.block.inner.unlock() };
        self.cache.evict();
    }
}

/// In-memory block device for host tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;
    use std::vec::Vec as StdVec;

    pub struct MemDisk {
        blocks: Mutex<StdVec<[u8; BLOCK_SIZE]>>,
        trace: Mutex<Option<StdVec<(u32, [u8; BLOCK_SIZE])>>>,
    }

    impl MemDisk {
        pub fn new(nblocks: usize) -> Self {
            Self {
                blocks: Mutex::new(vec![[0; BLOCK_SIZE]; nblocks]),
                trace: Mutex::new(None),
            }
        }

        pub fn leak(nblocks: usize) -> &'static Self {
            Box::leak(Box::new(Self::new(nblocks)))
        }

        pub fn read_raw(&self, no: u32) -> [u8; BLOCK_SIZE] {
            self.blocks.lock().unwrap()[no as usize]
        }

        pub fn write_raw(&self, no: u32, data: &[u8; BLOCK_SIZE]) {
            self.blocks.lock().unwrap()[no as usize] = *data;
        }

        pub fn snapshot(&self) -> StdVec<[u8; BLOCK_SIZE]> {
            self.blocks.lock().unwrap().clone()
        }

        pub fn restore(&self, image: &[[u8; BLOCK_SIZE]]) {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.clear();
            blocks.extend_from_slice(image);
        }

        /// Start recording every write; `take_trace` stops and returns
        /// them in order.
        pub fn start_trace(&self) {
            *self.trace.lock().unwrap() = Some(StdVec::new());
        }

        pub fn take_trace(&self) -> StdVec<(u32, [u8; BLOCK_SIZE])> {
            self.trace.lock().unwrap().take().unwrap_or_default()
        }
    }

    impl BlockDevice for MemDisk {
        fn read_block(&self, block_no: u32, buf: &mut [u8; BLOCK_SIZE]) {
            *buf = self.blocks.lock().unwrap()[block_no as usize];
        }

        fn write_block(&self, block_no: u32, buf: &[u8; BLOCK_SIZE]) {
            self.blocks.lock().unwrap()[block_no as usize] = *buf;
            if let Some(trace) = self.trace.lock().unwrap().as_mut() {
                trace.push((block_no, *buf));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemDisk;
    use super::*;

    #[test]
    fn acquire_reads_once_and_caches() {
        let disk = MemDisk::leak(32);
        let mut block = [0u8; BLOCK_SIZE];
        block[0] = 0xab;
        disk.write_raw(7, &block);

        let cache = Bcache::new(disk);
        {
            let buf = cache.acquire(7).unwrap();
            assert_eq!(buf.data()[0], 0xab);
        }
        // Mutating the disk underneath is not observed: the cache serves
        // the hit.
        disk.write_raw(7, &[0; BLOCK_SIZE]);
        let buf = cache.acquire(7).unwrap();
        assert_eq!(buf.data()[0], 0xab);
        assert_eq!(cache.num_cached(), 1);
    }

    #[test]
    fn dirty_data_survives_reacquire() {
        let disk = MemDisk::leak(32);
        let cache = Bcache::new(disk);
        {
            let mut buf = cache.acquire(3).unwrap();
            buf.data_mut()[10] = 0x5a;
        }
        let buf = cache.acquire(3).unwrap();
        assert_eq!(buf.data()[10], 0x5a);
        // Not written through until someone syncs it.
        assert_eq!(disk.read_raw(3)[10], 0);
    }

    #[test]
    fn release_evicts_down_to_threshold() {
        let disk = MemDisk::leak(256);
        let cache = Bcache::new(disk);
        for no in 0..(EVICTION_THRESHOLD as u32 + 10) {
            let _ = cache.acquire(no).unwrap();
        }
        assert!(cache.num_cached() <= EVICTION_THRESHOLD + 1);
    }

    #[test]
    fn pinned_blocks_survive_eviction() {
        let disk = MemDisk::leak(256);
        let cache = Bcache::new(disk);
        {
            let buf = cache.acquire(0).unwrap();
            buf.pin();
        }
        for no in 1..(EVICTION_THRESHOLD as u32 + 16) {
            let _ = cache.acquire(no).unwrap();
        }
        let list_holds_zero = {
            let buf = cache.acquire(0).unwrap();
            // Still the cached copy: no device read happened in between,
            // so a pinned block stays resident.
            buf.block().pinned()
        };
        assert!(list_holds_zero);
    }

    #[test]
    fn write_through_hits_the_device() {
        let disk = MemDisk::leak(32);
        let cache = Bcache::new(disk);
        let mut buf = cache.acquire(5).unwrap();
        buf.data_mut()[0] = 0x77;
        cache.write_through(&buf);
        assert_eq!(disk.read_raw(5)[0], 0x77);
    }
}
