//! Write-ahead logging.
//!
//! A log transaction bundles the disk updates of the file system calls
//! that are running concurrently; it only commits once none of them is
//! still active, so a commit never writes half of a system call's
//! updates.
//!
//! A system call brackets its updates in `begin_op`/`end_op` and routes
//! every modified block through `Op::sync` instead of writing it to disk.
//! `begin_op` blocks while a commit is in progress or while the log might
//! run out of space. Syncing records the block in the in-memory header and
//! pins it in the cache; nothing reaches disk before the commit.
//!
//! The commit, run by the last `end_op` of the batch:
//!
//! 1. copies each journaled block's cached contents into the log area,
//! 2. persists the header (the commit point),
//! 3. copies the log area back to the home locations,
//! 4. clears the header.
//!
//! Recovery at mount replays steps 3 and 4 from the on-disk header;
//! replay is idempotent. Every `end_op` waits for the batch's commit, so
//! once it returns the operation's writes are durable.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::Cell;
use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, LayoutVerified};

use super::superblock::{SuperBlock, BITS_PER_BLOCK};
use crate::bio::{AlignedBlock, Bcache, Block, BlockDevice, Buf};
use crate::lock::SpinLock;
use crate::param::{BLOCK_SIZE, LOG_MAX_SIZE, OP_MAX_NUM_BLOCKS};
use crate::sem::Semaphore;

/// On-disk log header. `num_blocks == 0` means the log is empty and any
/// half-written commit is discarded at mount.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    num_blocks: u32,
    block_no: [u32; LOG_MAX_SIZE],
}

const_assert!(mem::size_of::<LogHeader>() <= BLOCK_SIZE);

pub struct Log {
    sb: &'static SuperBlock,
    cache: &'static Bcache,
    state: SpinLock<LogState>,

    /// Posted when log space frees up or a commit finishes; `begin_op`
    /// waits here.
    space: Semaphore,

    /// Broadcast after each commit; non-final `end_op`s wait here for
    /// durability.
    checkpointed: Semaphore,
}

struct LogState {
    /// At most one commit at a time.
    committing: bool,

    /// Log space reserved by running operations.
    used: usize,

    /// How many operations are executing.
    outstanding: usize,

    /// Completed commits; waiters compare against it to spot their own.
    commit_seq: u64,

    /// The running batch's write set, pinned in the cache.
    bufs: ArrayVec<Arc<Block>, LOG_MAX_SIZE>,
}

impl Log {
    /// Runs crash recovery against the on-disk header, then returns an
    /// empty log.
    pub fn new(sb: &'static SuperBlock, cache: &'static Bcache) -> Self {
        Self::recover(sb, cache.device());
        Self {
            sb,
            cache,
            state: SpinLock::new(
                "log",
                LogState {
                    committing: false,
                    used: 0,
                    outstanding: 0,
                    commit_seq: 0,
                    bufs: ArrayVec::new(),
                },
            ),
            space: Semaphore::new("log space", 0),
            checkpointed: Semaphore::new("log checkpoint", 0),
        }
    }

    pub fn cache(&self) -> &'static Bcache {
        self.cache
    }

    /// Replays any committed transaction recorded in the on-disk header
    /// and clears it. Idempotent.
    pub fn recover(sb: &SuperBlock, device: &dyn BlockDevice) {
        let mut buf = AlignedBlock::zeroed();
        device.read_block(sb.log_start, &mut buf.0);
        let (header, _) = LayoutVerified::<_, LogHeader>::new_from_prefix(&buf.0[..])
            .expect("log: short header block");

        let mut data = [0u8; BLOCK_SIZE];
        for i in 0..header.num_blocks {
            device.read_block(sb.log_start + 1 + i, &mut data);
            device.write_block(header.block_no[i as usize], &data);
        }

        Self::write_header(sb, device, &[]);
    }

    fn write_header(sb: &SuperBlock, device: &dyn BlockDevice, blocks: &[u32]) {
        let mut header = LogHeader {
            num_blocks: blocks.len() as u32,
            block_no: [0; LOG_MAX_SIZE],
        };
        for (slot, no) in izip!(&mut header.block_no, blocks) {
            *slot = *no;
        }
        let mut buf = AlignedBlock::zeroed();
        buf.0[..mem::size_of::<LogHeader>()].copy_from_slice(header.as_bytes());
        device.write_block(sb.log_start, &buf.0);
    }

    /// Starts an operation, blocking until the log can take another
    /// operation's worth of blocks and no commit is running. Fails if the
    /// process is killed while waiting.
    pub fn begin_op(&'static self) -> Result<Op, ()> {
        loop {
            if let Some(op) = self.try_begin() {
                return Ok(op);
            }
            if !self.space.wait() {
                return Err(());
            }
        }
    }

    /// `begin_op` for cleanup paths that must not be interrupted.
    pub fn begin_op_unalertable(&'static self) -> Op {
        loop {
            if let Some(op) = self.try_begin() {
                return op;
            }
            self.space.wait_unalertable();
        }
    }

    fn try_begin(&'static self) -> Option<Op> {
        let mut state = self.state.lock();
        if state.committing || state.used + OP_MAX_NUM_BLOCKS > LOG_MAX_SIZE {
            return None;
        }
        state.used += OP_MAX_NUM_BLOCKS;
        state.outstanding += 1;
        Some(Op {
            log: self,
            rm: Cell::new(OP_MAX_NUM_BLOCKS),
        })
    }

    fn end_op(&self, rm: usize) {
        let (do_commit, my_seq, bufs) = {
            let mut state = self.state.lock();
            assert!(!state.committing, "end_op: commit already in progress");
            state.outstanding -= 1;
            if state.outstanding == 0 {
                state.committing = true;
                let bufs: Vec<Arc<Block>> = state.bufs.iter().cloned().collect();
                (true, state.commit_seq, bufs)
            } else {
                // Refund the unused budget so begin_op can make progress.
                state.used -= rm;
                (false, state.commit_seq, Vec::new())
            }
        };

        if do_commit {
            self.commit(&bufs);
            {
                let mut state = self.state.lock();
                for b in state.bufs.drain(..) {
                    b.unpin();
                }
                state.used = 0;
                state.committing = false;
                state.commit_seq += 1;
            }
            self.space.post_all();
            self.checkpointed.post_all();
        } else {
            self.space.post_all();
            // The operation's blocks are not durable until the batch
            // commits; wait for it.
            loop {
                {
                    let state = self.state.lock();
                    if state.commit_seq > my_seq {
                        break;
                    }
                }
                self.checkpointed.wait_unalertable();
            }
        }
    }

    fn commit(&self, bufs: &[Arc<Block>]) {
        if bufs.is_empty() {
            return;
        }
        let device = self.cache.device();
        let start = self.sb.log_start;

        // Copy the journaled blocks' cached contents into the log area.
        let mut nos = [0u32; LOG_MAX_SIZE];
        for (i, b) in bufs.iter().enumerate() {
            let data = b.snapshot();
            device.write_block(start + 1 + i as u32, &data);
            nos[i] = b.block_no;
        }

        // Persist the header: the commit point.
        Self::write_header(self.sb, device, &nos[..bufs.len()]);

        // Install: from the log area to the home locations.
        let mut data = [0u8; BLOCK_SIZE];
        for (i, b) in bufs.iter().enumerate() {
            device.read_block(start + 1 + i as u32, &mut data);
            device.write_block(b.block_no, &data);
        }

        // Discard the transaction.
        Self::write_header(self.sb, device, &[]);
    }
}

/// A running operation's handle: the remaining log budget plus the right
/// to sync blocks. Dropping it ends the operation and, for the last one
/// of the batch, commits.
pub struct Op {
    log: &'static Log,
    rm: Cell<usize>,
}

impl Op {
    pub fn cache(&self) -> &'static Bcache {
        self.log.cache
    }

    pub fn log(&self) -> &'static Log {
        self.log
    }

    /// Journals `buf`'s block: records its number in the in-memory
    /// header, pins it in the cache, and releases it. The data itself is
    /// written at commit. Panics when the operation's budget is
    /// exhausted.
    pub fn sync(&self, buf: Buf<'_>) {
        let mut state = self.log.state.lock();
        if state.bufs.iter().all(|b| b.block_no != buf.block_no()) {
            assert!(self.rm.get() > 0, "sync: operation too large");
            buf.pin();
            state.bufs.push(Arc::clone(buf.block()));
            self.rm.set(self.rm.get() - 1);
        }
        // Already journaled: absorbed, no budget charge.
    }

    /// Allocates a zeroed data block, journaling the bitmap and the
    /// block. Fails when the disk is full or the caller is killed.
    pub fn alloc_block(&self) -> Result<u32, ()> {
        let sb = self.log.sb;
        for i in 0..sb.num_bitmap_blocks() {
            let mut bitmap = self.cache().acquire(sb.bitmap_start + i)?;
            for byte in 0..BLOCK_SIZE {
                if bitmap.data()[byte] == 0xff {
                    continue;
                }
                let mut bno = i * BITS_PER_BLOCK + (byte * 8) as u32;
                let mut mask = 1u8;
                while bitmap.data()[byte] & mask != 0 {
                    mask <<= 1;
                    bno += 1;
                }
                if bno >= sb.num_blocks {
                    // Trailing bits of the last bitmap byte.
                    return Err(());
                }
                bitmap.data_mut()[byte] |= mask;
                self.sync(bitmap);

                let mut data = self.cache().acquire(bno)?;
                data.data_mut().fill(0);
                self.sync(data);
                return Ok(bno);
            }
        }
        Err(())
    }

    /// Clears `bno`'s bitmap bit, journaling the bitmap block.
    pub fn free_block(&self, bno: u32) -> Result<(), ()> {
        let sb = self.log.sb;
        let mut bitmap = self.cache().acquire(sb.bitmap_block(bno))?;
        let bit = (bno % BITS_PER_BLOCK) as usize;
        let mask = 1u8 << (bit % 8);
        assert!(
            bitmap.data()[bit / 8] & mask != 0,
            "free_block: block already free"
        );
        bitmap.data_mut()[bit / 8] &= !mask;
        self.sync(bitmap);
        Ok(())
    }
}

impl Drop for Op {
    fn drop(&mut self) {
        self.log.end_op(self.rm.get());
    }
}
