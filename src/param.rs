/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Maximum number of CPUs.
pub const NCPU: usize = 4;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Number of allocatable pids. One page of bitmap.
pub const NPID: usize = PAGE_SIZE * 8;

/// Disk block size in bytes, the unit of I/O and of journaling.
pub const BLOCK_SIZE: usize = 512;

/// Max data blocks in the on-disk log area.
pub const LOG_MAX_SIZE: usize = 64;

/// Max number of blocks a single atomic operation may sync.
pub const OP_MAX_NUM_BLOCKS: usize = 10;

/// Releasing a block starts evicting once the cache holds more entries
/// than this.
pub const EVICTION_THRESHOLD: usize = 20;

/// Direct block slots in an on-disk inode.
pub const INODE_NUM_DIRECT: usize = 12;

/// Block number slots in an indirect block.
pub const INODE_NUM_INDIRECT: usize = BLOCK_SIZE / 4;

/// Largest representable file.
pub const INODE_MAX_BLOCKS: usize = INODE_NUM_DIRECT + INODE_NUM_INDIRECT;
pub const INODE_MAX_BYTES: usize = INODE_MAX_BLOCKS * BLOCK_SIZE;

/// Maximum length of a file name component.
pub const NAME_MAX: usize = 14;

/// Inode number of the root directory.
pub const ROOT_INODE_NO: u32 = 1;

/// Number of MLFQ levels.
pub const NLEVEL: usize = 3;

/// Time slice granted at MLFQ level `i`, in milliseconds.
pub const fn time_slice_ms(level: usize) -> u64 {
    5 * (level as u64 + 1)
}

/// Every runnable process is promoted back to level 0 this often.
pub const TIME_TO_LEVEL_UP_MS: u64 = 1000;

/// Scheduler clock granularity.
pub const SCHED_TICK_MS: u64 = 5;

/// Pipe ring capacity in bytes.
pub const PIPE_SIZE: usize = 512;

/// Socket receive ring capacity in bytes (two pages).
pub const SOCKET_BUF_SIZE: usize = 2 * PAGE_SIZE;

/// Console input ring capacity in bytes.
pub const INPUT_BUF: usize = 128;

/// Console device major number.
pub const CONSOLE_MAJOR: u16 = 1;

/// Eagerly allocated user stack size.
pub const USER_STACK_SIZE: usize = 8 * PAGE_SIZE;

/// Highest user stack address (exclusive).
pub const TOP_USER_STACK: usize = 0x8000_0000_0000;

/// Bytes kept free at the very top of a fresh user stack.
pub const STACK_RESERVE: usize = 512;

/// Max number of exec arguments (argv plus envp each).
pub const MAX_ARGS: usize = 64;
