//! Kernel singletons and boot.
//!
//! Every global lives here behind an explicit init step that takes its
//! dependencies, in leaf-first order: allocator, console, block cache,
//! log (with crash recovery), inode table, then the scheduler and the
//! root process. Nothing constructs itself on first use behind the
//! kernel's back.

use spin::Once;

use crate::bio::{Bcache, BlockDevice};
use crate::console::{self, CharDevice};
use crate::file::FTable;
use crate::fs::{InodeTree, Log, SuperBlock};
use crate::kalloc;
use crate::param::PAGE_SIZE;
use crate::proc::{Pid, ProcTree};
use crate::sched;
use crate::socket::PortTable;
use crate::vm::{Prot, PteFlags, Section, SectionKind};

static SUPERBLOCK: Once<SuperBlock> = Once::new();
static BCACHE: Once<Bcache> = Once::new();
static LOG: Once<Log> = Once::new();
static ITABLE: Once<InodeTree> = Once::new();
static FTABLE: FTable = FTable::new();
static PORTS: PortTable = PortTable::new();
static PTREE: ProcTree = ProcTree::new();

pub fn superblock() -> &'static SuperBlock {
    SUPERBLOCK.get().expect("kernel: file system not mounted")
}

pub fn bcache() -> &'static Bcache {
    BCACHE.get().expect("kernel: file system not mounted")
}

pub fn log() -> &'static Log {
    LOG.get().expect("kernel: file system not mounted")
}

pub fn itable() -> &'static InodeTree {
    ITABLE.get().expect("kernel: file system not mounted")
}

pub fn ftable() -> &'static FTable {
    &FTABLE
}

pub fn ports() -> &'static PortTable {
    &PORTS
}

pub fn ptree() -> &'static ProcTree {
    &PTREE
}

/// Brings the kernel up on the boot core and never returns.
///
/// # Safety
///
/// * `pool` must be the page-aligned RAM range `[end_of_kernel, PHYSTOP)`,
///   owned by the kernel.
/// * `uart` and `disk` must be fully initialized drivers.
/// * Must be called exactly once, before interrupts are enabled.
pub unsafe fn kernel_init(
    pool: (usize, usize),
    uart: &'static dyn CharDevice,
    disk: &'static dyn BlockDevice,
) -> ! {
    // SAFETY: the caller hands us the pool.
    unsafe { kalloc::init(pool.0, pool.1) };
    console::init(uart);
    kprintln!("kernel: booting");

    let sb = SUPERBLOCK.call_once(|| SuperBlock::load(disk));
    let cache = BCACHE.call_once(|| Bcache::new(disk));
    let log = LOG.call_once(|| Log::new(sb, cache));
    ITABLE.call_once(|| InodeTree::new(sb, cache, log));
    kprintln!(
        "kernel: mounted fs, {} blocks, {} inodes",
        sb.num_blocks,
        sb.num_inodes
    );

    // SAFETY: once per core, before scheduling.
    unsafe { sched::init_this_cpu().expect("kernel: no memory for the idle task") };

    let root = PTREE
        .create(Some(itable().root()))
        .expect("kernel: no memory for the root process");
    PTREE.install_root(&root);
    PTREE.start(&root, root_entry, 0);

    sched::idle_loop()
}

/// Secondary cores land here once the boot core has finished
/// `kernel_init`.
///
/// # Safety
///
/// Once per core, after `kernel_init` completed.
pub unsafe fn secondary_init() -> ! {
    // SAFETY: per the contract.
    unsafe { sched::init_this_cpu().expect("kernel: no memory for the idle task") };
    sched::idle_loop()
}

/// The root process: starts the first user program, then spends its life
/// reaping orphans.
extern "C" fn root_entry(_: usize) -> ! {
    kprintln!("kernel: root process running");
    spawn_init().expect("kernel: cannot start the init process");
    loop {
        if PTREE.wait().is_err() {
            sched::yield_now();
        }
    }
}

const INIT_CODE_BASE: usize = 0x40_0000;
const INIT_STACK_TOP: usize = 0x80_0000;

/// The bootstrap user program, hand-assembled (`od -t xC` of initcode):
///
/// ```text
/// adr  x0, path      // x0 = "/init"
/// mov  x1, xzr       // argv = NULL
/// mov  x2, xzr       // envp = NULL
/// mov  x8, #221      // execve
/// svc  #0
/// b    .             // not reached
/// path: .asciz "/init"
/// ```
#[rustfmt::skip]
static INIT_CODE: [u8; 32] = [
    0xc0, 0x00, 0x00, 0x10, // adr x0, .+24
    0xe1, 0x03, 0x1f, 0xaa, // mov x1, xzr
    0xe2, 0x03, 0x1f, 0xaa, // mov x2, xzr
    0xa8, 0x1b, 0x80, 0xd2, // mov x8, #221
    0x01, 0x00, 0x00, 0xd4, // svc #0
    0x00, 0x00, 0x00, 0x14, // b .
    b'/', b'i', b'n', b'i', b't', 0, 0, 0,
];

/// Maps the embedded bootstrap code into a fresh process and starts it.
fn spawn_init() -> Result<Pid, ()> {
    let p = PTREE.create(Some(itable().root()))?;
    // SAFETY: the process is unstarted; we are its only user.
    let data = unsafe { p.data() };

    data.pgdir.add_section(Section {
        kind: SectionKind::Text,
        begin: INIT_CODE_BASE,
        end: INIT_CODE_BASE + INIT_CODE.len(),
        fp: None,
        offset: 0,
        length: 0,
        prot: Prot::READ | Prot::EXEC,
    });
    let code_page = kalloc::alloc_page().ok_or(())?;
    // SAFETY: fresh page, exclusively ours.
    unsafe {
        core::ptr::write_bytes(code_page as *mut u8, 0, PAGE_SIZE);
        core::ptr::copy_nonoverlapping(
            INIT_CODE.as_ptr(),
            code_page as *mut u8,
            INIT_CODE.len(),
        );
    }
    data.pgdir.map_page(INIT_CODE_BASE, code_page, PteFlags::user_ro());

    data.pgdir.add_section(Section {
        kind: SectionKind::UserStack,
        begin: INIT_STACK_TOP - PAGE_SIZE,
        end: INIT_STACK_TOP,
        fp: None,
        offset: 0,
        length: 0,
        prot: Prot::READ | Prot::WRITE,
    });
    let stack_page = kalloc::alloc_page().ok_or(())?;
    // SAFETY: as above.
    unsafe { core::ptr::write_bytes(stack_page as *mut u8, 0, PAGE_SIZE) };
    data.pgdir
        .map_page(INIT_STACK_TOP - PAGE_SIZE, stack_page, PteFlags::user_data());

    // SAFETY: the trap frame belongs to this unstarted process.
    unsafe {
        let uc = data.kstack.ucontext();
        (*uc).elr = INIT_CODE_BASE as u64;
        (*uc).sp = INIT_STACK_TOP as u64;
        (*uc).spsr = 0;
    }
    Ok(PTREE.start_user(&p))
}
