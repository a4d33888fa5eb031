//! Trap glue.
//!
//! The architecture's vector code saves the user context, decodes the
//! exception class, and calls one of these handlers. Everything here runs
//! on the faulting process's kernel stack.

use crate::cpu;
use crate::kernel;
use crate::proc::UserContext;
use crate::sched;
use crate::syscall;
use crate::vm::FaultKind;

/// Data-abort syndrome: the fault status class bits.
const ISS_TYPE_MASK: u64 = 0x3c;
const ISS_TRANSLATION: u64 = 0x4;
const ISS_ACCESS: u64 = 0x8;
const ISS_PERMISSION: u64 = 0xc;

pub fn handle_syscall(ctx: &mut UserContext) {
    syscall::syscall_entry(ctx);
    check_killed();
}

/// Serves a user page fault. A fault the address space cannot satisfy
/// terminates the process; it never brings the kernel down.
pub fn handle_page_fault(iss: u64, fault_addr: usize) {
    let p = cpu::current().expect("page fault outside a process");
    let kind = match iss & ISS_TYPE_MASK {
        ISS_TRANSLATION => FaultKind::Translation,
        ISS_PERMISSION => FaultKind::Permission,
        ISS_ACCESS => FaultKind::Access,
        _ => kernel::ptree().exit(-1),
    };
    // SAFETY: we are the running owner.
    let pd = unsafe { &p.data().pgdir };
    if pd.handle_fault(fault_addr, kind).is_err() {
        kprintln!("pid {}: fatal page fault at {:#x}", p.pid, fault_addr);
        kernel::ptree().exit(-1);
    }
    check_killed();
}

pub fn handle_timer() {
    sched::clock_tick();
    check_killed();
}

pub fn handle_uart() {
    if let Some(console) = crate::console::console() {
        console.intr();
    }
}

/// A killed process unwinds into exit instead of returning to user
/// space.
pub fn check_killed() {
    if let Some(p) = cpu::current() {
        if !p.idle && p.killed() {
            kernel::ptree().exit(-1);
        }
    }
}
