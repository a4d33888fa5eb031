//! Armv8-A backend.
//!
//! The context switch and the user-mode return path are assembly routines
//! owned by the trap code; everything else is register programming through
//! `cortex-a`.

use core::arch::asm;

use cortex_a::registers::*;
use tock_registers::interfaces::{Readable, Writeable};

use super::interface::Arch;
use crate::param::PAGE_SIZE;
use crate::proc::KernelContext;

extern "C" {
    /// Saves callee-saved registers into `*old` and restores `new`.
    fn swtch(new: *mut KernelContext, old: *mut *mut KernelContext);

    /// Restores the user context at the top of this kernel stack and erets.
    fn user_trap_return() -> !;
}

pub struct Armv8;

impl Arch for Armv8 {
    const KSPACE_BASE: usize = 0xffff_0000_0000_0000;
    const PHYS_BASE: usize = 0x8_0000;
    const PHYS_TOP: usize = 0x3f00_0000;
    const MAX_FRAMES: usize = (Self::PHYS_TOP - Self::PHYS_BASE) / PAGE_SIZE;

    fn cpu_id() -> usize {
        (MPIDR_EL1.get() & 0xff) as usize
    }

    fn intr_get() -> bool {
        !DAIF.is_set(DAIF::I)
    }

    unsafe fn intr_off() {
        unsafe { asm!("msr daifset, #2", options(nomem, nostack)) };
    }

    unsafe fn intr_on() {
        unsafe { asm!("msr daifclr, #2", options(nomem, nostack)) };
    }

    unsafe fn set_user_page_table(root: usize) {
        TTBR0_EL1.set_baddr(root as u64);
        // SAFETY: an ISB has no memory effects visible to Rust code.
        unsafe { cortex_a::asm::barrier::isb(cortex_a::asm::barrier::SY) };
        Self::tlb_flush();
    }

    fn tlb_flush() {
        // SAFETY: invalidating TLB entries has no memory effects visible to
        // Rust code.
        unsafe {
            asm!(
                "dsb ishst",
                "tlbi vmalle1is",
                "dsb ish",
                "isb",
                options(nostack),
            )
        };
    }

    fn set_cpu_timer(ms: u64) {
        let freq = CNTFRQ_EL0.get();
        CNTP_TVAL_EL0.set(freq / 1000 * ms);
        CNTP_CTL_EL0.write(CNTP_CTL_EL0::ENABLE::SET + CNTP_CTL_EL0::IMASK::CLEAR);
    }

    unsafe fn context_switch(new: *mut KernelContext, old: *mut *mut KernelContext) {
        unsafe { swtch(new, old) }
    }

    unsafe fn trap_return() -> ! {
        unsafe { user_trap_return() }
    }

    fn wait_for_interrupt() {
        cortex_a::asm::wfi();
    }
}
