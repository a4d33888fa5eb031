//! Host stand-in for the architecture layer.
//!
//! Selected for every non-aarch64 target and for `cargo test`. Physical and
//! kernel addresses coincide, interrupts do not exist, and the context
//! switch is unreachable (nothing on a host ever enters the scheduler).

use super::interface::Arch;
use crate::proc::KernelContext;

pub struct Host;

impl Arch for Host {
    const KSPACE_BASE: usize = 0;
    const PHYS_BASE: usize = 0;
    const PHYS_TOP: usize = 0;
    const MAX_FRAMES: usize = 8192;

    fn cpu_id() -> usize {
        0
    }

    fn intr_get() -> bool {
        false
    }

    unsafe fn intr_off() {}

    unsafe fn intr_on() {}

    unsafe fn set_user_page_table(_root: usize) {}

    fn tlb_flush() {}

    fn set_cpu_timer(_ms: u64) {}

    unsafe fn context_switch(_new: *mut KernelContext, _old: *mut *mut KernelContext) {
        unimplemented!("host stub has no context switch")
    }

    unsafe fn trap_return() -> ! {
        unimplemented!("host stub has no user mode")
    }

    fn wait_for_interrupt() {
        core::hint::spin_loop();
    }
}
