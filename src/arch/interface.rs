//! The interface the kernel consumes from the architecture layer.
//!
//! Everything behind this trait is provided by out-of-tree boot and trap
//! code: the kernel never programs MMU registers or timer hardware
//! directly.

use crate::proc::KernelContext;

pub trait Arch {
    /// Base of the kernel's direct mapping of physical memory.
    const KSPACE_BASE: usize;

    /// First byte of RAM handed to the page allocator at boot.
    const PHYS_BASE: usize;

    /// One past the last byte of RAM handed to the page allocator.
    const PHYS_TOP: usize;

    /// Upper bound on pages the frame table must describe.
    const MAX_FRAMES: usize;

    /// Which core is this?
    fn cpu_id() -> usize;

    /// Are device interrupts enabled on this core?
    fn intr_get() -> bool;

    /// # Safety
    ///
    /// Must be paired with `intr_on`; see `cpu::push_off`.
    unsafe fn intr_off();

    /// # Safety
    ///
    /// Interrupt handlers must have been configured by the boot code.
    unsafe fn intr_on();

    /// Install `root` (a physical address) as the user page table root.
    ///
    /// # Safety
    ///
    /// `root` must point at a valid top-level page table, or be the
    /// all-invalid table.
    unsafe fn set_user_page_table(root: usize);

    /// Invalidate all TLB entries for the current user address space.
    fn tlb_flush();

    /// Arm this core's one-shot scheduler timer `ms` milliseconds from now.
    fn set_cpu_timer(ms: u64);

    /// Save the current kernel context into `*old` and resume `new`.
    ///
    /// # Safety
    ///
    /// Both pointers must reference valid `KernelContext` storage on live
    /// kernel stacks. The caller must hold the scheduler lock.
    unsafe fn context_switch(new: *mut KernelContext, old: *mut *mut KernelContext);

    /// Restore the current process's user context and drop to user mode.
    ///
    /// # Safety
    ///
    /// The current process must have a fully initialized user context and
    /// an attached page table.
    unsafe fn trap_return() -> !;

    /// Park the core until the next interrupt.
    fn wait_for_interrupt();
}
