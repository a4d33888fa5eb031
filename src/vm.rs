//! Virtual memory.
//!
//! Every process owns a `Pgdir`: the root of a 4-level page table plus a
//! list of sections, each a contiguous virtual range with a kind that
//! decides how faults on it are served:
//!
//! * `Text` — read-only, file-backed; the whole section is loaded on the
//!   first fault and the backing file dropped.
//! * `Data` — read/write, populated eagerly at exec; whole-page BSS tails
//!   map the shared zero page copy-on-write.
//! * `Heap` — anonymous, grown and shrunk by `sbrk`, demand-zero.
//! * `UserStack` — anonymous, populated eagerly at exec.
//! * `MmapShared`/`MmapPrivate` — file-backed mappings; shared writes are
//!   flushed back on unmap, private writes never reach the file.
//!
//! A fault outside every section, or against a section's protection, is
//! an error the trap layer turns into `exit(-1)`.
//!
//! The section list and the tables hang off a per-pgdir spinlock. Disk
//! I/O for file-backed faults and unmap flushes happens with the lock
//! dropped; only the owning process faults on or remaps its own address
//! space, so the section under work cannot change in between.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;

use bitflags::bitflags;

use crate::addr::{k2p, p2k, page_base, page_offset, va_index};
use crate::arch::{Arch, TargetArch};
use crate::file::File;
use crate::kalloc;
use crate::lock::SpinLock;
use crate::param::PAGE_SIZE;

bitflags! {
    /// Leaf page table entry bits (Armv8 stage 1, 4 KiB granule).
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        /// Level-3 descriptors are pages, not blocks.
        const PAGE = 1 << 1;
        /// Normal-memory attribute index.
        const NORMAL = 1 << 2;
        /// EL0 accessible.
        const USER = 1 << 6;
        /// Write-protected (AP[2]).
        const RO = 1 << 7;
        /// Inner shareable.
        const SHARED = 3 << 8;
        /// Access flag, set so the hardware never faults to set it.
        const ACCESSED = 1 << 10;
    }
}

impl PteFlags {
    /// A user-accessible, writable normal page.
    pub fn user_data() -> Self {
        Self::VALID | Self::PAGE | Self::NORMAL | Self::USER | Self::SHARED | Self::ACCESSED
    }

    /// A user-accessible read-only page.
    pub fn user_ro() -> Self {
        Self::user_data() | Self::RO
    }
}

const PTE_TABLE: u64 = 0b11;
const PTE_ADDR_MASK: u64 = 0x0000_ffff_ffff_f000;

fn pte_frame_ka(pte: u64) -> usize {
    p2k((pte & PTE_ADDR_MASK) as usize)
}

fn pte_valid(pte: u64) -> bool {
    pte & PteFlags::VALID.bits() != 0
}

fn pte_writable(pte: u64) -> bool {
    pte_valid(pte) && pte & PteFlags::RO.bits() == 0
}

fn alloc_zeroed_page() -> Result<usize, ()> {
    let ka = kalloc::alloc_page().ok_or(())?;
    // SAFETY: the fresh page is exclusively ours.
    unsafe { core::ptr::write_bytes(ka as *mut u8, 0, PAGE_SIZE) };
    Ok(ka)
}

/// The hardware walk, rooted at one kernel-owned page per table level.
struct PageTable {
    /// Kernel address of the root page; 0 after release.
    root: usize,
}

impl PageTable {
    fn new() -> Result<Self, ()> {
        Ok(Self {
            root: alloc_zeroed_page()?,
        })
    }

    /// Pointer to the leaf entry for `va`, allocating interior tables on
    /// demand when `alloc` is set.
    fn entry(&mut self, va: usize, alloc: bool) -> Option<*mut u64> {
        if self.root == 0 {
            return None;
        }
        let mut table = self.root as *mut u64;
        for level in 0..3 {
            // SAFETY: `table` is a live table page of ours.
            let slot = unsafe { table.add(va_index(va, level)) };
            let pte = unsafe { *slot };
            if !pte_valid(pte) {
                if !alloc {
                    return None;
                }
                let page = alloc_zeroed_page().ok()?;
                // SAFETY: as above.
                unsafe { *slot = k2p(page) as u64 | PTE_TABLE };
            }
            // SAFETY: valid interior entries always point at table pages.
            table = pte_frame_ka(unsafe { *slot }) as *mut u64;
        }
        // SAFETY: as above.
        Some(unsafe { table.add(va_index(va, 3)) })
    }

    /// Frees every table page. The mapped frames are not touched.
    fn free_tables(&mut self) {
        fn walk(table: usize, level: usize) {
            if level == 3 {
                return;
            }
            for i in 0..(PAGE_SIZE / 8) {
                // SAFETY: `table` is a live table page of ours.
                let pte = unsafe { *(table as *const u64).add(i) };
                if pte_valid(pte) {
                    let child = pte_frame_ka(pte);
                    walk(child, level + 1);
                    kalloc::free_page(child);
                }
            }
        }
        if self.root != 0 {
            walk(self.root, 0);
            kalloc::free_page(self.root);
            self.root = 0;
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SectionKind {
    Text,
    Data,
    Heap,
    UserStack,
    MmapShared,
    MmapPrivate,
}

bitflags! {
    pub struct Prot: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

pub struct Section {
    pub kind: SectionKind,
    pub begin: usize,
    pub end: usize,

    /// Backing file for file-backed kinds.
    pub fp: Option<Arc<File>>,

    /// Offset of `begin` in the backing file.
    pub offset: usize,

    /// Bytes still to demand-load (`Text` only).
    pub length: usize,

    /// Allowed access for mmap kinds.
    pub prot: Prot,
}

impl Section {
    fn heap() -> Self {
        Self {
            kind: SectionKind::Heap,
            begin: 0,
            end: 0,
            fp: None,
            offset: 0,
            length: 0,
            prot: Prot::READ | Prot::WRITE,
        }
    }
}

/// The fault classes the trap layer decodes from the syndrome register.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultKind {
    Translation,
    Permission,
    Access,
}

struct PgdirInner {
    pt: PageTable,
    sections: Vec<Section>,
}

pub struct Pgdir {
    inner: SpinLock<PgdirInner>,
}

impl Pgdir {
    /// A fresh address space: an allocated root table and an empty heap
    /// section at `[0, 0)`.
    pub fn new() -> Result<Self, ()> {
        let mut sections = Vec::new();
        sections.push(Section::heap());
        Ok(Self {
            inner: SpinLock::new(
                "pgdir",
                PgdirInner {
                    pt: PageTable::new()?,
                    sections,
                },
            ),
        })
    }

    /// Installs this address space on the current core.
    pub fn attach(&self) {
        let inner = self.inner.lock();
        if inner.pt.root != 0 {
            // SAFETY: the root is a valid top-level table.
            unsafe { TargetArch::set_user_page_table(k2p(inner.pt.root)) };
        }
    }

    /// Adds `section`, which must not overlap anything present.
    pub fn add_section(&self, section: Section) {
        let mut inner = self.inner.lock();
        assert!(
            inner
                .sections
                .iter()
                .all(|s| section.end <= s.begin || s.end <= section.begin || s.begin == s.end),
            "pgdir: overlapping sections"
        );
        inner.sections.push(section);
    }

    /// Moves the (empty) heap to `begin`.
    pub fn place_heap(&self, begin: usize) {
        let mut inner = self.inner.lock();
        let heap = inner
            .sections
            .iter_mut()
            .find(|s| s.kind == SectionKind::Heap)
            .expect("pgdir: no heap section");
        assert_eq!(heap.begin, heap.end, "pgdir: moving a grown heap");
        heap.begin = begin;
        heap.end = begin;
    }

    /// Maps the page at `va` to the frame behind `ka`.
    pub(crate) fn map_page(&self, va: usize, ka: usize, flags: PteFlags) {
        let mut inner = self.inner.lock();
        let pte = inner
            .pt
            .entry(page_base(va), true)
            .expect("pgdir: map without a table");
        // SAFETY: `entry` returns a live leaf slot.
        unsafe { *pte = k2p(page_base(ka)) as u64 | flags.bits() };
        TargetArch::tlb_flush();
    }

    /// The frame and flags currently mapped at `va`.
    pub(crate) fn translate(&self, va: usize) -> Option<(usize, PteFlags)> {
        let mut inner = self.inner.lock();
        let pte = inner.pt.entry(va, false)?;
        // SAFETY: as in `map_page`.
        let pte = unsafe { *pte };
        if !pte_valid(pte) {
            return None;
        }
        Some((pte_frame_ka(pte), PteFlags::from_bits_truncate(pte)))
    }

    /// Clones this address space into `child` for fork: sections are
    /// copied (sharing the backing files), and every mapped page becomes
    /// read-only in both, sharing the frame copy-on-write.
    pub fn cow_clone_into(&self, child: &Pgdir) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let mut child_inner = child.inner.lock();
        child_inner.sections.clear();

        for sec in inner.sections.iter() {
            child_inner.sections.push(Section {
                kind: sec.kind,
                begin: sec.begin,
                end: sec.end,
                fp: sec.fp.clone(),
                offset: sec.offset,
                length: sec.length,
                prot: sec.prot,
            });

            let mut va = page_base(sec.begin);
            while va < sec.end {
                if let Some(slot) = inner.pt.entry(va, false) {
                    // SAFETY: live leaf slot of the parent.
                    let pte = unsafe { *slot };
                    if pte_valid(pte) {
                        // Write-protect the parent and share the frame.
                        unsafe { *slot = pte | PteFlags::RO.bits() };
                        let frame = pte_frame_ka(pte);
                        let flags =
                            PteFlags::from_bits_truncate(pte | PteFlags::RO.bits());
                        let child_pte =
                            child_inner.pt.entry(va, true).ok_or(())?;
                        // SAFETY: live leaf slot of the child.
                        unsafe { *child_pte = k2p(frame) as u64 | flags.bits() };
                        kalloc::share_page(frame);
                    }
                }
                va += PAGE_SIZE;
            }
        }
        TargetArch::tlb_flush();
        Ok(())
    }

    /// Serves a page fault at `addr`. An error means the access cannot be
    /// satisfied and the process must die.
    pub fn handle_fault(&self, addr: usize, kind: FaultKind) -> Result<(), ()> {
        let (sec_kind, prot) = {
            let inner = self.inner.lock();
            let sec = inner
                .sections
                .iter()
                .find(|s| s.begin <= addr && addr < s.end)
                .ok_or(())?;
            (sec.kind, sec.prot)
        };

        match (sec_kind, kind) {
            (SectionKind::Heap, FaultKind::Translation) => {
                let page = alloc_zeroed_page()?;
                self.map_page(addr, page, PteFlags::user_data());
            }
            (SectionKind::Heap, FaultKind::Permission)
            | (SectionKind::Data, FaultKind::Permission)
            | (SectionKind::UserStack, FaultKind::Permission) => {
                self.cow_break(addr)?;
            }
            (SectionKind::Text, FaultKind::Translation) => {
                self.load_text(addr)?;
            }
            (SectionKind::MmapShared, FaultKind::Translation)
            | (SectionKind::MmapPrivate, FaultKind::Translation) => {
                self.load_mmap_page(addr)?;
            }
            (SectionKind::MmapShared, FaultKind::Permission) => {
                if !prot.contains(Prot::WRITE) {
                    return Err(());
                }
                // Writes are shared: just drop the write protection.
                let mut inner = self.inner.lock();
                let pte = inner.pt.entry(addr, false).ok_or(())?;
                // SAFETY: live leaf slot.
                unsafe { *pte &= !PteFlags::RO.bits() };
            }
            (SectionKind::MmapPrivate, FaultKind::Permission) => {
                if !prot.contains(Prot::WRITE) {
                    return Err(());
                }
                let shared = {
                    let mut inner = self.inner.lock();
                    let pte = inner.pt.entry(addr, false).ok_or(())?;
                    // SAFETY: live leaf slot.
                    let frame = pte_frame_ka(unsafe { *pte });
                    kalloc::page_ref(frame) > 1
                };
                if shared {
                    self.cow_break(addr)?;
                } else {
                    let mut inner = self.inner.lock();
                    let pte = inner.pt.entry(addr, false).ok_or(())?;
                    // SAFETY: live leaf slot.
                    unsafe { *pte &= !PteFlags::RO.bits() };
                }
            }
            // Text is immutable, Data and the stack are pre-mapped, and
            // access-flag faults never happen with AF preset.
            _ => return Err(()),
        }
        TargetArch::tlb_flush();
        Ok(())
    }

    /// Breaks a copy-on-write share at `addr`: fresh frame, copied
    /// contents, mapped writable; the old frame loses one reference.
    fn cow_break(&self, addr: usize) -> Result<(), ()> {
        let page = kalloc::alloc_page().ok_or(())?;
        let mut inner = self.inner.lock();
        let pte = inner.pt.entry(addr, false).ok_or(())?;
        // SAFETY: live leaf slot.
        let old = unsafe { *pte };
        if !pte_valid(old) {
            kalloc::free_page(page);
            return Err(());
        }
        let old_frame = pte_frame_ka(old);
        // SAFETY: both frames are whole pages we own or share.
        unsafe {
            core::ptr::copy_nonoverlapping(old_frame as *const u8, page as *mut u8, PAGE_SIZE)
        };
        unsafe { *pte = k2p(page) as u64 | PteFlags::user_data().bits() };
        kalloc::free_page(old_frame);
        Ok(())
    }

    /// First fault on a text section: read the whole file range into
    /// fresh read-only pages, then drop the backing file.
    fn load_text(&self, addr: usize) -> Result<(), ()> {
        let (fp, begin, offset, length) = {
            let inner = self.inner.lock();
            let sec = inner
                .sections
                .iter()
                .find(|s| s.begin <= addr && addr < s.end)
                .ok_or(())?;
            if sec.length == 0 {
                return Err(());
            }
            (
                sec.fp.clone().ok_or(())?,
                sec.begin,
                sec.offset,
                sec.length,
            )
        };

        // Read outside the lock; only the owner faults on this pgdir.
        let mut va = page_base(begin);
        let end = begin + length;
        while va < end {
            let page = scopeguard::guard(alloc_zeroed_page()?, |p| kalloc::free_page(p));
            let lo = cmp::max(va, begin);
            let hi = cmp::min(va + PAGE_SIZE, end);
            // SAFETY: `page` is a whole fresh page.
            let dst = unsafe {
                core::slice::from_raw_parts_mut((*page + page_offset(lo)) as *mut u8, hi - lo)
            };
            if fp.pread(dst, offset + (lo - begin))? != hi - lo {
                return Err(());
            }
            self.map_page(va, *page, PteFlags::user_ro());
            scopeguard::ScopeGuard::into_inner(page);
            va += PAGE_SIZE;
        }

        let mut inner = self.inner.lock();
        if let Some(sec) = inner
            .sections
            .iter_mut()
            .find(|s| s.begin <= addr && addr < s.end)
        {
            sec.length = 0;
            sec.fp = None;
        }
        Ok(())
    }

    /// Demand-loads one page of a memory-mapped file, mapped read-only;
    /// the intersection with the section comes from the file, the rest is
    /// zero.
    fn load_mmap_page(&self, addr: usize) -> Result<(), ()> {
        let (fp, begin, end, offset) = {
            let inner = self.inner.lock();
            let sec = inner
                .sections
                .iter()
                .find(|s| s.begin <= addr && addr < s.end)
                .ok_or(())?;
            (sec.fp.clone().ok_or(())?, sec.begin, sec.end, sec.offset)
        };

        let page = alloc_zeroed_page()?;
        let lo = cmp::max(page_base(addr), begin);
        let hi = cmp::min(page_base(addr) + PAGE_SIZE, end);
        // SAFETY: `page` is a whole fresh page.
        let dst = unsafe {
            core::slice::from_raw_parts_mut((page + page_offset(lo)) as *mut u8, hi - lo)
        };
        // A mapping past end-of-file reads zeroes.
        let _ = fp.pread(dst, offset + (lo - begin))?;
        self.map_page(addr, page, PteFlags::user_ro());
        Ok(())
    }

    /// Grows or shrinks the heap by `delta` bytes (a page multiple).
    /// Growth is pure bookkeeping; shrinking unmaps and frees
    /// immediately. Returns the previous heap end.
    pub fn sbrk(&self, delta: isize) -> Result<usize, ()> {
        if delta % PAGE_SIZE as isize != 0 {
            return Err(());
        }
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let heap = inner
            .sections
            .iter_mut()
            .find(|s| s.kind == SectionKind::Heap)
            .ok_or(())?;
        let old_end = heap.end;
        let new_end = if delta >= 0 {
            old_end.checked_add(delta as usize).ok_or(())?
        } else {
            let shrink = (-delta) as usize;
            if old_end - heap.begin < shrink {
                return Err(());
            }
            old_end - shrink
        };
        heap.end = new_end;

        let mut va = new_end;
        while va < old_end {
            if let Some(pte) = inner.pt.entry(va, false) {
                // SAFETY: live leaf slot.
                let old = unsafe { *pte };
                if pte_valid(old) {
                    kalloc::free_page(pte_frame_ka(old));
                    unsafe { *pte = 0 };
                }
            }
            va += PAGE_SIZE;
        }
        if new_end < old_end {
            TargetArch::tlb_flush();
        }
        Ok(old_end)
    }

    /// Maps `length` bytes of `fp` at `offset`. With `addr == 0` the
    /// range lands right below the lowest mapped region above the heap;
    /// otherwise it must not overlap anything. Returns the chosen
    /// address.
    pub fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: Prot,
        shared: bool,
        fp: Arc<File>,
        offset: usize,
    ) -> Result<usize, ()> {
        if length == 0 || prot.is_empty() || prot.contains(Prot::EXEC) {
            return Err(());
        }
        if prot.contains(Prot::WRITE) && shared && !fp.writable {
            return Err(());
        }
        fp.inode().ok_or(())?;

        let mut inner = self.inner.lock();
        let (begin, end) = if addr == 0 {
            let mut floor = 0;
            let mut ceiling = usize::MAX;
            for s in inner.sections.iter() {
                match s.kind {
                    SectionKind::Heap => floor = s.end,
                    SectionKind::MmapShared | SectionKind::MmapPrivate | SectionKind::UserStack => {
                        ceiling = cmp::min(ceiling, s.begin)
                    }
                    _ => {}
                }
            }
            if ceiling - floor < length {
                return Err(());
            }
            (ceiling - length, ceiling)
        } else {
            let end = addr.checked_add(length).ok_or(())?;
            if inner
                .sections
                .iter()
                .any(|s| s.begin < end && addr < s.end)
            {
                return Err(());
            }
            (addr, end)
        };

        inner.sections.push(Section {
            kind: if shared {
                SectionKind::MmapShared
            } else {
                SectionKind::MmapPrivate
            },
            begin,
            end,
            fp: Some(fp),
            offset,
            length,
            prot,
        });
        Ok(begin)
    }

    /// Unmaps `[addr, addr+length)` of the mmap section starting exactly
    /// at `addr`: dirty shared pages are flushed to the file, everything
    /// covered is freed. A partial unmap covers a prefix and advances the
    /// section; a full one detaches it and closes the file.
    pub fn munmap(&self, addr: usize, length: usize) -> Result<(), ()> {
        let (idx, whole) = {
            let inner = self.inner.lock();
            let idx = inner
                .sections
                .iter()
                .position(|s| {
                    s.begin == addr
                        && matches!(
                            s.kind,
                            SectionKind::MmapShared | SectionKind::MmapPrivate
                        )
                })
                .ok_or(())?;
            (idx, length >= inner.sections[idx].end - addr)
        };

        let limit = if whole {
            let inner = self.inner.lock();
            inner.sections[idx].end
        } else {
            addr + length
        };
        self.flush_and_free_range(idx, addr, limit)?;

        let mut inner = self.inner.lock();
        if whole {
            inner.sections.remove(idx);
        } else {
            let sec = &mut inner.sections[idx];
            sec.offset += limit - sec.begin;
            sec.begin = limit;
        }
        TargetArch::tlb_flush();
        Ok(())
    }

    /// Flushes dirty pages of a shared mapping in `[lo, hi)` back to the
    /// file and frees every covered frame. Private mappings are never
    /// written back.
    fn flush_and_free_range(&self, idx: usize, lo: usize, hi: usize) -> Result<(), ()> {
        let (kind, begin, end, offset, fp) = {
            let inner = self.inner.lock();
            let s = &inner.sections[idx];
            (s.kind, s.begin, s.end, s.offset, s.fp.clone())
        };

        let mut va = page_base(lo);
        while va < hi {
            let frame = {
                let mut inner = self.inner.lock();
                match inner.pt.entry(va, false) {
                    Some(pte) => {
                        // SAFETY: live leaf slot.
                        let old = unsafe { *pte };
                        if pte_valid(old) {
                            unsafe { *pte = 0 };
                            Some((pte_frame_ka(old), pte_writable(old)))
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };

            if let Some((frame, dirty)) = frame {
                if kind == SectionKind::MmapShared && dirty {
                    if let Some(fp) = fp.as_ref() {
                        let lo_b = cmp::max(va, begin);
                        let hi_b = cmp::min(cmp::min(va + PAGE_SIZE, end), hi);
                        // SAFETY: the frame is ours until freed below.
                        let src = unsafe {
                            core::slice::from_raw_parts(
                                (frame + page_offset(lo_b)) as *const u8,
                                hi_b - lo_b,
                            )
                        };
                        fp.pwrite(src, offset + (lo_b - begin))?;
                    }
                }
                kalloc::free_page(frame);
            }
            va += PAGE_SIZE;
        }
        Ok(())
    }

    /// Tears the whole address space down: flushes dirty shared mappings,
    /// frees every mapped frame and all table pages. The pgdir is empty
    /// afterwards.
    pub fn release(&self) {
        loop {
            let work = {
                let inner = self.inner.lock();
                inner
                    .sections
                    .iter()
                    .enumerate()
                    .rev()
                    .next()
                    .map(|(i, s)| (i, s.begin, s.end))
            };
            let (idx, begin, end) = match work {
                Some(w) => w,
                None => break,
            };
            let _ = self.flush_and_free_range(idx, begin, end);
            let mut inner = self.inner.lock();
            inner.sections.remove(idx);
        }
        let mut inner = self.inner.lock();
        inner.pt.free_tables();
        TargetArch::tlb_flush();
    }

    /// Copies `src` to user address `va`, allocating frames as needed.
    /// Used while building an address space that is not attached yet.
    pub fn copyout(&self, va: usize, src: &[u8]) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        let mut done = 0;
        while done < src.len() {
            let cur = va + done;
            let pte = inner.pt.entry(cur, true).ok_or(())?;
            // SAFETY: live leaf slot.
            let mut frame = unsafe { *pte };
            if !pte_valid(frame) {
                let page = alloc_zeroed_page()?;
                // SAFETY: as above.
                unsafe { *pte = k2p(page) as u64 | PteFlags::user_data().bits() };
                frame = unsafe { *pte };
            }
            let ka = pte_frame_ka(frame) + page_offset(cur);
            let n = cmp::min(src.len() - done, PAGE_SIZE - page_offset(cur));
            // SAFETY: `ka` points into a frame of this pgdir.
            unsafe {
                core::ptr::copy_nonoverlapping(src.as_ptr().add(done), ka as *mut u8, n)
            };
            done += n;
        }
        Ok(())
    }

    /// Whether `[va, va+len)` lies entirely inside one section the user
    /// may read.
    pub fn user_readable(&self, va: usize, len: usize) -> bool {
        self.check_range(va, len, false)
    }

    /// Whether `[va, va+len)` lies entirely inside one writable section.
    pub fn user_writeable(&self, va: usize, len: usize) -> bool {
        self.check_range(va, len, true)
    }

    fn check_range(&self, va: usize, len: usize, write: bool) -> bool {
        let end = match va.checked_add(len) {
            Some(e) => e,
            None => return false,
        };
        let inner = self.inner.lock();
        inner.sections.iter().any(|s| {
            if va < s.begin || end > s.end {
                return false;
            }
            match (write, s.kind) {
                (true, SectionKind::Text) => false,
                (_, SectionKind::MmapShared) | (_, SectionKind::MmapPrivate) => s.prot.contains(
                    if write { Prot::WRITE } else { Prot::READ },
                ),
                _ => true,
            }
        })
    }

    /// Length of the NUL-terminated user string at `va` including the
    /// terminator, or 0 if it is unreadable or longer than `max`.
    pub fn user_strlen(&self, va: usize, max: usize) -> usize {
        for i in 0..max {
            if !self.user_readable(va + i, 1) {
                return 0;
            }
            // SAFETY: the address was just validated and user memory is
            // mapped while the kernel runs.
            if unsafe { *((va + i) as *const u8) } == 0 {
                return i + 1;
            }
        }
        0
    }
}

impl Drop for Pgdir {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{FTable, FileType};
    use crate::fs::testing::{fresh_fs, FsFixture};
    use crate::fs::InodeType;
    use crate::param::{TOP_USER_STACK, USER_STACK_SIZE};
    use core::sync::atomic::AtomicUsize;

    const HEAP: usize = 0x10_0000;

    fn init() {
        crate::kalloc::test_pool::init();
    }

    fn pgdir_with_heap() -> Pgdir {
        init();
        let pd = Pgdir::new().unwrap();
        pd.place_heap(HEAP);
        pd
    }

    fn add_stack(pd: &Pgdir) {
        pd.add_section(Section {
            kind: SectionKind::UserStack,
            begin: TOP_USER_STACK - USER_STACK_SIZE,
            end: TOP_USER_STACK,
            fp: None,
            offset: 0,
            length: 0,
            prot: Prot::READ | Prot::WRITE,
        });
    }

    fn file_with(fx: &FsFixture, ft: &'static FTable, name: &str, content: &[u8]) -> Arc<File> {
        let op = fx.log.begin_op().unwrap();
        let ino = fx.itable.alloc(&op, InodeType::Regular).unwrap();
        let ip = fx.itable.get(ino);
        {
            let mut g = ip.lock().unwrap();
            g.entry_mut().num_links = 1;
            g.sync(&op).unwrap();
        }
        let root = fx.itable.root();
        {
            let mut g = root.lock().unwrap();
            g.dir_insert(&op, &crate::fs::FileName::new(name.as_bytes()), ino)
                .unwrap();
        }
        root.put(&op);
        drop(op);
        let f = ft
            .alloc(
                FileType::Inode {
                    ip,
                    off: AtomicUsize::new(0),
                },
                true,
                true,
            )
            .unwrap();
        if !content.is_empty() {
            assert_eq!(f.write(content).unwrap(), content.len());
        }
        f
    }

    #[test]
    fn map_and_translate() {
        init();
        let pd = Pgdir::new().unwrap();
        let page = kalloc::alloc_page().unwrap();
        pd.map_page(0x40_0000, page, PteFlags::user_data());
        let (frame, flags) = pd.translate(0x40_0123).unwrap();
        assert_eq!(frame, page);
        assert!(!flags.contains(PteFlags::RO));
        assert!(pd.translate(0x41_0000).is_none());
    }

    #[test]
    fn heap_faults_demand_zero() {
        let pd = pgdir_with_heap();
        pd.sbrk(2 * PAGE_SIZE as isize).unwrap();
        // Growth is pure: nothing mapped yet.
        assert!(pd.translate(HEAP).is_none());

        pd.handle_fault(HEAP + 8, FaultKind::Translation).unwrap();
        let (frame, flags) = pd.translate(HEAP).unwrap();
        assert!(!flags.contains(PteFlags::RO));
        // SAFETY: the frame was just mapped for us.
        let bytes = unsafe { core::slice::from_raw_parts(frame as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));

        // Outside every section: fatal.
        assert!(pd.handle_fault(0x90_0000, FaultKind::Translation).is_err());
        // One byte past the heap end: fatal.
        assert!(pd
            .handle_fault(HEAP + 2 * PAGE_SIZE, FaultKind::Translation)
            .is_err());
    }

    #[test]
    fn sbrk_reports_and_shrinks() {
        let pd = pgdir_with_heap();
        assert_eq!(pd.sbrk(0).unwrap(), HEAP);
        assert_eq!(pd.sbrk(PAGE_SIZE as isize).unwrap(), HEAP);
        pd.handle_fault(HEAP, FaultKind::Translation).unwrap();
        assert!(pd.translate(HEAP).is_some());

        assert_eq!(pd.sbrk(-(PAGE_SIZE as isize)).unwrap(), HEAP + PAGE_SIZE);
        assert!(pd.translate(HEAP).is_none());

        // Not a page multiple.
        assert!(pd.sbrk(123).is_err());
        // Shrinking below the heap base.
        assert!(pd.sbrk(-(PAGE_SIZE as isize)).is_err());
    }

    #[test]
    fn fork_cow_isolates_memories() {
        let parent = pgdir_with_heap();
        parent.sbrk(PAGE_SIZE as isize).unwrap();
        parent.handle_fault(HEAP, FaultKind::Translation).unwrap();
        let (pframe, _) = parent.translate(HEAP).unwrap();
        // SAFETY: the frame belongs to `parent` alone right now.
        unsafe { *(pframe as *mut u8) = b'A' };

        let child = Pgdir::new().unwrap();
        parent.cow_clone_into(&child).unwrap();

        // Same frame, both write-protected, two owners.
        let (cframe, cflags) = child.translate(HEAP).unwrap();
        assert_eq!(cframe, pframe);
        assert!(cflags.contains(PteFlags::RO));
        let (_, pflags) = parent.translate(HEAP).unwrap();
        assert!(pflags.contains(PteFlags::RO));
        assert_eq!(kalloc::page_ref(pframe), 2);

        // The child's write breaks the share.
        child.handle_fault(HEAP + 3, FaultKind::Permission).unwrap();
        let (cframe2, cflags2) = child.translate(HEAP).unwrap();
        assert_ne!(cframe2, pframe);
        assert!(!cflags2.contains(PteFlags::RO));
        // SAFETY: disjoint frames owned by the two pgdirs.
        unsafe {
            assert_eq!(*(cframe2 as *const u8), b'A');
            *(cframe2 as *mut u8) = b'B';
            assert_eq!(*(pframe as *const u8), b'A');
        }
        assert_eq!(kalloc::page_ref(pframe), 1);
    }

    #[test]
    fn private_mapping_never_writes_the_file() {
        let fx = fresh_fs();
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        let len = PAGE_SIZE + PAGE_SIZE / 2;
        let content = vec![b'A'; len];
        let f = file_with(&fx, ft, "m", &content);

        let pd = pgdir_with_heap();
        add_stack(&pd);
        let addr = pd
            .mmap(0, len, Prot::READ | Prot::WRITE, false, Arc::clone(&f), 0)
            .unwrap();
        // Chosen right below the stack.
        assert_eq!(addr + len, TOP_USER_STACK - USER_STACK_SIZE);

        // Touch and overwrite every mapped byte.
        for page in 0..2 {
            let va = addr + page * PAGE_SIZE;
            pd.handle_fault(va, FaultKind::Translation).unwrap();
            pd.handle_fault(va, FaultKind::Permission).unwrap();
            let (frame, flags) = pd.translate(va).unwrap();
            assert!(!flags.contains(PteFlags::RO));
            let n = core::cmp::min(PAGE_SIZE, len - page * PAGE_SIZE);
            // SAFETY: the frame is privately owned after the write fault.
            unsafe { core::ptr::write_bytes(frame as *mut u8, b'Z', n) };
        }
        pd.munmap(addr, len).unwrap();

        // The file never saw the writes.
        let mut back = vec![0u8; len];
        assert_eq!(f.pread(&mut back, 0).unwrap(), len);
        assert!(back.iter().all(|&b| b == b'A'));
    }

    #[test]
    fn shared_mapping_flushes_dirty_pages_on_unmap() {
        let fx = fresh_fs();
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        let len = 2 * PAGE_SIZE;
        let content = vec![b'A'; len];
        let f = file_with(&fx, ft, "s", &content);

        let pd = pgdir_with_heap();
        add_stack(&pd);
        let addr = pd
            .mmap(0, len, Prot::READ | Prot::WRITE, true, Arc::clone(&f), 0)
            .unwrap();

        // Dirty only the first page.
        pd.handle_fault(addr, FaultKind::Translation).unwrap();
        pd.handle_fault(addr, FaultKind::Permission).unwrap();
        let (frame, _) = pd.translate(addr).unwrap();
        // SAFETY: mapped writable for us.
        unsafe { *((frame + 10) as *mut u8) = b'Z' };
        // The second page is only read.
        pd.handle_fault(addr + PAGE_SIZE, FaultKind::Translation).unwrap();

        pd.munmap(addr, len).unwrap();

        let mut back = vec![0u8; len];
        assert_eq!(f.pread(&mut back, 0).unwrap(), len);
        assert_eq!(back[10], b'Z');
        assert_eq!(back[PAGE_SIZE + 10], b'A');
    }

    #[test]
    fn mmap_rejects_overlap_and_honors_partial_munmap() {
        let fx = fresh_fs();
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        let f = file_with(&fx, ft, "o", &vec![b'B'; 3 * PAGE_SIZE]);

        let pd = pgdir_with_heap();
        add_stack(&pd);
        pd.sbrk(PAGE_SIZE as isize).unwrap();

        // Overlapping the heap is rejected.
        assert!(pd
            .mmap(HEAP, PAGE_SIZE, Prot::READ, false, Arc::clone(&f), 0)
            .is_err());

        let addr = pd
            .mmap(0, 3 * PAGE_SIZE, Prot::READ, false, Arc::clone(&f), 0)
            .unwrap();
        pd.handle_fault(addr, FaultKind::Translation).unwrap();

        // Unmapping must hit the section start.
        assert!(pd.munmap(addr + PAGE_SIZE, PAGE_SIZE).is_err());
        pd.munmap(addr, PAGE_SIZE).unwrap();
        assert!(pd.translate(addr).is_none());
        // The shrunk section no longer covers the first page...
        assert!(pd.handle_fault(addr, FaultKind::Translation).is_err());
        // ...but still serves the rest.
        pd.handle_fault(addr + PAGE_SIZE, FaultKind::Translation)
            .unwrap();

        // And a second anonymous-address mapping stacks below the first.
        let lower = pd
            .mmap(0, PAGE_SIZE, Prot::READ, false, Arc::clone(&f), 0)
            .unwrap();
        assert!(lower + PAGE_SIZE <= addr + PAGE_SIZE);
    }

    #[test]
    fn text_section_loads_once_and_drops_the_file() {
        let fx = fresh_fs();
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        let mut content = vec![0u8; 600];
        for (i, b) in content.iter_mut().enumerate() {
            *b = i as u8;
        }
        let f = file_with(&fx, ft, "txt", &content);

        let pd = pgdir_with_heap();
        let begin = 0x40_0000;
        pd.add_section(Section {
            kind: SectionKind::Text,
            begin,
            end: begin + content.len(),
            fp: Some(Arc::clone(&f)),
            offset: 0,
            length: content.len(),
            prot: Prot::READ | Prot::EXEC,
        });

        pd.handle_fault(begin + 100, FaultKind::Translation).unwrap();
        let (frame, flags) = pd.translate(begin).unwrap();
        assert!(flags.contains(PteFlags::RO));
        // SAFETY: mapped for us.
        let loaded = unsafe { core::slice::from_raw_parts(frame as *const u8, 600) };
        assert_eq!(loaded, &content[..]);

        // Writing text is fatal.
        assert!(pd.handle_fault(begin, FaultKind::Permission).is_err());
        // A second translation fault finds nothing left to load.
        assert!(pd.handle_fault(begin + 1, FaultKind::Translation).is_err());
    }

    #[test]
    fn user_range_checks_follow_sections() {
        let pd = pgdir_with_heap();
        pd.sbrk(PAGE_SIZE as isize).unwrap();
        assert!(pd.user_readable(HEAP, 16));
        assert!(pd.user_writeable(HEAP, PAGE_SIZE));
        // Crossing the section end fails.
        assert!(!pd.user_readable(HEAP + PAGE_SIZE - 8, 16));
        assert!(!pd.user_readable(0x50_0000, 1));

        let begin = 0x40_0000;
        pd.add_section(Section {
            kind: SectionKind::Text,
            begin,
            end: begin + PAGE_SIZE,
            fp: None,
            offset: 0,
            length: 0,
            prot: Prot::READ | Prot::EXEC,
        });
        assert!(pd.user_readable(begin, 8));
        assert!(!pd.user_writeable(begin, 8));
    }
}
