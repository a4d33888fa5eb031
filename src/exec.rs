//! The exec loader.
//!
//! Builds a fresh address space from an ELF64 image: `R|X` segments
//! become demand-loaded text sections, `R|W` segments are read eagerly
//! with their whole-page BSS tail mapped to the shared zero page, the
//! heap lands one page above the loaded image, and the user stack is
//! allocated eagerly below `TOP_USER_STACK` with the argument vectors
//! packed at its top:
//!
//! ```text
//! [reserved]
//! [argv/envp string bytes]
//! [envp pointers, NULL-terminated]
//! [argv pointers, NULL-terminated]
//! [argc]        <- sp, 16-byte aligned
//! ```
//!
//! Only when everything succeeded does the caller's old address space go
//! away; a failed exec leaves the process untouched.

use alloc::vec::Vec;
use core::cmp;
use core::mem;
use core::sync::atomic::AtomicUsize;

use crate::addr::{page_base, page_offset};
use crate::cpu;
use crate::elf::{ElfHeader, ProgramHeader, PF_R, PF_W, PF_X, PT_LOAD};
use crate::file::{FTable, FileType};
use crate::fs::{InodeTree, RcInode};
use crate::kalloc;
use crate::kernel;
use crate::param::{PAGE_SIZE, STACK_RESERVE, TOP_USER_STACK, USER_STACK_SIZE};
use crate::vm::{Pgdir, Prot, PteFlags, Section, SectionKind};

/// Replaces the current process's program. Pid and open files survive; on
/// failure the caller keeps running its old image.
pub fn execve(path: &[u8], argv: &[Vec<u8>], envp: &[Vec<u8>]) -> Result<(), ()> {
    let this = cpu::current().ok_or(())?;
    // SAFETY: we are the running owner.
    let data = unsafe { this.data() };
    let (pgdir, entry, sp) = load(
        kernel::itable(),
        kernel::ftable(),
        path,
        data.cwd.as_ref(),
        argv,
        envp,
    )?;

    // SAFETY: the user context belongs to this process.
    unsafe {
        let uc = data.kstack.ucontext();
        (*uc).elr = entry;
        (*uc).sp = sp as u64;
        (*uc).spsr = 0;
    }
    // The old address space dies here.
    data.pgdir = pgdir;
    data.pgdir.attach();
    Ok(())
}

/// Parses the image at `path` and builds the new address space. Returns
/// it with the ELF entry point and the initial stack pointer.
pub fn load(
    itable: &'static InodeTree,
    ftable: &'static FTable,
    path: &[u8],
    cwd: Option<&RcInode>,
    argv: &[Vec<u8>],
    envp: &[Vec<u8>],
) -> Result<(Pgdir, u64, usize), ()> {
    let op = itable.log().begin_op()?;
    let ip = itable.namei(path, cwd, &op)?;

    let pgdir = Pgdir::new()?;
    let mut top = 0usize;

    let ehdr = {
        let mut guard = match ip.lock() {
            Ok(g) => g,
            Err(()) => {
                ip.put(&op);
                return Err(());
            }
        };

        let result = (|| -> Result<ElfHeader, ()> {
            let ehdr: ElfHeader = guard.read_record(0)?;
            if !ehdr.is_valid() || ehdr.e_phentsize as usize != mem::size_of::<ProgramHeader>() {
                return Err(());
            }

            for i in 0..ehdr.e_phnum as usize {
                let phdr: ProgramHeader = guard
                    .read_record(ehdr.e_phoff as usize + i * mem::size_of::<ProgramHeader>())?;
                if phdr.p_type != PT_LOAD {
                    continue;
                }
                let vaddr = phdr.p_vaddr as usize;
                let filesz = phdr.p_filesz as usize;
                let memsz = phdr.p_memsz as usize;
                let offset = phdr.p_offset as usize;
                top = cmp::max(top, vaddr + memsz);

                match phdr.p_flags & (PF_R | PF_W | PF_X) {
                    flags if flags == PF_R | PF_X => {
                        // Text: demand-loaded from a private read-only
                        // handle on the image.
                        let fp = ftable.alloc(
                            FileType::Inode {
                                ip: ip.clone(),
                                off: AtomicUsize::new(0),
                            },
                            true,
                            false,
                        )?;
                        pgdir.add_section(Section {
                            kind: SectionKind::Text,
                            begin: vaddr,
                            end: vaddr + filesz,
                            fp: Some(fp),
                            offset,
                            length: filesz,
                            prot: Prot::READ | Prot::EXEC,
                        });
                    }
                    flags if flags == PF_R | PF_W => {
                        // Data: eagerly read; the whole-page BSS tail
                        // shares the zero page copy-on-write.
                        pgdir.add_section(Section {
                            kind: SectionKind::Data,
                            begin: vaddr,
                            end: vaddr + memsz,
                            fp: None,
                            offset: 0,
                            length: 0,
                            prot: Prot::READ | Prot::WRITE,
                        });
                        let mut va = page_base(vaddr);
                        while va < vaddr + filesz {
                            let page = kalloc::alloc_page().ok_or(())?;
                            // SAFETY: fresh page, exclusively ours.
                            unsafe {
                                core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE)
                            };
                            let page =
                                scopeguard::guard(page, |p| kalloc::free_page(p));
                            let lo = cmp::max(va, vaddr);
                            let hi = cmp::min(va + PAGE_SIZE, vaddr + filesz);
                            // SAFETY: within the fresh page.
                            let dst = unsafe {
                                core::slice::from_raw_parts_mut(
                                    (*page + page_offset(lo)) as *mut u8,
                                    hi - lo,
                                )
                            };
                            if guard.read_bytes(dst, offset + (lo - vaddr))? != hi - lo {
                                return Err(());
                            }
                            pgdir.map_page(va, *page, PteFlags::user_data());
                            scopeguard::ScopeGuard::into_inner(page);
                            va += PAGE_SIZE;
                        }
                        while va < vaddr + memsz {
                            pgdir.map_page(va, kalloc::zero_page(), PteFlags::user_ro());
                            va += PAGE_SIZE;
                        }
                    }
                    _ => return Err(()),
                }
            }
            Ok(ehdr)
        })();

        match result {
            Ok(ehdr) => {
                drop(guard);
                ip.put(&op);
                ehdr
            }
            Err(()) => {
                drop(guard);
                ip.put(&op);
                return Err(());
            }
        }
    };
    drop(op);

    // Heap one page above the image; leave room for the stack below
    // TOP_USER_STACK.
    let heap = page_base(top) + PAGE_SIZE;
    if heap >= TOP_USER_STACK - USER_STACK_SIZE {
        return Err(());
    }
    pgdir.place_heap(heap);

    // The user stack, eagerly populated.
    pgdir.add_section(Section {
        kind: SectionKind::UserStack,
        begin: TOP_USER_STACK - USER_STACK_SIZE,
        end: TOP_USER_STACK,
        fp: None,
        offset: 0,
        length: 0,
        prot: Prot::READ | Prot::WRITE,
    });
    let mut va = TOP_USER_STACK - USER_STACK_SIZE;
    while va < TOP_USER_STACK {
        let page = kalloc::alloc_page().ok_or(())?;
        // SAFETY: fresh page, exclusively ours.
        unsafe { core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE) };
        pgdir.map_page(va, page, PteFlags::user_data());
        va += PAGE_SIZE;
    }

    let sp = build_stack(&pgdir, argv, envp)?;
    Ok((pgdir, ehdr.e_entry, sp))
}

/// Packs argc, the pointer vectors and the string bytes at the stack top.
/// Returns the initial (16-byte aligned) stack pointer.
fn build_stack(pgdir: &Pgdir, argv: &[Vec<u8>], envp: &[Vec<u8>]) -> Result<usize, ()> {
    let str_total: usize = argv
        .iter()
        .chain(envp.iter())
        .map(|s| s.len() + 1)
        .sum();
    let mut str_cursor = TOP_USER_STACK - STACK_RESERVE - str_total;
    let ptr_total = (argv.len() + envp.len() + 3) * 8;
    let argc_start = (str_cursor - ptr_total) & !0xf;
    if argc_start < TOP_USER_STACK - USER_STACK_SIZE {
        return Err(());
    }

    let mut slot = argc_start;
    pgdir.copyout(slot, &(argv.len() as u64).to_le_bytes())?;
    slot += 8;

    for s in argv.iter() {
        pgdir.copyout(str_cursor, s)?;
        pgdir.copyout(str_cursor + s.len(), &[0u8])?;
        pgdir.copyout(slot, &(str_cursor as u64).to_le_bytes())?;
        str_cursor += s.len() + 1;
        slot += 8;
    }
    pgdir.copyout(slot, &0u64.to_le_bytes())?;
    slot += 8;

    for s in envp.iter() {
        pgdir.copyout(str_cursor, s)?;
        pgdir.copyout(str_cursor + s.len(), &[0u8])?;
        pgdir.copyout(slot, &(str_cursor as u64).to_le_bytes())?;
        str_cursor += s.len() + 1;
        slot += 8;
    }
    pgdir.copyout(slot, &0u64.to_le_bytes())?;

    Ok(argc_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::{fresh_fs, FsFixture};
    use crate::fs::InodeType;
    use crate::vm::FaultKind;
    use core::convert::TryInto;
    use zerocopy::AsBytes;

    const TEXT_VA: usize = 0x40_0000;
    const DATA_VA: usize = 0x50_0000;

    /// A tiny two-segment image: 64 bytes of "code" and a data segment
    /// with 24 file bytes plus a page-crossing BSS.
    fn build_image() -> Vec<u8> {
        let mut ehdr = ElfHeader::default();
        ehdr.e_ident[..4].copy_from_slice(crate::elf::ELF_MAGIC);
        ehdr.e_ident[crate::elf::EI_CLASS] = crate::elf::ELF_CLASS_64;
        ehdr.e_entry = TEXT_VA as u64;
        ehdr.e_phoff = 64;
        ehdr.e_phentsize = 56;
        ehdr.e_phnum = 2;

        let text = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: 0x200,
            p_vaddr: TEXT_VA as u64,
            p_paddr: TEXT_VA as u64,
            p_filesz: 64,
            p_memsz: 64,
            p_align: PAGE_SIZE as u64,
        };
        let data = ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_W,
            p_offset: 0x300,
            p_vaddr: DATA_VA as u64,
            p_paddr: DATA_VA as u64,
            p_filesz: 24,
            p_memsz: (2 * PAGE_SIZE + 24) as u64,
            p_align: PAGE_SIZE as u64,
        };

        let mut image = vec![0u8; 0x300 + 24];
        image[..64].copy_from_slice(ehdr.as_bytes());
        image[64..120].copy_from_slice(text.as_bytes());
        image[120..176].copy_from_slice(data.as_bytes());
        for i in 0..64 {
            image[0x200 + i] = 0xd0 ^ i as u8; // "instructions"
        }
        for i in 0..24 {
            image[0x300 + i] = i as u8;
        }
        image
    }

    fn install_image(fx: &FsFixture, name: &str, image: &[u8]) {
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
        ip.put(&op);
        drop(op);

        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        let op = fx.log.begin_op().unwrap();
        let ip = fx.itable.namei(format!("/{}", name).as_bytes(), None, &op).unwrap();
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
        assert_eq!(f.write(image).unwrap(), image.len());
    }

    fn read_user(pd: &Pgdir, va: usize, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cur = va;
        while out.len() < len {
            let (frame, _) = pd.translate(cur).expect("unmapped user address");
            let take = core::cmp::min(len - out.len(), PAGE_SIZE - page_offset(cur));
            // SAFETY: the frame is mapped in the test pgdir.
            let src =
                unsafe { core::slice::from_raw_parts((frame + page_offset(cur)) as *const u8, take) };
            out.extend_from_slice(src);
            cur += take;
        }
        out
    }

    #[test]
    fn load_builds_the_expected_address_space() {
        crate::kalloc::test_pool::init();
        let fx = fresh_fs();
        install_image(&fx, "prog", &build_image());
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));

        let argv = vec![b"prog".to_vec(), b"arg1".to_vec()];
        let envp = vec![b"TERM=dumb".to_vec()];
        let (pd, entry, sp) = load(fx.itable, ft, b"/prog", None, &argv, &envp).unwrap();

        assert_eq!(entry, TEXT_VA as u64);
        assert_eq!(sp % 16, 0);

        // Text is demand-loaded: unmapped until the first fault.
        assert!(pd.translate(TEXT_VA).is_none());
        pd.handle_fault(TEXT_VA, FaultKind::Translation).unwrap();
        let text = read_user(&pd, TEXT_VA, 64);
        assert_eq!(text[3], 0xd0 ^ 3);

        // Data was populated eagerly, file bytes then zeroes.
        let data = read_user(&pd, DATA_VA, 32);
        assert_eq!(&data[..24], (0..24u8).collect::<Vec<_>>().as_slice());
        assert!(data[24..].iter().all(|&b| b == 0));

        // The page-crossing BSS tail shares the zero page read-only.
        let (bss_frame, bss_flags) = pd.translate(DATA_VA + PAGE_SIZE).unwrap();
        assert_eq!(bss_frame, kalloc::zero_page());
        assert!(bss_flags.contains(PteFlags::RO));

        // Stack image: argc, then argv pointers.
        let argc = u64::from_le_bytes(read_user(&pd, sp, 8).try_into().unwrap());
        assert_eq!(argc, 2);
        let argv0 =
            u64::from_le_bytes(read_user(&pd, sp + 8, 8).try_into().unwrap()) as usize;
        assert_eq!(read_user(&pd, argv0, 5), b"prog\0");
        let argv1 =
            u64::from_le_bytes(read_user(&pd, sp + 16, 8).try_into().unwrap()) as usize;
        assert_eq!(read_user(&pd, argv1, 4), b"arg1");
        // NULL terminator after argv.
        let null = u64::from_le_bytes(read_user(&pd, sp + 24, 8).try_into().unwrap());
        assert_eq!(null, 0);
        let envp0 =
            u64::from_le_bytes(read_user(&pd, sp + 32, 8).try_into().unwrap()) as usize;
        assert_eq!(read_user(&pd, envp0, 9), b"TERM=dumb");

        // Heap sits one page above the loaded image.
        assert_eq!(pd.sbrk(0).unwrap(), page_base(DATA_VA + 2 * PAGE_SIZE + 24) + PAGE_SIZE);
    }

    #[test]
    fn load_rejects_non_elf_files() {
        crate::kalloc::test_pool::init();
        let fx = fresh_fs();
        install_image(&fx, "junk", b"#!not an elf");
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        assert!(load(fx.itable, ft, b"/junk", None, &[], &[]).is_err());
        assert!(load(fx.itable, ft, b"/absent", None, &[], &[]).is_err());
    }

    #[test]
    fn oversized_arguments_fail() {
        crate::kalloc::test_pool::init();
        let fx = fresh_fs();
        install_image(&fx, "p2", &build_image());
        let ft: &'static FTable = Box::leak(Box::new(FTable::new()));
        // More string bytes than the stack can hold.
        let huge = vec![vec![b'x'; USER_STACK_SIZE]];
        assert!(load(fx.itable, ft, b"/p2", None, &huge, &[]).is_err());
    }
}
