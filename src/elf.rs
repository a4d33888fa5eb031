//! ELF64 file format, just enough for the exec loader.

use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Offset of the class byte in `e_ident`.
pub const EI_CLASS: usize = 4;
pub const ELF_CLASS_64: u8 = 2;

pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ElfHeader {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u64,
    pub e_phoff: u64,
    pub e_shoff: u64,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

const_assert!(mem::size_of::<ElfHeader>() == 64);

impl ElfHeader {
    /// A well-formed 64-bit ELF image?
    pub fn is_valid(&self) -> bool {
        self.e_ident[..4] == ELF_MAGIC[..] && self.e_ident[EI_CLASS] == ELF_CLASS_64
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, AsBytes, FromBytes)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

const_assert!(mem::size_of::<ProgramHeader>() == 56);
