// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Raw, byte-exact ELF64 structure definitions. Only little-endian layout is
//! supported; every struct derives `scroll`'s `Pread`/`Pwrite`/`SizeWith` so
//! they can be read or written straight out of a `Vec<u8>` buffer.

use scroll::{Pread, Pwrite, SizeWith};

pub const EI_NIDENT: usize = 16;

pub const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
pub const ELFCLASS64: u8 = 2;
pub const ELFDATA2LSB: u8 = 1;
pub const EM_AARCH64: u16 = 183;

pub const PT_NULL: u32 = 0;
pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;
pub const PT_PHDR: u32 = 6;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const SHT_NULL: u32 = 0;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_DYNSYM: u32 = 11;
pub const SHT_GNU_HASH: u32 = 0x6fff_fff6;
pub const SHT_HASH: u32 = 5;

pub const STB_GLOBAL: u8 = 1;
pub const STT_FUNC: u8 = 2;
pub const STT_NOTYPE: u8 = 0;
pub const SHN_ABS: u16 = 0xfff1;

pub const DT_NULL: i64 = 0;
pub const DT_HASH: i64 = 4;
pub const DT_STRTAB: i64 = 5;
pub const DT_SYMTAB: i64 = 6;
pub const DT_GNU_HASH: i64 = 0x6fff_fef5;

/// The 64-byte ELF file header.
#[derive(Clone, Copy, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Elf64Ehdr {
    pub e_ident: [u8; EI_NIDENT],
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

/// A single 56-byte program header table entry.
#[derive(Clone, Copy, Debug, Default, Pread, Pwrite, SizeWith, PartialEq, Eq)]
pub struct Elf64Phdr {
    pub p_type: u32,
    pub p_flags: u32,
    pub p_offset: u64,
    pub p_vaddr: u64,
    pub p_paddr: u64,
    pub p_filesz: u64,
    pub p_memsz: u64,
    pub p_align: u64,
}

/// A single 64-byte section header table entry.
#[derive(Clone, Copy, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Elf64Shdr {
    pub sh_name: u32,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_addr: u64,
    pub sh_offset: u64,
    pub sh_size: u64,
    pub sh_link: u32,
    pub sh_info: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
}

/// A single 24-byte `.dynsym`/`.symtab` entry.
#[derive(Clone, Copy, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Elf64Sym {
    pub st_name: u32,
    pub st_info: u8,
    pub st_other: u8,
    pub st_shndx: u16,
    pub st_value: u64,
    pub st_size: u64,
}

impl Elf64Sym {
    pub fn bind(&self) -> u8 {
        self.st_info >> 4
    }

    pub fn sym_type(&self) -> u8 {
        self.st_info & 0xf
    }

    pub fn make_info(bind: u8, sym_type: u8) -> u8 {
        (bind << 4) | (sym_type & 0xf)
    }
}

/// A single 16-byte `.dynamic` entry.
#[derive(Clone, Copy, Debug, Default, Pread, Pwrite, SizeWith)]
pub struct Elf64Dyn {
    pub d_tag: i64,
    pub d_val: u64,
}

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;
pub const SHDR_SIZE: usize = 64;
pub const SYM_SIZE: usize = 24;
pub const DYN_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::ctx::SizeWith;
    use scroll::{Pread, Pwrite, LE};

    #[test]
    fn phdr_size_matches_wire_layout() {
        assert_eq!(Elf64Phdr::size_with(&LE), PHDR_SIZE);
    }

    #[test]
    fn sym_round_trip() {
        let sym = Elf64Sym {
            st_name: 42,
            st_info: Elf64Sym::make_info(STB_GLOBAL, STT_FUNC),
            st_other: 0,
            st_shndx: 1,
            st_value: 0x1000,
            st_size: 64,
        };
        let mut buf = vec![0u8; SYM_SIZE];
        buf.pwrite_with(sym, 0, LE).unwrap();
        let back: Elf64Sym = buf.pread_with(0, LE).unwrap();
        assert_eq!(back.st_value, 0x1000);
        assert_eq!(back.bind(), STB_GLOBAL);
        assert_eq!(back.sym_type(), STT_FUNC);
    }
}
