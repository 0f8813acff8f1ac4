// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C1: loads and indexes an AArch64 ELF64 image.

use std::fs;
use std::path::Path;

use scroll::{Pread, LE};

use crate::elf::raw::{
    Elf64Dyn, Elf64Ehdr, Elf64Phdr, Elf64Shdr, Elf64Sym, DYN_SIZE, EHDR_SIZE, ELFCLASS64,
    ELFDATA2LSB, ELFMAG, EM_AARCH64, PHDR_SIZE, PT_LOAD, SHDR_SIZE, SHT_NOBITS, SYM_SIZE,
};
use crate::error::{Result, VmpError};

/// A section's typed view: a name, its raw header, and (for `SHT_NOBITS`
/// sections) an absent byte slice.
#[derive(Debug, Clone)]
pub struct SectionView {
    pub index: usize,
    pub name: String,
    pub header: Elf64Shdr,
}

/// Resolved information about a `.symtab`/`.dynsym` symbol.
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolInfo {
    pub value: u64,
    pub size: u64,
    pub shndx: u16,
    pub sym_type: u8,
    pub found: bool,
}

/// A window into an [`ElfImage`]'s buffer for one function's code bytes.
#[derive(Debug, Clone)]
pub struct FunctionView {
    pub name: String,
    pub file_offset: u64,
    pub size: u64,
    pub vaddr: u64,
}

impl FunctionView {
    pub fn bytes<'a>(&self, image: &'a ElfImage) -> &'a [u8] {
        let start = self.file_offset as usize;
        let end = start + self.size as usize;
        &image.bytes[start..end]
    }
}

/// An owned ELF64 image: the whole file plus parsed EHDR/PHT/SHT views.
///
/// Immutable after [`ElfImage::load`]; callers that need a patched copy work
/// against a cloned `Vec<u8>` (see `patchbay`/`pht`).
pub struct ElfImage {
    pub bytes: Vec<u8>,
    pub ehdr: Elf64Ehdr,
    pub phdrs: Vec<Elf64Phdr>,
    pub shdrs: Vec<Elf64Shdr>,
    pub section_names: Vec<String>,
}

/// Checks `offset + entry_size * count` against `file_size`, rejecting
/// overflow and zero-size-nonzero-count tables per spec section 4.1.
fn check_table_bounds(
    name: &'static str,
    offset: u64,
    entry_size: u64,
    count: u64,
    file_size: u64,
) -> Result<()> {
    if entry_size == 0 && count > 0 {
        return Err(VmpError::TableOutOfBounds(name));
    }
    let total = entry_size
        .checked_mul(count)
        .ok_or(VmpError::TableOutOfBounds(name))?;
    let end = offset
        .checked_add(total)
        .ok_or(VmpError::TableOutOfBounds(name))?;
    if end > file_size {
        return Err(VmpError::TableOutOfBounds(name));
    }
    Ok(())
}

impl ElfImage {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let file_size = bytes.len() as u64;
        if file_size < EHDR_SIZE as u64 || bytes.get(0..4) != Some(&ELFMAG[..]) {
            return Err(VmpError::NotElf);
        }

        let ehdr: Elf64Ehdr = bytes.pread_with(0, LE)?;
        if ehdr.e_ident[4] != ELFCLASS64 {
            return Err(VmpError::UnsupportedClass);
        }
        if ehdr.e_ident[5] != ELFDATA2LSB {
            return Err(VmpError::UnsupportedEndian);
        }
        if ehdr.e_machine != EM_AARCH64 {
            return Err(VmpError::UnsupportedMachine);
        }

        check_table_bounds(
            "program_header_table",
            ehdr.e_phoff,
            ehdr.e_phentsize as u64,
            ehdr.e_phnum as u64,
            file_size,
        )?;
        check_table_bounds(
            "section_header_table",
            ehdr.e_shoff,
            ehdr.e_shentsize as u64,
            ehdr.e_shnum as u64,
            file_size,
        )?;

        let mut phdrs = Vec::with_capacity(ehdr.e_phnum as usize);
        for i in 0..ehdr.e_phnum as usize {
            let off = ehdr.e_phoff as usize + i * PHDR_SIZE;
            phdrs.push(bytes.pread_with::<Elf64Phdr>(off, LE)?);
        }

        let mut shdrs = Vec::with_capacity(ehdr.e_shnum as usize);
        for i in 0..ehdr.e_shnum as usize {
            let off = ehdr.e_shoff as usize + i * SHDR_SIZE;
            shdrs.push(bytes.pread_with::<Elf64Shdr>(off, LE)?);
        }

        let section_names = if (ehdr.e_shstrndx as usize) < shdrs.len() {
            let shstrtab = &shdrs[ehdr.e_shstrndx as usize];
            let start = shstrtab.sh_offset as usize;
            let end = start + shstrtab.sh_size as usize;
            let strs = bytes.get(start..end).ok_or(VmpError::TableOutOfBounds(".shstrtab"))?;
            shdrs
                .iter()
                .map(|s| read_c_str(strs, s.sh_name as usize).unwrap_or_default())
                .collect()
        } else {
            vec![String::new(); shdrs.len()]
        };

        Ok(Self {
            bytes,
            ehdr,
            phdrs,
            shdrs,
            section_names,
        })
    }

    pub fn file_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn section_by_name(&self, name: &str) -> Option<SectionView> {
        self.section_names.iter().position(|n| n == name).map(|index| SectionView {
            index,
            name: name.to_string(),
            header: self.shdrs[index],
        })
    }

    pub fn section_bytes(&self, section: &SectionView) -> &[u8] {
        if section.header.sh_type == SHT_NOBITS {
            return &[];
        }
        let start = section.header.sh_offset as usize;
        let end = start + section.header.sh_size as usize;
        &self.bytes[start..end]
    }

    /// Reads a `.dynamic` table as `(tag, val)` pairs, if a `.dynamic`
    /// section is present.
    pub fn dynamic_entries(&self) -> Result<Vec<Elf64Dyn>> {
        let Some(section) = self.section_by_name(".dynamic") else {
            return Ok(Vec::new());
        };
        let bytes = self.section_bytes(&section);
        let count = bytes.len() / DYN_SIZE;
        let mut out = Vec::with_capacity(count);
        for i in 0..count {
            out.push(bytes.pread_with::<Elf64Dyn>(i * DYN_SIZE, LE)?);
        }
        Ok(out)
    }

    fn resolve_symbol_in(&self, symtab: &str, strtab: &str, name: &str) -> Option<SymbolInfo> {
        let symtab_section = self.section_by_name(symtab)?;
        let strtab_section = self.section_by_name(strtab)?;
        let sym_bytes = self.section_bytes(&symtab_section);
        let str_bytes = self.section_bytes(&strtab_section);

        let count = sym_bytes.len() / SYM_SIZE;
        for i in 0..count {
            let sym: Elf64Sym = sym_bytes.pread_with(i * SYM_SIZE, LE).ok()?;
            let sym_name = read_c_str(str_bytes, sym.st_name as usize).unwrap_or_default();
            if sym_name == name {
                return Some(SymbolInfo {
                    value: sym.st_value,
                    size: sym.st_size,
                    shndx: sym.st_shndx,
                    sym_type: sym.sym_type(),
                    found: true,
                });
            }
        }
        None
    }

    /// Consults `.symtab`/`.strtab` first, falling back to
    /// `.dynsym`/`.dynstr`, per spec section 4.1.
    pub fn resolve_symbol(&self, name: &str) -> Option<SymbolInfo> {
        self.resolve_symbol_in(".symtab", ".strtab", name)
            .or_else(|| self.resolve_symbol_in(".dynsym", ".dynstr", name))
    }

    /// Maps a virtual address to a file offset using the first `PT_LOAD`
    /// segment, the single basis all address translation in this crate uses.
    pub fn vaddr_to_file_offset(&self, vaddr: u64) -> Result<u64> {
        let load = self
            .phdrs
            .iter()
            .find(|p| p.p_type == PT_LOAD)
            .ok_or(VmpError::UnmappedAddress(vaddr))?;
        if vaddr < load.p_vaddr || vaddr >= load.p_vaddr + load.p_memsz {
            return Err(VmpError::UnmappedAddress(vaddr));
        }
        Ok(load.p_offset + (vaddr - load.p_vaddr))
    }

    pub fn function_view(&self, symbol: &str) -> Result<FunctionView> {
        let info = self
            .resolve_symbol(symbol)
            .ok_or_else(|| VmpError::SymbolNotFound(symbol.to_string()))?;
        if info.size == 0 {
            return Err(VmpError::SymbolZeroSize(symbol.to_string()));
        }
        let file_offset = self.vaddr_to_file_offset(info.value)?;
        Ok(FunctionView {
            name: symbol.to_string(),
            file_offset,
            size: info.size,
            vaddr: info.value,
        })
    }

    /// All `STT_FUNC` names defined in `.dynsym` with nonzero size, for
    /// `--analyze-all`.
    pub fn defined_function_symbols(&self) -> Result<Vec<String>> {
        let Some(symtab_section) = self.section_by_name(".dynsym") else {
            return Ok(Vec::new());
        };
        let Some(strtab_section) = self.section_by_name(".dynstr") else {
            return Ok(Vec::new());
        };
        let sym_bytes = self.section_bytes(&symtab_section);
        let str_bytes = self.section_bytes(&strtab_section);
        let count = sym_bytes.len() / SYM_SIZE;

        let mut names = Vec::new();
        for i in 0..count {
            let sym: Elf64Sym = sym_bytes.pread_with(i * SYM_SIZE, LE)?;
            if sym.sym_type() != crate::elf::raw::STT_FUNC || sym.st_size == 0 || sym.st_name == 0 {
                continue;
            }
            if let Some(name) = read_c_str(str_bytes, sym.st_name as usize) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Renders a human-readable layout listing of the loaded image, ordered
    /// by ascending file offset: the ELF header, the program header table
    /// and its entries, then every section with file-resident bytes.
    pub fn describe_layout(&self) -> String {
        struct Region {
            start: u64,
            end: u64,
            name: String,
        }

        let mut regions = vec![Region {
            start: 0,
            end: EHDR_SIZE as u64 - 1,
            name: "elf_header".to_string(),
        }];

        let phdr_size = self.ehdr.e_phentsize as u64 * self.phdrs.len() as u64;
        regions.push(Region {
            start: self.ehdr.e_phoff,
            end: self.ehdr.e_phoff + phdr_size.saturating_sub(1),
            name: "program_header_table".to_string(),
        });

        for (i, p) in self.phdrs.iter().enumerate() {
            let type_name = match p.p_type {
                crate::elf::raw::PT_NULL => "NULL",
                crate::elf::raw::PT_LOAD => "Loadable Segment",
                crate::elf::raw::PT_DYNAMIC => "Dynamic Segment",
                crate::elf::raw::PT_PHDR => "Program Header",
                _ => "Unknown",
            };
            let perms = format!(
                "{}{}{}",
                if p.p_flags & crate::elf::raw::PF_R != 0 { "R" } else { "_" },
                if p.p_flags & crate::elf::raw::PF_W != 0 { "W" } else { "_" },
                if p.p_flags & crate::elf::raw::PF_X != 0 { "X" } else { "_" },
            );
            let entry_offset = self.ehdr.e_phoff + i as u64 * self.ehdr.e_phentsize as u64;
            regions.push(Region {
                start: entry_offset,
                end: entry_offset + self.ehdr.e_phentsize as u64 - 1,
                name: format!("program_table_element[{i:#04x}] ({perms}) {type_name}"),
            });
        }

        for (i, s) in self.shdrs.iter().enumerate() {
            if s.sh_size == 0 || s.sh_offset == 0 || s.sh_type == SHT_NOBITS {
                continue;
            }
            let name = self.section_names.get(i).map(String::as_str).unwrap_or("");
            let label = if name.is_empty() {
                format!("section[{i:#04x}]")
            } else {
                format!("section[{i:#04x}] {name}")
            };
            regions.push(Region {
                start: s.sh_offset,
                end: s.sh_offset + s.sh_size - 1,
                name: label,
            });
        }

        regions.sort_by_key(|r| r.start);

        let mut out = String::from("=== ELF File Layout (by address order) ===\n\n");
        for r in &regions {
            out.push_str(&format!(
                "  [{:#010x} - {:#010x}] ({} bytes) {}\n",
                r.start,
                r.end,
                r.end - r.start + 1,
                r.name
            ));
        }
        out
    }
}

fn read_c_str(buf: &[u8], offset: usize) -> Option<String> {
    let slice = buf.get(offset..)?;
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    Some(String::from_utf8_lossy(&slice[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scroll::Pwrite;

    fn minimal_elf() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x2000];
        let mut ident = [0u8; 16];
        ident[0..4].copy_from_slice(&ELFMAG);
        ident[4] = ELFCLASS64;
        ident[5] = ELFDATA2LSB;

        let ehdr = Elf64Ehdr {
            e_ident: ident,
            e_type: 3,
            e_machine: EM_AARCH64,
            e_version: 1,
            e_entry: 0,
            e_phoff: EHDR_SIZE as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: EHDR_SIZE as u16,
            e_phentsize: PHDR_SIZE as u16,
            e_phnum: 1,
            e_shentsize: SHDR_SIZE as u16,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        bytes.pwrite_with(ehdr, 0, LE).unwrap();

        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: 5,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0x2000,
            p_memsz: 0x2000,
            p_align: 0x1000,
        };
        bytes.pwrite_with(phdr, EHDR_SIZE, LE).unwrap();

        bytes
    }

    #[test]
    fn rejects_non_elf() {
        let err = ElfImage::from_bytes(vec![0u8; 64]).unwrap_err();
        assert!(matches!(err, VmpError::NotElf));
    }

    #[test]
    fn loads_minimal_valid_elf() {
        let image = ElfImage::from_bytes(minimal_elf()).unwrap();
        assert_eq!(image.phdrs.len(), 1);
        assert_eq!(image.vaddr_to_file_offset(0x100).unwrap(), 0x100);
    }

    #[test]
    fn rejects_table_out_of_bounds() {
        let mut bytes = minimal_elf();
        let mut ehdr: Elf64Ehdr = bytes.pread_with(0, LE).unwrap();
        ehdr.e_phnum = 200;
        bytes.pwrite_with(ehdr, 0, LE).unwrap();
        let err = ElfImage::from_bytes(bytes).unwrap_err();
        assert!(matches!(err, VmpError::TableOutOfBounds(_)));
    }

    #[test]
    fn unmapped_address_is_rejected() {
        let image = ElfImage::from_bytes(minimal_elf()).unwrap();
        assert!(image.vaddr_to_file_offset(0x10000).is_err());
    }
}
