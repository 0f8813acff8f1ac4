// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C6, alias half: appends routing-key export symbols to an
//! image's dynamic symbol table and rebuilds the hash sections that index
//! it, per spec section 4.6.

use std::collections::HashSet;

use scroll::{Pread, Pwrite, LE};

use crate::elf::image::ElfImage;
use crate::elf::raw::{
    Elf64Dyn, Elf64Sym, DT_GNU_HASH, DT_HASH, DT_STRTAB, DT_SYMTAB, DYN_SIZE, SHN_ABS, STB_GLOBAL,
    STT_FUNC, SYM_SIZE,
};
use crate::error::{Result, VmpError};
use crate::patchbay::hash::{build_gnu_hash_payload, build_sysv_hash_payload};

/// One symbol to append: a name the dynamic linker resolves, and the
/// routing key the VM engine reads out of `st_value` at load time.
#[derive(Debug, Clone)]
pub struct AliasPair {
    pub export_name: String,
    pub export_key: u64,
}

fn read_c_str(buf: &[u8], offset: usize) -> String {
    let Some(slice) = buf.get(offset..) else {
        return String::new();
    };
    let end = slice.iter().position(|&b| b == 0).unwrap_or(slice.len());
    String::from_utf8_lossy(&slice[..end]).into_owned()
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Appends `aliases` as new `.dynsym` entries and rebuilds `.gnu.hash` (and
/// `.hash`, if present), returning the complete rewritten image bytes.
///
/// Required sections: `.dynsym`, `.dynstr`, `.gnu.version`, `.gnu.hash`,
/// `.dynamic`. `.hash` is rebuilt only if the input already carries one.
/// New section data is appended past the current end of file and existing
/// section header entries are updated in place, so every `PT_LOAD` segment
/// is byte-for-byte preserved.
pub fn apply_aliases(image: &ElfImage, aliases: &[AliasPair]) -> Result<Vec<u8>> {
    let dynsym_sec = image.section_by_name(".dynsym").ok_or(VmpError::MissingSection(".dynsym"))?;
    let dynstr_sec = image.section_by_name(".dynstr").ok_or(VmpError::MissingSection(".dynstr"))?;
    let versym_sec =
        image.section_by_name(".gnu.version").ok_or(VmpError::MissingSection(".gnu.version"))?;
    let gnu_hash_sec =
        image.section_by_name(".gnu.hash").ok_or(VmpError::MissingSection(".gnu.hash"))?;
    let dynamic_sec = image.section_by_name(".dynamic").ok_or(VmpError::MissingSection(".dynamic"))?;
    let hash_sec = image.section_by_name(".hash");

    let versym_bytes = image.section_bytes(&versym_sec);
    if versym_bytes.len() % 2 != 0 {
        return Err(VmpError::VersymMisaligned);
    }

    let dynsym_bytes = image.section_bytes(&dynsym_sec);
    let dynstr_bytes = image.section_bytes(&dynstr_sec);
    let sym_count = dynsym_bytes.len() / SYM_SIZE;

    let mut new_dynsym: Vec<Elf64Sym> = Vec::with_capacity(sym_count + aliases.len());
    let mut existing_names: HashSet<String> = HashSet::new();
    for i in 0..sym_count {
        let sym: Elf64Sym = dynsym_bytes.pread_with(i * SYM_SIZE, LE)?;
        if sym.st_name != 0 {
            let name = read_c_str(dynstr_bytes, sym.st_name as usize);
            if !name.is_empty() {
                existing_names.insert(name);
            }
        }
        new_dynsym.push(sym);
    }

    let mut new_dynstr = dynstr_bytes.to_vec();
    let mut new_versym = versym_bytes.to_vec();
    let mut seen_in_batch: HashSet<&str> = HashSet::new();

    for pair in aliases {
        if !seen_in_batch.insert(pair.export_name.as_str()) {
            return Err(VmpError::DuplicateExport(pair.export_name.clone()));
        }
        if existing_names.contains(&pair.export_name) {
            return Err(VmpError::ExportCollision(pair.export_name.clone()));
        }

        let name_offset = new_dynstr.len() as u32;
        new_dynstr.extend_from_slice(pair.export_name.as_bytes());
        new_dynstr.push(0);

        new_dynsym.push(Elf64Sym {
            st_name: name_offset,
            st_info: Elf64Sym::make_info(STB_GLOBAL, STT_FUNC),
            st_other: 0,
            st_shndx: SHN_ABS,
            st_value: pair.export_key,
            st_size: 0,
        });

        new_versym.extend_from_slice(&1u16.to_le_bytes());
        existing_names.insert(pair.export_name.clone());
    }

    let names: Vec<String> = new_dynsym
        .iter()
        .map(|s| if s.st_name == 0 { String::new() } else { read_c_str(&new_dynstr, s.st_name as usize) })
        .collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();

    let gnu_hash_payload = build_gnu_hash_payload(&name_refs);
    let sysv_hash_payload = if hash_sec.is_some() {
        build_sysv_hash_payload(&name_refs)
    } else {
        Vec::new()
    };

    let mut new_dynsym_bytes = Vec::with_capacity(new_dynsym.len() * SYM_SIZE);
    new_dynsym_bytes.resize(new_dynsym.len() * SYM_SIZE, 0u8);
    for (i, sym) in new_dynsym.iter().enumerate() {
        new_dynsym_bytes.pwrite_with(*sym, i * SYM_SIZE, LE)?;
    }

    let mut out = image.bytes.clone();

    // Each appended block starts on an 8-byte boundary past the previous
    // end of file; PT_LOAD segments never cover this region, so none of
    // them need to move.
    struct Placed {
        section_index: usize,
        offset: usize,
        size: usize,
    }
    let mut placements = Vec::new();
    let mut place = |out: &mut Vec<u8>, section_index: usize, bytes: &[u8]| {
        let offset = align_up(out.len(), 8);
        out.resize(offset + bytes.len(), 0);
        out[offset..offset + bytes.len()].copy_from_slice(bytes);
        placements.push(Placed { section_index, offset, size: bytes.len() });
    };

    place(&mut out, dynstr_sec.index, &new_dynstr);
    place(&mut out, dynsym_sec.index, &new_dynsym_bytes);
    place(&mut out, versym_sec.index, &new_versym);
    place(&mut out, gnu_hash_sec.index, &gnu_hash_payload);
    if let Some(ref hs) = hash_sec {
        place(&mut out, hs.index, &sysv_hash_payload);
    }

    let mut new_shdr_addr = std::collections::HashMap::new();
    for p in &placements {
        let mut shdr = image.shdrs[p.section_index];
        shdr.sh_offset = p.offset as u64;
        shdr.sh_addr = p.offset as u64;
        shdr.sh_size = p.size as u64;
        new_shdr_addr.insert(p.section_index, shdr.sh_addr);
        let shdr_file_off = image.ehdr.e_shoff as usize + p.section_index * crate::elf::raw::SHDR_SIZE;
        out.pwrite_with(shdr, shdr_file_off, LE)?;
    }

    let dynamic_bytes = image.section_bytes(&dynamic_sec);
    let dyn_count = dynamic_bytes.len() / DYN_SIZE;
    for i in 0..dyn_count {
        let mut d: Elf64Dyn = dynamic_bytes.pread_with(i * DYN_SIZE, LE)?;
        let new_val = match d.d_tag {
            DT_STRTAB => new_shdr_addr.get(&dynstr_sec.index),
            DT_SYMTAB => new_shdr_addr.get(&dynsym_sec.index),
            DT_GNU_HASH => new_shdr_addr.get(&gnu_hash_sec.index),
            DT_HASH => hash_sec.as_ref().and_then(|hs| new_shdr_addr.get(&hs.index)),
            _ => None,
        };
        if let Some(&addr) = new_val {
            d.d_val = addr;
            let file_off = dynamic_sec.header.sh_offset as usize + i * DYN_SIZE;
            out.pwrite_with(d, file_off, LE)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::raw::{
        Elf64Ehdr, Elf64Phdr, Elf64Shdr, EHDR_SIZE, ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_AARCH64,
        PHDR_SIZE, PT_LOAD, SHDR_SIZE, SHT_DYNSYM, SHT_GNU_HASH, SHT_NULL,
    };

    fn build_image_with_one_export(name: &str) -> ElfImage {
        // Section layout (by index): 0 NULL, 1 .dynsym, 2 .dynstr,
        // 3 .gnu.version, 4 .gnu.hash, 5 .dynamic, 6 .shstrtab.
        let mut dynstr = vec![0u8]; // index 0 is always the empty string
        let name_off = dynstr.len() as u32;
        dynstr.extend_from_slice(name.as_bytes());
        dynstr.push(0);

        let mut dynsym = vec![0u8; SYM_SIZE]; // null entry
        let sym = Elf64Sym {
            st_name: name_off,
            st_info: Elf64Sym::make_info(STB_GLOBAL, STT_FUNC),
            st_other: 0,
            st_shndx: 1,
            st_value: 0x2000,
            st_size: 16,
        };
        let mut buf = vec![0u8; SYM_SIZE];
        buf.pwrite_with(sym, 0, LE).unwrap();
        dynsym.extend_from_slice(&buf);

        let versym: Vec<u8> = vec![0, 0, 1, 0]; // null + one export

        let gnu_hash = build_gnu_hash_payload(&["", name]);

        let dynamic_entries = vec![
            Elf64Dyn { d_tag: DT_SYMTAB, d_val: 0 },
            Elf64Dyn { d_tag: DT_STRTAB, d_val: 0 },
            Elf64Dyn { d_tag: DT_GNU_HASH, d_val: 0 },
            Elf64Dyn { d_tag: 0, d_val: 0 },
        ];
        let mut dynamic = vec![0u8; dynamic_entries.len() * DYN_SIZE];
        for (i, d) in dynamic_entries.iter().enumerate() {
            dynamic.pwrite_with(*d, i * DYN_SIZE, LE).unwrap();
        }

        let shstrtab = b"\0.dynsym\0.dynstr\0.gnu.version\0.gnu.hash\0.dynamic\0.shstrtab\0";

        let mut bytes = vec![0u8; 0x1000];
        let mut cursor = 0x1000usize;

        let mut push = |bytes: &mut Vec<u8>, data: &[u8]| -> u64 {
            let off = cursor as u64;
            bytes.resize(cursor + data.len(), 0);
            bytes[cursor..cursor + data.len()].copy_from_slice(data);
            cursor += data.len();
            off
        };

        let dynsym_off = push(&mut bytes, &dynsym);
        let dynstr_off = push(&mut bytes, &dynstr);
        let versym_off = push(&mut bytes, &versym);
        let gnu_hash_off = push(&mut bytes, &gnu_hash);
        let dynamic_off = push(&mut bytes, &dynamic);
        let shstrtab_off = push(&mut bytes, shstrtab);

        let shdrs = vec![
            Elf64Shdr { sh_type: SHT_NULL, ..Default::default() },
            Elf64Shdr {
                sh_name: 1,
                sh_type: SHT_DYNSYM,
                sh_offset: dynsym_off,
                sh_addr: dynsym_off,
                sh_size: dynsym.len() as u64,
                sh_link: 2,
                ..Default::default()
            },
            Elf64Shdr {
                sh_name: 9,
                sh_offset: dynstr_off,
                sh_addr: dynstr_off,
                sh_size: dynstr.len() as u64,
                ..Default::default()
            },
            Elf64Shdr {
                sh_name: 17,
                sh_offset: versym_off,
                sh_addr: versym_off,
                sh_size: versym.len() as u64,
                ..Default::default()
            },
            Elf64Shdr {
                sh_name: 30,
                sh_type: SHT_GNU_HASH,
                sh_offset: gnu_hash_off,
                sh_addr: gnu_hash_off,
                sh_size: gnu_hash.len() as u64,
                ..Default::default()
            },
            Elf64Shdr {
                sh_name: 40,
                sh_offset: dynamic_off,
                sh_addr: dynamic_off,
                sh_size: dynamic.len() as u64,
                ..Default::default()
            },
            Elf64Shdr {
                sh_name: 49,
                sh_offset: shstrtab_off,
                sh_addr: shstrtab_off,
                sh_size: shstrtab.len() as u64,
                ..Default::default()
            },
        ];

        let shoff = cursor as u64;
        cursor += shdrs.len() * SHDR_SIZE;
        bytes.resize(cursor, 0);
        for (i, s) in shdrs.iter().enumerate() {
            bytes.pwrite_with(*s, shoff as usize + i * SHDR_SIZE, LE).unwrap();
        }

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
            e_shoff: shoff,
            e_flags: 0,
            e_ehsize: EHDR_SIZE as u16,
            e_phentsize: PHDR_SIZE as u16,
            e_phnum: 1,
            e_shentsize: SHDR_SIZE as u16,
            e_shnum: shdrs.len() as u16,
            e_shstrndx: 6,
        };
        bytes.pwrite_with(ehdr, 0, LE).unwrap();

        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: 5,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: bytes.len() as u64,
            p_memsz: bytes.len() as u64,
            p_align: 0x1000,
        };
        bytes.pwrite_with(phdr, EHDR_SIZE, LE).unwrap();

        ElfImage::from_bytes(bytes).unwrap()
    }

    #[test]
    fn appends_alias_and_preserves_pt_load() {
        let image = build_image_with_one_export("existing_fn");
        let aliases = vec![AliasPair { export_name: "vm_entry_0".to_string(), export_key: 0xAABB }];
        let out = apply_aliases(&image, &aliases).unwrap();

        let patched = ElfImage::from_bytes(out).unwrap();
        assert_eq!(patched.phdrs, image.phdrs);

        let sym = patched.resolve_symbol("vm_entry_0").unwrap();
        assert_eq!(sym.value, 0xAABB);

        let original = patched.resolve_symbol("existing_fn").unwrap();
        assert_eq!(original.value, 0x2000);
    }

    #[test]
    fn rejects_duplicate_within_batch() {
        let image = build_image_with_one_export("existing_fn");
        let aliases = vec![
            AliasPair { export_name: "dup".to_string(), export_key: 1 },
            AliasPair { export_name: "dup".to_string(), export_key: 2 },
        ];
        let err = apply_aliases(&image, &aliases).unwrap_err();
        assert!(matches!(err, VmpError::DuplicateExport(_)));
    }

    #[test]
    fn rejects_collision_with_existing_export() {
        let image = build_image_with_one_export("existing_fn");
        let aliases = vec![AliasPair { export_name: "existing_fn".to_string(), export_key: 1 }];
        let err = apply_aliases(&image, &aliases).unwrap_err();
        assert!(matches!(err, VmpError::ExportCollision(_)));
    }
}
