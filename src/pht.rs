// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C7: surgical program header table relocation. Moves the PHT to
//! a fixed file anchor and appends a rescue `PT_LOAD` segment that covers
//! it, so the relocated table is itself mapped at load time. Per spec
//! section 4.7, existing segments are never rewritten in place.

use scroll::{Pwrite, LE};

use crate::elf::image::ElfImage;
use crate::elf::raw::{Elf64Ehdr, Elf64Phdr, EHDR_SIZE, PHDR_SIZE, PT_LOAD, PT_NULL, PT_PHDR};
use crate::error::{Result, VmpError};

const PAGE_SIZE: u64 = 0x1000;
const NEW_PHT_OFFSET: u64 = 0x3000;

/// Relocates `image`'s program header table to [`NEW_PHT_OFFSET`] and
/// appends `extra_entries` `PT_NULL` slots, the last of which becomes a
/// read-only rescue `PT_LOAD` covering the relocated table. Returns the
/// complete rewritten file bytes; `image` itself is untouched.
pub fn relocate_and_expand_pht(image: &ElfImage, extra_entries: u16) -> Result<Vec<u8>> {
    if NEW_PHT_OFFSET % PAGE_SIZE != 0 {
        return Err(VmpError::PhtAnchorMisaligned(NEW_PHT_OFFSET));
    }
    if extra_entries == 0 {
        return Err(VmpError::CliBadArgument("extra_entries must be >= 1".to_string()));
    }

    let old_ph_num = image.phdrs.len() as u16;
    let new_ph_num = old_ph_num + extra_entries;
    let new_pht_size = new_ph_num as u64 * PHDR_SIZE as u64;

    let mut new_pht: Vec<Elf64Phdr> = Vec::with_capacity(new_ph_num as usize);
    new_pht.extend_from_slice(&image.phdrs);
    for _ in old_ph_num..new_ph_num {
        new_pht.push(Elf64Phdr { p_type: PT_NULL, ..Default::default() });
    }

    let rescue_idx = new_pht.len() - 1;
    new_pht[rescue_idx] = Elf64Phdr {
        p_type: PT_LOAD,
        p_flags: crate::elf::raw::PF_R,
        p_offset: NEW_PHT_OFFSET,
        p_vaddr: NEW_PHT_OFFSET,
        p_paddr: NEW_PHT_OFFSET,
        p_filesz: new_pht_size,
        p_memsz: new_pht_size,
        p_align: PAGE_SIZE,
    };

    if let Some(pt_phdr) = new_pht[..old_ph_num as usize].iter_mut().find(|p| p.p_type == PT_PHDR) {
        pt_phdr.p_offset = NEW_PHT_OFFSET;
        pt_phdr.p_vaddr = NEW_PHT_OFFSET;
        pt_phdr.p_paddr = NEW_PHT_OFFSET;
        pt_phdr.p_filesz = new_pht_size;
        pt_phdr.p_memsz = new_pht_size;
    }

    let new_file_size = NEW_PHT_OFFSET + new_pht_size;
    if NEW_PHT_OFFSET + new_pht_size > new_file_size {
        return Err(VmpError::PhtOutOfBounds);
    }

    let mut out = vec![0u8; new_file_size as usize];
    let old_file_size = image.file_size();
    let copy_size = std::cmp::min(old_file_size, NEW_PHT_OFFSET) as usize;
    out[..copy_size].copy_from_slice(&image.bytes[..copy_size]);

    let mut off = NEW_PHT_OFFSET as usize;
    for phdr in &new_pht {
        out.pwrite_with(*phdr, off, LE)?;
        off += PHDR_SIZE;
    }

    let mut ehdr: Elf64Ehdr = {
        use scroll::Pread;
        out.pread_with(0, LE)?
    };
    ehdr.e_phoff = NEW_PHT_OFFSET;
    ehdr.e_phnum = new_ph_num;
    out.pwrite_with(ehdr, 0, LE)?;

    if ehdr.e_phoff + new_pht_size > out.len() as u64 {
        return Err(VmpError::PhtOutOfBounds);
    }

    debug_assert_eq!(EHDR_SIZE, 64);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::raw::{ELFCLASS64, ELFDATA2LSB, ELFMAG, EM_AARCH64, SHDR_SIZE};

    fn minimal_elf(file_size: usize) -> ElfImage {
        let mut bytes = vec![0u8; file_size];
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
            e_phnum: 2,
            e_shentsize: SHDR_SIZE as u16,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        bytes.pwrite_with(ehdr, 0, LE).unwrap();

        let phdr_phdr = Elf64Phdr {
            p_type: PT_PHDR,
            p_flags: crate::elf::raw::PF_R,
            p_offset: EHDR_SIZE as u64,
            p_vaddr: EHDR_SIZE as u64,
            p_paddr: EHDR_SIZE as u64,
            p_filesz: 2 * PHDR_SIZE as u64,
            p_memsz: 2 * PHDR_SIZE as u64,
            p_align: 8,
        };
        bytes.pwrite_with(phdr_phdr, EHDR_SIZE, LE).unwrap();

        let load = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: 5,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: file_size as u64,
            p_memsz: file_size as u64,
            p_align: 0x1000,
        };
        bytes.pwrite_with(load, EHDR_SIZE + PHDR_SIZE, LE).unwrap();

        ElfImage::from_bytes(bytes).unwrap()
    }

    #[test]
    fn relocates_and_appends_rescue_load() {
        let image = minimal_elf(0x1000);
        let out = relocate_and_expand_pht(&image, 1).unwrap();
        let patched = ElfImage::from_bytes(out).unwrap();

        assert_eq!(patched.ehdr.e_phoff, NEW_PHT_OFFSET);
        assert_eq!(patched.ehdr.e_phnum, 3);
        assert_eq!(patched.phdrs.len(), 3);

        let rescue = patched.phdrs[2];
        assert_eq!(rescue.p_type, PT_LOAD);
        assert_eq!(rescue.p_offset, NEW_PHT_OFFSET);
        assert_eq!(rescue.p_flags, crate::elf::raw::PF_R);

        // The original PT_LOAD segment is untouched.
        assert_eq!(patched.phdrs[1], image.phdrs[1]);
    }

    #[test]
    fn updates_pt_phdr_when_present() {
        let image = minimal_elf(0x1000);
        let out = relocate_and_expand_pht(&image, 1).unwrap();
        let patched = ElfImage::from_bytes(out).unwrap();
        let pt_phdr = patched.phdrs[0];
        assert_eq!(pt_phdr.p_type, PT_PHDR);
        assert_eq!(pt_phdr.p_offset, NEW_PHT_OFFSET);
        assert_eq!(pt_phdr.p_filesz, 3 * PHDR_SIZE as u64);
    }

    #[test]
    fn rejects_zero_extra_entries() {
        let image = minimal_elf(0x1000);
        let err = relocate_and_expand_pht(&image, 0).unwrap_err();
        assert!(matches!(err, VmpError::CliBadArgument(_)));
    }
}
