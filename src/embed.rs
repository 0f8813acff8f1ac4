// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C8: appends an expanded bundle library as a trailing payload
//! inside a host ELF, sealed by a CRC32-checked footer. Re-embedding is
//! idempotent: a payload already embedded behind a verified footer is
//! stripped before the new one is appended, so `base` always points at the
//! host's own bytes.

use std::path::Path;

use scroll::{Pread, Pwrite, LE};

use crate::error::{Result, VmpError};
use crate::io_util::write_atomic;

pub const FOOTER_MAGIC: u32 = 0x3445_4D56; // "VME4"
pub const FOOTER_VERSION: u32 = 1;
const FOOTER_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy)]
pub struct EmbeddedPayloadFooter {
    pub magic: u32,
    pub version: u32,
    pub payload_size: u64,
    pub payload_crc32: u32,
    pub reserved: u32,
}

/// Appends `payload` to `host`'s bytes behind a fresh footer, writing the
/// result to `out`. If `host` already ends in a footer whose magic and CRC
/// verify, its payload is stripped first so repeated embedding never grows
/// the file unboundedly.
pub fn embed(host_path: &Path, payload_path: &Path, out_path: &Path) -> Result<()> {
    let host_bytes = std::fs::read(host_path)?;
    let payload = std::fs::read(payload_path)?;

    let base = match read_footer(&host_bytes) {
        Ok(Some((footer, base))) => {
            let _ = footer;
            base
        }
        _ => host_bytes.len() as u64,
    };

    let mut out = host_bytes[..base as usize].to_vec();
    out.extend_from_slice(&payload);

    let footer = EmbeddedPayloadFooter {
        magic: FOOTER_MAGIC,
        version: FOOTER_VERSION,
        payload_size: payload.len() as u64,
        payload_crc32: crc32fast::hash(&payload),
        reserved: 0,
    };
    write_footer(&mut out, &footer)?;

    write_atomic(out_path, &out)
}

fn write_footer(out: &mut Vec<u8>, footer: &EmbeddedPayloadFooter) -> Result<()> {
    let off = out.len();
    out.resize(off + FOOTER_SIZE as usize, 0);
    out.pwrite_with(footer.magic, off, LE)?;
    out.pwrite_with(footer.version, off + 4, LE)?;
    out.pwrite_with(footer.payload_size, off + 8, LE)?;
    out.pwrite_with(footer.payload_crc32, off + 16, LE)?;
    out.pwrite_with(footer.reserved, off + 20, LE)?;
    Ok(())
}

/// Parses the trailing footer, if any, and verifies its CRC against the
/// payload bytes it claims. Returns `(footer, base)` where `base` is the
/// file offset the payload starts at. `Ok(None)` means the tail is not a
/// recognizable footer (not an error: the caller treats the whole file as
/// host bytes). A recognized magic/version with a failing CRC is fatal.
fn read_footer(bytes: &[u8]) -> Result<Option<(EmbeddedPayloadFooter, u64)>> {
    if (bytes.len() as u64) < FOOTER_SIZE {
        return Ok(None);
    }
    let footer_off = bytes.len() - FOOTER_SIZE as usize;
    let magic: u32 = bytes.pread_with(footer_off, LE)?;
    if magic != FOOTER_MAGIC {
        return Ok(None);
    }
    let version: u32 = bytes.pread_with(footer_off + 4, LE)?;
    if version != FOOTER_VERSION {
        return Err(VmpError::CorruptEmbed("version mismatch"));
    }
    let payload_size: u64 = bytes.pread_with(footer_off + 8, LE)?;
    let payload_crc32: u32 = bytes.pread_with(footer_off + 16, LE)?;
    let reserved: u32 = bytes.pread_with(footer_off + 20, LE)?;

    if payload_size > footer_off as u64 {
        return Err(VmpError::CorruptEmbed("payload_size exceeds file bounds"));
    }
    let base = footer_off as u64 - payload_size;
    let payload = &bytes[base as usize..footer_off];
    if crc32fast::hash(payload) != payload_crc32 {
        return Err(VmpError::CorruptEmbed("CRC mismatch"));
    }

    Ok(Some((
        EmbeddedPayloadFooter { magic, version, payload_size, payload_crc32, reserved },
        base,
    )))
}

/// Extracts the verified payload bytes from an already-embedded file.
pub fn extract_payload(bytes: &[u8]) -> Result<&[u8]> {
    let (_, base) = read_footer(bytes)?.ok_or(VmpError::CorruptEmbed("no footer found"))?;
    let footer_off = bytes.len() - FOOTER_SIZE as usize;
    Ok(&bytes[base as usize..footer_off])
}

#[cfg(test)]
mod tests {
    use super::*;

    // S3 from spec section 8.
    #[test]
    fn scenario_s3_embed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host.bin");
        let payload = dir.path().join("payload.bin");
        let out = dir.path().join("out.bin");
        std::fs::write(&host, vec![0u8; 64]).unwrap();
        std::fs::write(&payload, [0xAA, 0xBB, 0xCC]).unwrap();

        embed(&host, &payload, &out).unwrap();
        let out_bytes = std::fs::read(&out).unwrap();
        assert_eq!(out_bytes.len(), 64 + 3 + 24);

        let footer_off = 67usize;
        let payload_size: u64 = out_bytes.pread_with(footer_off + 8, LE).unwrap();
        let crc: u32 = out_bytes.pread_with(footer_off + 16, LE).unwrap();
        assert_eq!(payload_size, 3);
        assert_eq!(crc, 0xAE6B_6A07);
    }

    #[test]
    fn re_embedding_replaces_rather_than_grows() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host.bin");
        let payload_a = dir.path().join("a.bin");
        let payload_b = dir.path().join("b.bin");
        let out = dir.path().join("out.bin");
        std::fs::write(&host, vec![0u8; 32]).unwrap();
        std::fs::write(&payload_a, vec![1u8; 10]).unwrap();
        std::fs::write(&payload_b, vec![2u8; 5]).unwrap();

        embed(&host, &payload_a, &out).unwrap();
        embed(&out, &payload_b, &out).unwrap();

        let final_bytes = std::fs::read(&out).unwrap();
        assert_eq!(final_bytes.len(), 32 + 5 + 24);
        assert_eq!(extract_payload(&final_bytes).unwrap(), vec![2u8; 5]);
    }

    #[test]
    fn detects_corrupt_crc() {
        let dir = tempfile::tempdir().unwrap();
        let host = dir.path().join("host.bin");
        let payload = dir.path().join("payload.bin");
        let out = dir.path().join("out.bin");
        std::fs::write(&host, vec![0u8; 16]).unwrap();
        std::fs::write(&payload, [1, 2, 3]).unwrap();
        embed(&host, &payload, &out).unwrap();

        let mut bytes = std::fs::read(&out).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let err = extract_payload(&bytes).unwrap_err();
        assert!(matches!(err, VmpError::CorruptEmbed(_)));
    }
}
