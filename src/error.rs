// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use thiserror::Error;

/// Unified error type for the AArch64 VM protection toolchain.
#[derive(Debug, Error)]
pub enum VmpError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument: {0}")]
    CliBadArgument(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("capstone disassembly engine error: {0}")]
    Capstone(#[from] capstone::Error),

    // --- C1 ELF Reader ---
    #[error("not an ELF file")]
    NotElf,

    #[error("unsupported ELF class (only ELF64 is supported)")]
    UnsupportedClass,

    #[error("unsupported ELF byte order (only little-endian is supported)")]
    UnsupportedEndian,

    #[error("unsupported machine (only EM_AARCH64 is supported)")]
    UnsupportedMachine,

    #[error("table {0} offset/size exceeds file bounds")]
    TableOutOfBounds(&'static str),

    #[error("section not found: {0}")]
    SectionNotFound(String),

    #[error("symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("symbol has zero size: {0}")]
    SymbolZeroSize(String),

    #[error("symbol virtual address does not map to any PT_LOAD segment: {0:#x}")]
    UnmappedAddress(u64),

    // --- C2 Function Lifter ---
    #[error("unsupported instruction `{0}` at pc={1:#x}")]
    UnsupportedInstruction(String, u64),

    #[error("disassembly failed at pc={0:#x}")]
    DisassemblyFailed(u64),

    #[error("invalid operand for `{0}` at pc={1:#x}")]
    InvalidOperand(String, u64),

    #[error("external branch target {0:#x} was not collected during translation")]
    AddressNotInTable(u64),

    #[error("function view has not been translated yet")]
    NotTranslated,

    // --- C3 Bytecode Data Model ---
    #[error("validation failed: {0}")]
    Validate(String),

    #[error("round-trip mismatch in field `{0}`: lhs={1} rhs={2}")]
    EncodedMismatch(&'static str, String, String),

    // --- C4 6-bit Codec ---
    #[error("malformed varint (too many continuation groups)")]
    MalformedVarint,

    #[error("premature end of stream while reading field `{0}`")]
    Truncated(&'static str),

    #[error("value {0} does not fit in 32 bits")]
    VarintOverflow(u64),

    // --- C5 Bundle Container ---
    #[error("bundle payload list is empty")]
    BundleEmptyPayloads,

    #[error("bundle payload has fun_addr == 0")]
    BundleZeroFunAddr,

    #[error("bundle payload bytes are empty for fun_addr={0:#x}")]
    BundleEmptyPayload(u64),

    #[error("duplicate fun_addr in bundle payloads: {0:#x}")]
    BundleDuplicateFunAddr(u64),

    #[error("no bundle footer found in input file")]
    BundleNotFound,

    #[error("bundle entry out of bounds: offset={0} size={1}")]
    BundleEntryOutOfBounds(u64, u64),

    // --- C6 Patchbay Engine ---
    #[error("missing required section: {0}")]
    MissingSection(&'static str),

    #[error("duplicate export name: {0}")]
    DuplicateExport(String),

    #[error("export name collides with existing vmengine export: {0}")]
    ExportCollision(String),

    #[error(".gnu.version size is not a multiple of 2 bytes")]
    VersymMisaligned,

    #[error("section layout conflict: existing PT_LOAD segment cannot be preserved")]
    LayoutConflict,

    // --- C7 PHT Relocator ---
    #[error("PHT anchor offset {0:#x} is not page-aligned")]
    PhtAnchorMisaligned(u64),

    #[error("relocated program header table exceeds output file size")]
    PhtOutOfBounds,

    // --- C8 Host Embed ---
    #[error("embedded payload footer is corrupt: {0}")]
    CorruptEmbed(&'static str),

    // --- pipeline / CLI glue ---
    #[error("no defined dynamic exports found: {0}")]
    CollectError(String),
}

pub type Result<T> = std::result::Result<T, VmpError>;
