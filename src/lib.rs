// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Offline lifting and dynamic-symbol patching for AArch64 ELF shared
//! libraries.
//!
//! This crate reads a compiled `.so`, disassembles selected exported
//! functions with the [capstone](https://docs.rs/capstone) AArch64 backend,
//! and lifts each one into a closed-whitelist register-machine bytecode
//! ([`FunctionData`]). Lifted functions are packaged into an "expanded"
//! shared library bundle ([`bundle`]) that a companion VM engine loads at
//! runtime, and a host image's `.dynsym`/`.dynstr`/`.gnu.version`/
//! `.gnu.hash` tables can be grafted with alias exports ([`patchbay`]) whose
//! `st_value` carries an opaque routing key rather than a real code address.
//!
//! # Modules
//!
//! * [`elf`] - raw ELF64 struct definitions and a read-only image loader
//!   (component C1).
//! * [`function`] - disassembly into the bytecode IR, and dump rendering
//!   (components C2/C3).
//! * [`codec`] - the bit-packed 6-bit wire encoding for bytecode fields
//!   (component C4).
//! * [`bundle`] - the expanded-library container format (component C5).
//! * [`patchbay`] - dynamic symbol table alias injection and hash table
//!   rebuilding (component C6).
//! * [`pht`] - program header table relocation (component C7).
//! * [`embed`] - appending an expanded bundle as a trailing payload of a
//!   host library (component C8).
//!
//! Every operation here is a pure, synchronous transformation over bytes
//! already on disk; nothing in this crate touches the network or spawns a
//! toolchain.

pub mod bundle;
pub mod codec;
pub mod elf;
pub mod embed;
mod error;
pub use error::*;
pub mod function;
pub mod io_util;
pub mod patchbay;
pub mod pht;

pub use bundle::{Bundle, BundleEntry, SoBinPayload};
pub use elf::{ElfImage, FunctionView, SectionView, SymbolInfo};
pub use function::{dump, DumpMode, FunctionData, LiftedFunction, Translation};
pub use patchbay::AliasPair;
