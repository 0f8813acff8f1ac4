// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C2: disassembles a [`FunctionView`]'s bytes and lifts them into
//! the typed register-machine IR that [`FunctionData`] packages.

use std::collections::{BTreeMap, HashMap};

use capstone::prelude::*;
use once_cell::sync::Lazy;

use crate::elf::FunctionView;
use crate::error::{Result, VmpError};
use crate::function::data::FunctionData;
use crate::function::opcode::*;

/// One instruction's lifted register-machine words, plus its disassembly
/// text for dumps.
#[derive(Debug, Clone)]
struct LiftedInsn {
    words: Vec<u32>,
    text: String,
}

/// The cached result of [`LiftedFunction::prepare_translation`].
#[derive(Debug, Clone, Default)]
pub struct Translation {
    pub register_ids: Vec<u32>,
    pub type_tags: Vec<u32>,
    pub first_inst_opcodes: Vec<u32>,
    pub external_init_words: Vec<u32>,
    pub init_value_words: Vec<u32>,
    inst_by_addr: BTreeMap<u64, LiftedInsn>,
    /// Local branch table: `branch_words[id]` is the target pc.
    pub branch_words: Vec<u32>,
    /// External call targets this function references, in discovery order.
    /// Stays in raw-address form until [`LiftedFunction::remap_bl_to_shared`]
    /// rewrites the `OP_BL` operand words that index into it.
    pub branch_addrs: Vec<u64>,
    remapped: bool,
}

impl Translation {
    pub fn inst_words(&self) -> Vec<u32> {
        self.inst_by_addr.values().flat_map(|i| i.words.clone()).collect()
    }

    pub fn asm_lines(&self) -> impl Iterator<Item = (u64, &str)> {
        self.inst_by_addr.iter().map(|(&addr, insn)| (addr, insn.text.as_str()))
    }
}

/// A [`FunctionView`] plus its lazily-attached translation cache.
pub struct LiftedFunction {
    pub view: FunctionView,
    translation: Option<Translation>,
}

impl LiftedFunction {
    pub fn new(view: FunctionView) -> Self {
        Self { view, translation: None }
    }

    pub fn translation(&self) -> Result<&Translation> {
        self.translation.as_ref().ok_or(VmpError::NotTranslated)
    }

    /// Disassembles `code` (the function's own bytes) and builds the cached
    /// [`Translation`]. Idempotent: a second call is a no-op.
    pub fn prepare_translation(&mut self, code: &[u8]) -> Result<()> {
        if self.translation.is_some() {
            return Ok(());
        }

        let cs = Capstone::new()
            .arm64()
            .mode(arch::arm64::ArchMode::Arm)
            .build()
            .map_err(VmpError::Capstone)?;

        let pc = self.view.file_offset;
        let insns = cs
            .disasm_all(code, pc)
            .map_err(|_| VmpError::DisassemblyFailed(pc))?;

        let func_start = self.view.file_offset;
        let func_end = func_start + self.view.size;

        let mut t = Translation::default();
        let mut reg_ids: Vec<String> = Vec::new();

        for insn in insns.iter() {
            let addr = insn.address();
            let mnemonic = insn.mnemonic().unwrap_or("").to_ascii_lowercase();
            let op_str = insn.op_str().unwrap_or("");

            if mnemonic.is_empty() {
                return Err(VmpError::DisassemblyFailed(addr));
            }

            let text = format!("{mnemonic} {op_str}").trim().to_string();
            let reg = first_register_token(op_str).map(|r| register_id(&mut reg_ids, &r));

            let words = if is_branch_mnemonic(&mnemonic) {
                lift_branch(&mnemonic, op_str, addr, func_start, func_end, &mut t)?
            } else if let Some(op) = base_opcode_for_mnemonic(&mnemonic) {
                vec![op, reg.unwrap_or(0)]
            } else {
                return Err(VmpError::UnsupportedInstruction(mnemonic, addr));
            };

            t.inst_by_addr.insert(addr, LiftedInsn { words, text });
        }

        t.register_ids = (0..reg_ids.len() as u32).collect();
        // One generic 64-bit-integer type tag per register; the lifter does
        // not currently distinguish floating point or vector registers.
        t.type_tags = vec![0u32; reg_ids.len()];

        self.translation = Some(t);
        Ok(())
    }

    pub fn shared_branch_addrs(&self) -> Result<&[u64]> {
        Ok(&self.translation()?.branch_addrs)
    }

    /// Rewrites every `OP_BL` operand word from a local index into this
    /// function's own `branch_addrs` to an index into `shared`.
    pub fn remap_bl_to_shared(&mut self, shared: &[u64]) -> Result<()> {
        let t = self.translation.as_mut().ok_or(VmpError::NotTranslated)?;
        if t.remapped {
            return Ok(());
        }
        for insn in t.inst_by_addr.values_mut() {
            if insn.words.len() == 2 && insn.words[0] == OP_BL {
                let local_idx = insn.words[1] as usize;
                let addr = *t
                    .branch_addrs
                    .get(local_idx)
                    .ok_or(VmpError::AddressNotInTable(0))?;
                let shared_idx = shared
                    .iter()
                    .position(|&a| a == addr)
                    .ok_or(VmpError::AddressNotInTable(addr))?;
                insn.words[1] = shared_idx as u32;
            }
        }
        t.remapped = true;
        Ok(())
    }

    /// Assembles the canonical [`FunctionData`] record from the cached
    /// translation. `remap_bl_to_shared` should run first so `OP_BL`
    /// operands already carry shared-table indices.
    pub fn to_function_data(&self) -> Result<FunctionData> {
        let t = self.translation()?;
        let inst_words = t.inst_words();

        let data = FunctionData {
            marker: 0,
            register_count: t.register_ids.len() as u32,
            first_inst_count: t.first_inst_opcodes.len() as u32,
            first_inst_opcodes: t.first_inst_opcodes.clone(),
            external_init_words: t.external_init_words.clone(),
            type_count: t.type_tags.len() as u32,
            type_tags: t.type_tags.clone(),
            init_value_count: t.first_inst_opcodes.len() as u32,
            init_value_words: t.init_value_words.clone(),
            inst_count: inst_words.len() as u32,
            inst_words,
            branch_count: t.branch_words.len() as u32,
            branch_words: t.branch_words.clone(),
            branch_addrs: t.branch_addrs.clone(),
            function_offset: self.view.file_offset,
        };
        data.validate()?;
        Ok(data)
    }
}

fn register_id(known: &mut Vec<String>, name: &str) -> u32 {
    if let Some(pos) = known.iter().position(|r| r == name) {
        pos as u32
    } else {
        known.push(name.to_string());
        (known.len() - 1) as u32
    }
}

/// Pulls the first AArch64 register token (`x0`, `w3`, `sp`, ...) out of an
/// operand string such as `"x0, x1, #4"`.
fn first_register_token(op_str: &str) -> Option<String> {
    let first = op_str.split(',').next()?.trim();
    let lower = first.to_ascii_lowercase();
    let is_reg = lower.starts_with('x')
        || lower.starts_with('w')
        || lower == "sp"
        || lower == "lr"
        || lower == "xzr"
        || lower == "wzr";
    is_reg.then_some(lower)
}

/// Extracts the last `#0x...`/`#-0x...` hex literal in an operand string,
/// which for every whitelisted branch form is the branch target.
fn last_hex_immediate(op_str: &str) -> Option<u64> {
    let mut found = None;
    for token in op_str.split(|c| c == ',' || c == ' ') {
        let token = token.trim();
        if let Some(hex) = token.strip_prefix("#0x") {
            if let Ok(v) = u64::from_str_radix(hex, 16) {
                found = Some(v);
            }
        }
    }
    found
}

/// The closed instruction whitelist from spec section 4.2, built once and
/// shared by every [`LiftedFunction`]: each supported mnemonic maps to the
/// runtime opcode its class lifts to. Built lazily the same way the
/// teacher's certificate-trust tables are, since it is pure policy data with
/// no per-call construction cost worth paying twice.
static MNEMONIC_OPCODES: Lazy<HashMap<&'static str, u32>> = Lazy::new(|| {
    const ARITHMETIC: &[&str] = &["add", "sub", "adds", "subs", "mul", "madd", "msub", "udiv", "sdiv"];
    const LOGIC: &[&str] = &["and", "orr", "eor", "bic", "orn", "ands"];
    const SHIFTS: &[&str] = &["lsl", "lsr", "asr", "ror", "extr"];
    const LOADS: &[&str] = &[
        "ldr", "ldrb", "ldrh", "ldrsw", "ldrsb", "ldrsh", "ldp", "ldur", "ldurb", "ldurh", "ldursw",
        "ldursb", "ldursh", "ldaxr", "ldxr", "ldar", "ldarb", "ldarh",
    ];
    const STORES: &[&str] = &[
        "str", "strb", "strh", "stp", "stur", "sturb", "sturh", "stlxr", "stxr", "stlr", "stlrb",
        "stlrh",
    ];
    const MOVES: &[&str] = &["mov", "movz", "movk", "movn", "movi"];
    const COMPARES: &[&str] = &["cmp", "cmn", "tst", "ccmp"];
    const CONDITIONAL_SELECTS: &[&str] = &["csel", "csinc", "cneg", "cinc", "csetm"];
    const BITFIELD: &[&str] = &["sbfm", "ubfm", "bfm"];
    const TRAP_NOP: &[&str] = &["nop", "hint", "clrex", "svc", "brk", "rev", "rev16"];

    let mut m = HashMap::new();
    for &mnemonic in ARITHMETIC.iter().chain(LOGIC).chain(SHIFTS) {
        m.insert(mnemonic, OP_BINARY);
    }
    for &mnemonic in LOADS {
        m.insert(mnemonic, OP_READ);
    }
    for &mnemonic in STORES {
        m.insert(mnemonic, OP_WRITE);
    }
    for &mnemonic in MOVES {
        m.insert(mnemonic, OP_MOV);
    }
    for &mnemonic in COMPARES {
        m.insert(mnemonic, OP_CMP);
    }
    for &mnemonic in CONDITIONAL_SELECTS {
        m.insert(mnemonic, OP_SELECT);
    }
    for &mnemonic in BITFIELD {
        m.insert(mnemonic, OP_BITCAST);
    }
    for &mnemonic in TRAP_NOP {
        m.insert(mnemonic, OP_NOP);
    }
    m.insert("adr", OP_LEA);
    m.insert("adrp", OP_ADRP);
    m
});

fn base_opcode_for_mnemonic(mnemonic: &str) -> Option<u32> {
    MNEMONIC_OPCODES.get(mnemonic).copied()
}

fn is_branch_mnemonic(mnemonic: &str) -> bool {
    matches!(mnemonic, "b" | "bl" | "blr" | "br" | "cbz" | "cbnz" | "tbz" | "tbnz" | "ret")
        || mnemonic.starts_with("b.")
}

/// Whether `mnemonic` (already lowercased) is in the closed whitelist this
/// lifter can translate. Used by coverage reporting to classify raw
/// disassembly independent of a specific function's translation outcome.
pub fn is_supported_mnemonic(mnemonic: &str) -> bool {
    is_branch_mnemonic(mnemonic) || base_opcode_for_mnemonic(mnemonic).is_some()
}

fn lift_branch(
    mnemonic: &str,
    op_str: &str,
    addr: u64,
    func_start: u64,
    func_end: u64,
    t: &mut Translation,
) -> Result<Vec<u32>> {
    if mnemonic == "ret" {
        return Ok(vec![OP_RETURN, 0]);
    }
    if mnemonic == "blr" {
        let reg = first_register_token(op_str)
            .ok_or_else(|| VmpError::InvalidOperand(mnemonic.to_string(), addr))?;
        let mut regs = Vec::new();
        return Ok(vec![OP_CALL_INDIRECT, register_id(&mut regs, &reg)]);
    }
    if mnemonic == "br" {
        let reg = first_register_token(op_str)
            .ok_or_else(|| VmpError::InvalidOperand(mnemonic.to_string(), addr))?;
        let mut regs = Vec::new();
        return Ok(vec![OP_BRANCH, register_id(&mut regs, &reg)]);
    }

    let target = last_hex_immediate(op_str)
        .ok_or_else(|| VmpError::InvalidOperand(mnemonic.to_string(), addr))?;

    if mnemonic == "bl" {
        let idx = branch_addr_index(t, target);
        return Ok(vec![OP_BL, idx]);
    }

    let local = target >= func_start && target < func_end;
    if !local {
        let idx = branch_addr_index(t, target);
        return Ok(vec![OP_BL, idx]);
    }

    let branch_id = branch_word_index(t, target);
    let opcode = match mnemonic {
        "b" => OP_BRANCH,
        m if m.starts_with("b.") => OP_BRANCH_IF_CC,
        "cbz" | "cbnz" | "tbz" | "tbnz" => OP_BRANCH_IF,
        _ => OP_BRANCH,
    };
    Ok(vec![opcode, branch_id])
}

fn branch_addr_index(t: &mut Translation, addr: u64) -> u32 {
    if let Some(pos) = t.branch_addrs.iter().position(|&a| a == addr) {
        pos as u32
    } else {
        t.branch_addrs.push(addr);
        (t.branch_addrs.len() - 1) as u32
    }
}

fn branch_word_index(t: &mut Translation, target_pc: u64) -> u32 {
    let target = target_pc as u32;
    if let Some(pos) = t.branch_words.iter().position(|&w| w == target) {
        pos as u32
    } else {
        t.branch_words.push(target);
        (t.branch_words.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_whitelisted_mnemonics() {
        assert_eq!(base_opcode_for_mnemonic("add"), Some(OP_BINARY));
        assert_eq!(base_opcode_for_mnemonic("ldrb"), Some(OP_READ));
        assert_eq!(base_opcode_for_mnemonic("strh"), Some(OP_WRITE));
        assert_eq!(base_opcode_for_mnemonic("movz"), Some(OP_MOV));
        assert_eq!(base_opcode_for_mnemonic("csel"), Some(OP_SELECT));
        assert_eq!(base_opcode_for_mnemonic("adrp"), Some(OP_ADRP));
        assert_eq!(base_opcode_for_mnemonic("sbfm"), Some(OP_BITCAST));
        assert_eq!(base_opcode_for_mnemonic("nop"), Some(OP_NOP));
        assert_eq!(base_opcode_for_mnemonic("fcvt"), None);
    }

    #[test]
    fn branch_mnemonics_recognized() {
        assert!(is_branch_mnemonic("b"));
        assert!(is_branch_mnemonic("b.eq"));
        assert!(is_branch_mnemonic("cbz"));
        assert!(is_branch_mnemonic("ret"));
        assert!(!is_branch_mnemonic("add"));
    }

    #[test]
    fn last_hex_immediate_picks_target() {
        assert_eq!(last_hex_immediate("w0, #0x3, #0x2000"), Some(0x2000));
        assert_eq!(last_hex_immediate("x0, x1"), None);
    }

    #[test]
    fn branch_addr_index_dedups() {
        let mut t = Translation::default();
        let a = branch_addr_index(&mut t, 0x5000);
        let b = branch_addr_index(&mut t, 0x6000);
        let c = branch_addr_index(&mut t, 0x5000);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, 0);
        assert_eq!(t.branch_addrs, vec![0x5000, 0x6000]);
    }
}
