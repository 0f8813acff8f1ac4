// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The runtime opcode space understood by the VM engine. The lifter emits
//! these as raw `u32` words in `FunctionData::inst_words`; this module only
//! gives them names for dumps and coverage reports. The numeric values are
//! part of the wire protocol and must never change.

pub const OP_END: u32 = 0;
pub const OP_BINARY: u32 = 1;
pub const OP_TYPE_CONVERT: u32 = 2;
pub const OP_LOAD_CONST: u32 = 3;
pub const OP_STORE_CONST: u32 = 4;
pub const OP_GET_ELEMENT: u32 = 5;
pub const OP_ALLOC_RETURN: u32 = 6;
pub const OP_STORE: u32 = 7;
pub const OP_LOAD_CONST64: u32 = 8;
pub const OP_NOP: u32 = 9;
pub const OP_COPY: u32 = 10;
pub const OP_GET_FIELD: u32 = 11;
pub const OP_CMP: u32 = 12;
pub const OP_SET_FIELD: u32 = 13;
pub const OP_RESTORE_REG: u32 = 14;
pub const OP_CALL: u32 = 15;
pub const OP_RETURN: u32 = 16;
pub const OP_BRANCH: u32 = 17;
pub const OP_BRANCH_IF: u32 = 18;
pub const OP_ALLOC_MEMORY: u32 = 19;
pub const OP_MOV: u32 = 20;
pub const OP_LOAD_IMM: u32 = 21;
pub const OP_DYNAMIC_CAST: u32 = 22;
pub const OP_UNARY: u32 = 23;
pub const OP_PHI: u32 = 24;
pub const OP_SELECT: u32 = 25;
pub const OP_MEMCPY: u32 = 26;
pub const OP_MEMSET: u32 = 27;
pub const OP_STRLEN: u32 = 28;
pub const OP_FETCH_NEXT: u32 = 29;
pub const OP_CALL_INDIRECT: u32 = 30;
pub const OP_SWITCH: u32 = 31;
pub const OP_GET_PTR: u32 = 32;
pub const OP_BITCAST: u32 = 33;
pub const OP_SIGN_EXTEND: u32 = 34;
pub const OP_ZERO_EXTEND: u32 = 35;
pub const OP_TRUNCATE: u32 = 36;
pub const OP_FLOAT_EXTEND: u32 = 37;
pub const OP_FLOAT_TRUNCATE: u32 = 38;
pub const OP_INT_TO_FLOAT: u32 = 39;
pub const OP_ARRAY_ELEM: u32 = 40;
pub const OP_FLOAT_TO_INT: u32 = 41;
pub const OP_READ: u32 = 42;
pub const OP_WRITE: u32 = 43;
pub const OP_LEA: u32 = 44;
pub const OP_ATOMIC_ADD: u32 = 45;
pub const OP_ATOMIC_SUB: u32 = 46;
pub const OP_ATOMIC_XCHG: u32 = 47;
pub const OP_ATOMIC_CAS: u32 = 48;
pub const OP_FENCE: u32 = 49;
pub const OP_UNREACHABLE: u32 = 50;
pub const OP_ALLOC_VSP: u32 = 51;
pub const OP_BINARY_IMM: u32 = 52;
pub const OP_BRANCH_IF_CC: u32 = 53;
pub const OP_SET_RETURN_PC: u32 = 54;
pub const OP_BL: u32 = 55;
pub const OP_ADRP: u32 = 56;

/// Maps an opcode value to its protocol name, for dumps and coverage rows.
/// Unknown values (outside 0..=56) map to `"OP_UNKNOWN"`, matching the
/// original `getOpcodeName` fallback.
pub fn opcode_name(op: u32) -> &'static str {
    match op {
        OP_END => "OP_END",
        OP_BINARY => "OP_BINARY",
        OP_TYPE_CONVERT => "OP_TYPE_CONVERT",
        OP_LOAD_CONST => "OP_LOAD_CONST",
        OP_STORE_CONST => "OP_STORE_CONST",
        OP_GET_ELEMENT => "OP_GET_ELEMENT",
        OP_ALLOC_RETURN => "OP_ALLOC_RETURN",
        OP_STORE => "OP_STORE",
        OP_LOAD_CONST64 => "OP_LOAD_CONST64",
        OP_NOP => "OP_NOP",
        OP_COPY => "OP_COPY",
        OP_GET_FIELD => "OP_GET_FIELD",
        OP_CMP => "OP_CMP",
        OP_SET_FIELD => "OP_SET_FIELD",
        OP_RESTORE_REG => "OP_RESTORE_REG",
        OP_CALL => "OP_CALL",
        OP_RETURN => "OP_RETURN",
        OP_BRANCH => "OP_BRANCH",
        OP_BRANCH_IF => "OP_BRANCH_IF",
        OP_ALLOC_MEMORY => "OP_ALLOC_MEMORY",
        OP_MOV => "OP_MOV",
        OP_LOAD_IMM => "OP_LOAD_IMM",
        OP_DYNAMIC_CAST => "OP_DYNAMIC_CAST",
        OP_UNARY => "OP_UNARY",
        OP_PHI => "OP_PHI",
        OP_SELECT => "OP_SELECT",
        OP_MEMCPY => "OP_MEMCPY",
        OP_MEMSET => "OP_MEMSET",
        OP_STRLEN => "OP_STRLEN",
        OP_FETCH_NEXT => "OP_FETCH_NEXT",
        OP_CALL_INDIRECT => "OP_CALL_INDIRECT",
        OP_SWITCH => "OP_SWITCH",
        OP_GET_PTR => "OP_GET_PTR",
        OP_BITCAST => "OP_BITCAST",
        OP_SIGN_EXTEND => "OP_SIGN_EXTEND",
        OP_ZERO_EXTEND => "OP_ZERO_EXTEND",
        OP_TRUNCATE => "OP_TRUNCATE",
        OP_FLOAT_EXTEND => "OP_FLOAT_EXTEND",
        OP_FLOAT_TRUNCATE => "OP_FLOAT_TRUNCATE",
        OP_INT_TO_FLOAT => "OP_INT_TO_FLOAT",
        OP_ARRAY_ELEM => "OP_ARRAY_ELEM",
        OP_FLOAT_TO_INT => "OP_FLOAT_TO_INT",
        OP_READ => "OP_READ",
        OP_WRITE => "OP_WRITE",
        OP_LEA => "OP_LEA",
        OP_ATOMIC_ADD => "OP_ATOMIC_ADD",
        OP_ATOMIC_SUB => "OP_ATOMIC_SUB",
        OP_ATOMIC_XCHG => "OP_ATOMIC_XCHG",
        OP_ATOMIC_CAS => "OP_ATOMIC_CAS",
        OP_FENCE => "OP_FENCE",
        OP_UNREACHABLE => "OP_UNREACHABLE",
        OP_ALLOC_VSP => "OP_ALLOC_VSP",
        OP_BINARY_IMM => "OP_BINARY_IMM",
        OP_BRANCH_IF_CC => "OP_BRANCH_IF_CC",
        OP_SET_RETURN_PC => "OP_SET_RETURN_PC",
        OP_BL => "OP_BL",
        OP_ADRP => "OP_ADRP",
        _ => "OP_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_stable() {
        assert_eq!(opcode_name(OP_END), "OP_END");
        assert_eq!(opcode_name(OP_BL), "OP_BL");
        assert_eq!(opcode_name(OP_ADRP), "OP_ADRP");
        assert_eq!(opcode_name(999), "OP_UNKNOWN");
    }
}
