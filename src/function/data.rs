// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Component C3: the canonical, codec-agnostic record of a lifted function.

use crate::codec::{read_u64_from_pair, write_u64_as_pair, BitReader6, BitWriter6};
use crate::error::{Result, VmpError};

/// The canonical record emitted by the lifter and consumed by the codec.
///
/// Field order and meaning match spec section 3's `FunctionData` table
/// exactly; the wire order in [`FunctionData::serialize_encoded`] matches
/// section 4.4.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionData {
    pub marker: u32,
    pub register_count: u32,
    pub first_inst_count: u32,
    pub first_inst_opcodes: Vec<u32>,
    pub external_init_words: Vec<u32>,
    pub type_count: u32,
    pub type_tags: Vec<u32>,
    pub init_value_count: u32,
    pub init_value_words: Vec<u32>,
    pub inst_count: u32,
    pub inst_words: Vec<u32>,
    pub branch_count: u32,
    pub branch_words: Vec<u32>,
    pub branch_addrs: Vec<u64>,
    pub function_offset: u64,
}

/// Number of `init_value_words` entries `init_value_count` entries imply,
/// given each entry's companion opcode in `first_inst_opcodes`.
fn expected_init_word_count(data: &FunctionData) -> usize {
    let mut expected = 0usize;
    for i in 0..data.init_value_count as usize {
        let opcode = data.first_inst_opcodes[i];
        expected += 1;
        expected += if opcode == 1 { 2 } else { 1 };
    }
    expected
}

impl FunctionData {
    /// Checks the structural invariants from spec section 3. Must pass
    /// before serialization and after deserialization (the round-trip law).
    pub fn validate(&self) -> Result<()> {
        if self.marker > 63 {
            return Err(VmpError::Validate("marker must fit into 6 bits".into()));
        }
        if self.first_inst_count as usize != self.first_inst_opcodes.len() {
            return Err(VmpError::Validate(
                "first_inst_count does not match first_inst_opcodes.len()".into(),
            ));
        }
        if !self.external_init_words.is_empty()
            && self.external_init_words.len() != self.first_inst_count as usize * 2
        {
            return Err(VmpError::Validate(
                "external_init_words.len() must be 2 * first_inst_count".into(),
            ));
        }
        if self.type_count as usize != self.type_tags.len() {
            return Err(VmpError::Validate(
                "type_count does not match type_tags.len()".into(),
            ));
        }
        if self.inst_count as usize != self.inst_words.len() {
            return Err(VmpError::Validate(
                "inst_count does not match inst_words.len()".into(),
            ));
        }
        if self.branch_count as usize != self.branch_words.len() {
            return Err(VmpError::Validate(
                "branch_count does not match branch_words.len()".into(),
            ));
        }
        if self.init_value_count > self.first_inst_count {
            return Err(VmpError::Validate(
                "init_value_count cannot exceed first_inst_count".into(),
            ));
        }
        if self.init_value_count == 0 {
            if !self.init_value_words.is_empty() {
                return Err(VmpError::Validate(
                    "init_value_words must be empty when init_value_count == 0".into(),
                ));
            }
            return Ok(());
        }
        if self.first_inst_opcodes.len() < self.init_value_count as usize {
            return Err(VmpError::Validate(
                "first_inst_opcodes is shorter than init_value_count".into(),
            ));
        }
        if self.init_value_words.len() != expected_init_word_count(self) {
            return Err(VmpError::Validate(
                "init_value_words has unexpected size for init opcode layout".into(),
            ));
        }
        Ok(())
    }

    /// Serializes to the packed bit stream described in spec section 4.4.
    /// Validates first, so the caller never writes a structurally invalid
    /// stream.
    pub fn serialize_encoded(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut w = BitWriter6::new();
        w.write_6(self.marker);
        w.write_6_ext(self.register_count);
        w.write_6_ext(self.first_inst_count);
        for &v in &self.first_inst_opcodes {
            w.write_6_ext(v);
        }
        for &v in &self.external_init_words {
            w.write_6_ext(v);
        }
        w.write_6_ext(self.type_count);
        for &v in &self.type_tags {
            w.write_6_ext(v);
        }
        w.write_6_ext(self.init_value_count);
        for &v in &self.init_value_words {
            w.write_6_ext(v);
        }
        w.write_6_ext(self.inst_count);
        for &v in &self.inst_words {
            w.write_6_ext(v);
        }
        w.write_6_ext(self.branch_count);
        for &v in &self.branch_words {
            w.write_6_ext(v);
        }
        w.write_6_ext(self.branch_addrs.len() as u32);
        for &v in &self.branch_addrs {
            write_u64_as_pair(&mut w, v);
        }
        write_u64_as_pair(&mut w, self.function_offset);

        Ok(w.finish())
    }

    /// Deserializes from the packed bit stream, then re-validates.
    pub fn deserialize_encoded(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(VmpError::Truncated("marker"));
        }

        let mut r = BitReader6::new(bytes);
        let mut out = FunctionData::default();

        out.marker = r.read_6("marker")?;
        out.register_count = r.read_6_ext("register_count")?;
        out.first_inst_count = r.read_6_ext("first_inst_count")?;

        out.first_inst_opcodes.reserve(out.first_inst_count as usize);
        for _ in 0..out.first_inst_count {
            out.first_inst_opcodes.push(r.read_6_ext("first_inst_opcodes")?);
        }

        if out.first_inst_count > 0 {
            let n = out.first_inst_count as usize * 2;
            out.external_init_words.reserve(n);
            for _ in 0..n {
                out.external_init_words.push(r.read_6_ext("external_init_words")?);
            }
        }

        out.type_count = r.read_6_ext("type_count")?;
        out.type_tags.reserve(out.type_count as usize);
        for _ in 0..out.type_count {
            out.type_tags.push(r.read_6_ext("type_tags")?);
        }

        out.init_value_count = r.read_6_ext("init_value_count")?;
        if out.init_value_count > out.first_inst_count {
            return Err(VmpError::Validate(
                "init_value_count exceeds first_inst_count".into(),
            ));
        }
        out.init_value_words.reserve(out.init_value_count as usize * 3);
        for i in 0..out.init_value_count as usize {
            let reg_idx = r.read_6_ext("init_value_words")?;
            out.init_value_words.push(reg_idx);
            let word = r.read_6_ext("init_value_words")?;
            out.init_value_words.push(word);
            if out.first_inst_opcodes[i] == 1 {
                let high = r.read_6_ext("init_value_words")?;
                out.init_value_words.push(high);
            }
        }

        out.inst_count = r.read_6_ext("inst_count")?;
        out.inst_words.reserve(out.inst_count as usize);
        for _ in 0..out.inst_count {
            out.inst_words.push(r.read_6_ext("inst_words")?);
        }

        out.branch_count = r.read_6_ext("branch_count")?;
        out.branch_words.reserve(out.branch_count as usize);
        for _ in 0..out.branch_count {
            out.branch_words.push(r.read_6_ext("branch_words")?);
        }

        let branch_addr_count = r.read_6_ext("branch_addr_count")?;
        out.branch_addrs.reserve(branch_addr_count as usize);
        for _ in 0..branch_addr_count {
            out.branch_addrs.push(read_u64_from_pair(&mut r, "branch_addrs")?);
        }

        out.function_offset = read_u64_from_pair(&mut r, "function_offset")?;

        out.validate()?;
        Ok(out)
    }

    /// Compares logical state field-by-field, returning the **first**
    /// differing field as a structured error (spec section 4.3).
    pub fn encoded_equals(&self, other: &FunctionData) -> Result<()> {
        macro_rules! check_scalar {
            ($field:ident) => {
                if self.$field != other.$field {
                    return Err(VmpError::EncodedMismatch(
                        stringify!($field),
                        self.$field.to_string(),
                        other.$field.to_string(),
                    ));
                }
            };
        }
        macro_rules! check_vec {
            ($field:ident) => {
                if self.$field != other.$field {
                    return Err(VmpError::EncodedMismatch(
                        stringify!($field),
                        format!("{:?}", self.$field),
                        format!("{:?}", other.$field),
                    ));
                }
            };
        }

        check_scalar!(marker);
        check_scalar!(register_count);
        check_scalar!(first_inst_count);
        check_vec!(first_inst_opcodes);
        check_vec!(external_init_words);
        check_scalar!(type_count);
        check_vec!(type_tags);
        check_scalar!(init_value_count);
        check_vec!(init_value_words);
        check_scalar!(inst_count);
        check_vec!(inst_words);
        check_scalar!(branch_count);
        check_vec!(branch_words);
        check_vec!(branch_addrs);
        check_scalar!(function_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // S1 from spec section 8.
    fn sample() -> FunctionData {
        FunctionData {
            marker: 0,
            register_count: 2,
            first_inst_count: 1,
            first_inst_opcodes: vec![1],
            external_init_words: vec![0, 0],
            type_count: 1,
            type_tags: vec![7],
            init_value_count: 1,
            init_value_words: vec![0, 0xAABBCCDD, 0x11223344],
            inst_count: 2,
            inst_words: vec![9, 16],
            branch_count: 0,
            branch_words: vec![],
            branch_addrs: vec![],
            function_offset: 0x4000,
        }
    }

    #[test]
    fn round_trip_law() {
        let d = sample();
        d.validate().unwrap();
        let encoded = d.serialize_encoded().unwrap();
        let decoded = FunctionData::deserialize_encoded(&encoded).unwrap();
        d.encoded_equals(&decoded).unwrap();
    }

    #[test]
    fn validate_rejects_bad_marker() {
        let mut d = sample();
        d.marker = 64;
        assert!(d.validate().is_err());
    }

    #[test]
    fn validate_rejects_mismatched_counts() {
        let mut d = sample();
        d.inst_count = 5;
        assert!(d.validate().is_err());
    }

    #[test]
    fn empty_function_round_trips() {
        let d = FunctionData {
            marker: 3,
            register_count: 0,
            function_offset: 0x1000,
            ..Default::default()
        };
        let encoded = d.serialize_encoded().unwrap();
        let decoded = FunctionData::deserialize_encoded(&encoded).unwrap();
        d.encoded_equals(&decoded).unwrap();
    }

    #[test]
    fn encoded_equals_reports_first_mismatch() {
        let a = sample();
        let mut b = sample();
        b.register_count = 99;
        let err = a.encoded_equals(&b).unwrap_err();
        match err {
            VmpError::EncodedMismatch(field, _, _) => assert_eq!(field, "register_count"),
            _ => panic!("expected EncodedMismatch"),
        }
    }

    #[test]
    fn encoded_equals_reports_vector_field_mismatch() {
        let a = sample();
        let mut b = sample();
        b.inst_words = vec![9, 99];
        let err = a.encoded_equals(&b).unwrap_err();
        match err {
            VmpError::EncodedMismatch(field, lhs, rhs) => {
                assert_eq!(field, "inst_words");
                assert_eq!(lhs, "[9, 16]");
                assert_eq!(rhs, "[9, 99]");
            }
            _ => panic!("expected EncodedMismatch"),
        }
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let d = sample();
        let mut encoded = d.serialize_encoded().unwrap();
        encoded.truncate(1);
        assert!(FunctionData::deserialize_encoded(&encoded).is_err());
    }
}
