//! Bit-packed 6-bit codec (component C4).
//!
//! Two atoms are defined over a byte stream packed low-bit-first:
//! a fixed 6-bit group and a 6-bit-extended varint built from 5-bit data
//! groups with a continuation flag in bit 5 of each 6-bit group.

mod bitstream;

pub use bitstream::{read_u64_from_pair, write_u64_as_pair, BitReader6, BitWriter6};
