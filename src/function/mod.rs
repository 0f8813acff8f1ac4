//! Function lifting: disassembly (C2), the canonical data model (C3), the
//! runtime opcode space, and dump rendering.

pub mod data;
pub mod dump;
pub mod lifter;
pub mod opcode;

pub use data::FunctionData;
pub use dump::{dump, DumpMode};
pub use lifter::{is_supported_mnemonic, LiftedFunction, Translation};
