//! AArch64 ELF64 reading (component C1).

pub mod image;
pub mod raw;

pub use image::{ElfImage, FunctionView, SectionView, SymbolInfo};
