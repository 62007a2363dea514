//! Loader (ldr)
//!
//! The loader is responsible for:
//! - Parsing ELF64 executables and the dynamic linker
//! - Mapping PT_LOAD segments into a user address space
//! - Binding the dynamic linker's PLT against the shared-data symbols
//! - Laying out the initial user stack (argv, envp, auxv)
//!
//! # Architecture
//!
//! ```text
//! ELF File                 Address Space
//! ┌─────────────────┐      ┌─────────────────┐
//! │ ELF Header      │      │ PT_LOAD (RX)    │
//! │ Program Headers │ ──►  ├─────────────────┤
//! ├─────────────────┤      │ PT_LOAD (RW)    │
//! │ PT_INTERP       │      ├─────────────────┤
//! │ PT_LOAD ...     │      │ ld.so @ 0x7FC.. │
//! └─────────────────┘      ├─────────────────┤
//!                          │ stack           │
//!                          └─────────────────┘
//! ```

use core::fmt;

pub mod dynamic;
pub mod elf;
pub mod stack;

pub use dynamic::{bind_plt, DynamicInfo, PltBinding};
pub use elf::{ElfImage, ImageKind, LoadSegment};
pub use stack::{AuxEntry, InitialStack};

use crate::mm::MmError;
use crate::ob::ObError;

/// Image loading failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Missing \x7FELF
    BadMagic,
    /// Not a 64-bit image
    UnsupportedClass,
    /// Not an x86_64 image
    UnsupportedMachine,
    /// Neither an executable nor a shared object
    UnsupportedType,
    /// Structurally invalid image
    Malformed(&'static str),
    /// A PLT symbol was not weakly bound
    InvalidSymbolBinding,
    /// The dynamic section lacks a required table
    MissingDynamicTable,
    /// The image needs a dynamic linker that cannot be found
    InterpreterNotFound,
    Mm(MmError),
    Ob(ObError),
}

impl From<MmError> for LoadError {
    fn from(error: MmError) -> Self {
        LoadError::Mm(error)
    }
}

impl From<ObError> for LoadError {
    fn from(error: ObError) -> Self {
        LoadError::Ob(error)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::BadMagic => f.write_str("not an ELF image"),
            LoadError::UnsupportedClass => f.write_str("not a 64-bit image"),
            LoadError::UnsupportedMachine => f.write_str("not an x86_64 image"),
            LoadError::UnsupportedType => f.write_str("not an executable or shared object"),
            LoadError::Malformed(what) => write!(f, "malformed image: {}", what),
            LoadError::InvalidSymbolBinding => f.write_str("PLT symbol is not weakly bound"),
            LoadError::MissingDynamicTable => f.write_str("dynamic section is incomplete"),
            LoadError::InterpreterNotFound => f.write_str("dynamic linker not found"),
            LoadError::Mm(error) => write!(f, "memory: {}", error),
            LoadError::Ob(error) => write!(f, "object: {}", error),
        }
    }
}
