//! Initial User Stack
//!
//! Layout from high to low addresses:
//!
//! ```text
//! argv strings, envp strings, exec path
//! (align 16, pad so the final pointer is 16-byte aligned)
//! auxv pairs ... AT_NULL
//! NULL, envp pointers
//! NULL, argv pointers
//! argc                      <- rsp
//! ```

use alloc::vec::Vec;

use x86_64::VirtAddr;

use crate::mm::{AddressSpace, MmError};

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_ENTRY: u64 = 9;
pub const AT_EXECFN: u64 = 31;
pub const AT_SYSINFO_EHDR: u64 = 33;

/// One auxiliary vector entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxEntry {
    pub kind: u64,
    pub value: u64,
}

impl AuxEntry {
    pub const fn new(kind: u64, value: u64) -> Self {
        Self { kind, value }
    }
}

/// Inputs to the initial stack
pub struct InitialStack<'a> {
    pub argv: &'a [&'a str],
    pub envp: &'a [&'a str],
    pub exec_path: Option<&'a str>,
    /// Entries before AT_NULL; AT_EXECFN is added when a path is given
    pub auxv: Vec<AuxEntry>,
}

impl InitialStack<'_> {
    /// Write the stack below `top`, returning the initial stack pointer
    pub fn write(&self, space: &AddressSpace, top: VirtAddr) -> Result<VirtAddr, MmError> {
        let mut sp = top.as_u64();

        let mut push_string = |s: &str| -> Result<u64, MmError> {
            sp -= s.len() as u64 + 1;
            space.write(VirtAddr::new(sp), s.as_bytes())?;
            space.write(VirtAddr::new(sp + s.len() as u64), &[0])?;
            Ok(sp)
        };

        let argv: Vec<u64> = self
            .argv
            .iter()
            .map(|s| push_string(s))
            .collect::<Result<_, _>>()?;
        let envp: Vec<u64> = self
            .envp
            .iter()
            .map(|s| push_string(s))
            .collect::<Result<_, _>>()?;
        let exec_path = self.exec_path.map(&mut push_string).transpose()?;

        let mut words: Vec<u64> = Vec::with_capacity(argv.len() + envp.len() + 2 * self.auxv.len() + 8);
        words.push(argv.len() as u64);
        words.extend_from_slice(&argv);
        words.push(0);
        words.extend_from_slice(&envp);
        words.push(0);
        for aux in &self.auxv {
            words.push(aux.kind);
            words.push(aux.value);
        }
        if let Some(path) = exec_path {
            words.push(AT_EXECFN);
            words.push(path);
        }
        words.push(AT_NULL);
        words.push(0);

        sp &= !0xF;
        if words.len() % 2 == 1 {
            sp -= 8;
        }
        sp -= words.len() as u64 * 8;

        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        space.write(VirtAddr::new(sp), &bytes)?;
        Ok(VirtAddr::new(sp))
    }
}
