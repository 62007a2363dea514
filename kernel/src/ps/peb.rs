//! Process Environment Block (PEB)
//!
//! The PEB is a user-mode page describing the process to its runtime:
//! its own address, its PID, where the executable and the shared-data
//! window live, and where the dynamic linker's call vector table is.
//! The thread's GS base points at it.
//!
//! # Important Notes
//!
//! - The PEB is a fresh anonymous page in every address space; fork
//!   never inherits the parent's copy.
//! - It is rewritten after the shared-data window is mapped, so the
//!   window fields always describe the current address space.

use x86_64::VirtAddr;

use crate::mm::{AddressSpace, MmError};

/// Process Environment Block
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnvironmentBlock {
    /// Address of this block
    pub self_address: u64,
    pub pid: u64,
    pub executable_base: u64,
    pub shared_data_base: u64,
    pub shared_data_size: u64,
    /// Base of the dynamic linker call vector table
    pub linker_vector_base: u64,
    pub linker_vector_size: u64,
}

impl EnvironmentBlock {
    /// Size of the block in user memory
    pub const SIZE: usize = 7 * 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.self_address,
            self.pid,
            self.executable_base,
            self.shared_data_base,
            self.shared_data_size,
            self.linker_vector_base,
            self.linker_vector_size,
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, field) in bytes.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut fields = [0u64; 7];
        for (field, chunk) in fields.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            *field = u64::from_le_bytes(word);
        }
        Self {
            self_address: fields[0],
            pid: fields[1],
            executable_base: fields[2],
            shared_data_base: fields[3],
            shared_data_size: fields[4],
            linker_vector_base: fields[5],
            linker_vector_size: fields[6],
        }
    }

    /// Store the block at `base` in `space`
    pub fn write_to(&self, space: &AddressSpace, base: VirtAddr) -> Result<(), MmError> {
        space.write(base, &self.to_bytes())
    }

    /// Load the block at `base` from `space`
    pub fn read_from(space: &AddressSpace, base: VirtAddr) -> Result<Self, MmError> {
        let mut bytes = [0u8; Self::SIZE];
        space.read(base, &mut bytes)?;
        Ok(Self::from_bytes(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_layout() {
        let block = EnvironmentBlock {
            self_address: 0x7F_F000_0000,
            pid: 12,
            ..EnvironmentBlock::default()
        };
        let bytes = block.to_bytes();
        assert_eq!(&bytes[0..8], &0x7F_F000_0000u64.to_le_bytes());
        assert_eq!(&bytes[8..16], &12u64.to_le_bytes());
        assert_eq!(EnvironmentBlock::from_bytes(&bytes), block);
    }
}
