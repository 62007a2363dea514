//! Memory Manager (mm)
//!
//! User address spaces as seen by the process core:
//!
//! - **Paging**: the page-table collaborator (roots, mappings, frames)
//! - **Frames**: reference-counted physical pages with their contents
//! - **VM objects**: anonymous memory and the shared-data window
//! - **VADs**: mapped regions of an address space
//! - **Address spaces**: region trees with copy-on-write fork
//!
//! # Address Space Layout (x86_64)
//!
//! - User space: 0x0000_0000_0000_1000 - 0x0000_7FFF_FFFF_FFFF
//! - Kernel space is shared by every root and never described here.

use core::fmt;

pub mod address_space;
pub mod frame;
pub mod paging;
pub mod shared_data;
pub mod vad;
pub mod vm_object;

pub use address_space::AddressSpace;
pub use frame::Frame;
pub use paging::Paging;
pub use shared_data::{SharedData, SharedDataImage};
pub use vad::{MappedRegion, RegionFlags};
pub use vm_object::{VmObject, VmObjectKind};

/// Memory manager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// No physical frame was available
    OutOfMemory,
    /// No free virtual range of the requested size
    OutOfAddressSpace,
    /// A fixed placement collided with an existing region
    RegionOverlap,
    /// The address is not covered by any region
    NotMapped,
    /// The backing object cannot be written
    ReadOnly,
    /// The address or size is not page aligned
    Misaligned,
}

impl fmt::Display for MmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MmError::OutOfMemory => "out of physical memory",
            MmError::OutOfAddressSpace => "out of virtual address space",
            MmError::RegionOverlap => "region overlaps an existing mapping",
            MmError::NotMapped => "address not mapped",
            MmError::ReadOnly => "mapping is read-only",
            MmError::Misaligned => "address not page aligned",
        };
        f.write_str(text)
    }
}
