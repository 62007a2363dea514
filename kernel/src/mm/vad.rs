//! Virtual Address Descriptors (VAD)
//!
//! A VAD describes one mapped region of a user address space: where it
//! lives, what access it grants, and which VM object backs it.

use alloc::sync::Arc;

use bitflags::bitflags;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use super::paging::user_page_flags;
use super::vm_object::VmObject;
use crate::config::PAGE_SIZE;

bitflags! {
    /// Access granted by a region
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        /// Shared with other address spaces, never copied on fork
        const SHARED = 1 << 3;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

/// One mapped region
#[derive(Clone)]
pub struct MappedRegion {
    base: VirtAddr,
    size: u64,
    flags: RegionFlags,
    object: Arc<VmObject>,
}

impl MappedRegion {
    pub fn new(base: VirtAddr, size: u64, flags: RegionFlags, object: Arc<VmObject>) -> Self {
        Self {
            base,
            size,
            flags,
            object,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// First address past the region
    pub fn end(&self) -> VirtAddr {
        self.base + self.size
    }

    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    pub fn contains(&self, address: VirtAddr) -> bool {
        address >= self.base && address < self.end()
    }

    /// Whether `[base, base + size)` intersects this region
    pub fn overlaps(&self, base: VirtAddr, size: u64) -> bool {
        base < self.end() && self.base < base + size
    }

    /// Index into the backing object of the page holding `address`
    pub fn page_index(&self, address: VirtAddr) -> usize {
        ((address - self.base) / PAGE_SIZE) as usize
    }

    /// Address of page `index`
    pub fn page_address(&self, index: usize) -> VirtAddr {
        self.base + index as u64 * PAGE_SIZE
    }

    /// Page-table flags for one of this region's pages
    ///
    /// A frame shared with another object is mapped read-only so the
    /// first write faults and breaks the sharing.
    pub fn page_flags(&self, frame_shared: bool) -> PageTableFlags {
        let writable = self.flags.contains(RegionFlags::WRITE)
            && !self.object.is_shared_data()
            && !frame_shared;
        user_page_flags(writable, self.flags.contains(RegionFlags::EXECUTE))
    }
}

impl core::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .field("kind", &self.object.kind())
            .finish()
    }
}
