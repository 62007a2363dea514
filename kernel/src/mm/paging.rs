//! Page Table Collaborator
//!
//! The process core decides what is mapped where; the paging collaborator
//! owns the page-table encoding, TLB maintenance and the physical frame
//! allocator.

use x86_64::structures::paging::PageTableFlags;
use x86_64::{PhysAddr, VirtAddr};

use super::MmError;

/// Page-table and frame services
pub trait Paging: Send + Sync {
    /// Allocate a new top-level table with the kernel half populated
    fn create_root(&self) -> Result<PhysAddr, MmError>;

    /// Free a top-level table and every user-half table below it
    fn destroy_root(&self, root: PhysAddr);

    /// Root that only maps the kernel
    fn kernel_root(&self) -> PhysAddr;

    /// Load `root` into CR3. Callers disable interrupts around this.
    fn activate(&self, root: PhysAddr);

    /// Allocate a zeroed physical frame
    fn allocate_frame(&self) -> Result<PhysAddr, MmError>;

    fn free_frame(&self, frame: PhysAddr);

    /// Map (or remap) one page
    fn map_page(&self, root: PhysAddr, page: VirtAddr, frame: PhysAddr, flags: PageTableFlags);

    fn unmap_page(&self, root: PhysAddr, page: VirtAddr);
}

/// Flags for a user page
pub fn user_page_flags(writable: bool, executable: bool) -> PageTableFlags {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if writable {
        flags |= PageTableFlags::WRITABLE;
    }
    if !executable {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_page_flags() {
        let rw = user_page_flags(true, false);
        assert!(rw.contains(PageTableFlags::WRITABLE | PageTableFlags::NO_EXECUTE));
        let rx = user_page_flags(false, true);
        assert!(!rx.contains(PageTableFlags::WRITABLE));
        assert!(!rx.contains(PageTableFlags::NO_EXECUTE));
        assert!(rx.contains(PageTableFlags::USER_ACCESSIBLE));
    }
}
