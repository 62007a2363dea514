//! User Address Spaces
//!
//! An address space is a page-table root plus the regions mapped under
//! it. Kernel-side reads and writes go through the VM objects, so a new
//! image can be built without switching to its root. Dropping the last
//! reference tears the root down; frames go with their objects.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use x86_64::{PhysAddr, VirtAddr};

use super::paging::Paging;
use super::vad::{MappedRegion, RegionFlags};
use super::vm_object::VmObject;
use super::MmError;
use crate::config::{PAGE_SIZE, PAGE_SIZE_BYTES, USER_SPACE_CEILING, USER_SPACE_FLOOR};
use crate::ke::SpinLock;

/// A user address space
pub struct AddressSpace {
    root: PhysAddr,
    paging: Arc<dyn Paging>,
    /// Regions keyed by base address
    regions: SpinLock<BTreeMap<u64, MappedRegion>>,
}

impl AddressSpace {
    /// Create an empty address space with a fresh root
    pub fn new(paging: Arc<dyn Paging>) -> Result<Self, MmError> {
        let root = paging.create_root()?;
        log::trace!("[MM] new address space, root {:#x}", root.as_u64());
        Ok(Self {
            root,
            paging,
            regions: SpinLock::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn paging(&self) -> &Arc<dyn Paging> {
        &self.paging
    }

    // ========================================================================
    // Region management
    // ========================================================================

    /// Map a new anonymous region.
    ///
    /// With `fixed` the region lands exactly at `hint` or the call fails;
    /// otherwise `hint` is a preference and the next free range is used.
    pub fn allocate_anonymous(
        &self,
        size: u64,
        hint: VirtAddr,
        fixed: bool,
        flags: RegionFlags,
    ) -> Result<MappedRegion, MmError> {
        let object = VmObject::anonymous(&self.paging, size);
        self.map_object(object, hint, fixed, flags)
    }

    /// Map `object` and install page-table entries for its committed pages
    pub fn map_object(
        &self,
        object: Arc<VmObject>,
        hint: VirtAddr,
        fixed: bool,
        flags: RegionFlags,
    ) -> Result<MappedRegion, MmError> {
        if !hint.is_aligned(PAGE_SIZE) {
            return Err(MmError::Misaligned);
        }

        let size = object.size();
        let region = {
            let mut regions = self.regions.lock();
            let base = if fixed {
                if Self::collides(&regions, hint, size) {
                    return Err(MmError::RegionOverlap);
                }
                hint
            } else {
                Self::find_free(&regions, hint, size)?
            };

            let region = MappedRegion::new(base, size, flags, object);
            regions.insert(base.as_u64(), region.clone());
            region
        };

        for (index, frame) in region.object().committed() {
            let shared = region.object().is_page_shared(index);
            self.paging.map_page(
                self.root,
                region.page_address(index),
                frame.phys(),
                region.page_flags(shared),
            );
        }
        Ok(region)
    }

    /// Remove every region intersecting `[base, base + size)`
    pub fn unmap(&self, base: VirtAddr, size: u64) -> Result<(), MmError> {
        let removed: Vec<MappedRegion> = {
            let mut regions = self.regions.lock();
            let keys: Vec<u64> = regions
                .values()
                .filter(|r| r.overlaps(base, size))
                .map(|r| r.base().as_u64())
                .collect();
            keys.iter().filter_map(|k| regions.remove(k)).collect()
        };

        if removed.is_empty() {
            return Err(MmError::NotMapped);
        }

        for region in &removed {
            for (index, _) in region.object().committed() {
                self.paging.unmap_page(self.root, region.page_address(index));
            }
        }
        Ok(())
    }

    /// Region containing `address`
    pub fn region_at(&self, address: VirtAddr) -> Option<MappedRegion> {
        let regions = self.regions.lock();
        Self::lookup(&regions, address).cloned()
    }

    /// Snapshot of every region in address order
    pub fn regions(&self) -> Vec<MappedRegion> {
        self.regions.lock().values().cloned().collect()
    }

    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    fn lookup(regions: &BTreeMap<u64, MappedRegion>, address: VirtAddr) -> Option<&MappedRegion> {
        regions
            .range(..=address.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(address))
    }

    fn collides(regions: &BTreeMap<u64, MappedRegion>, base: VirtAddr, size: u64) -> bool {
        regions.values().any(|r| r.overlaps(base, size))
    }

    fn find_free(regions: &BTreeMap<u64, MappedRegion>, hint: VirtAddr, size: u64) -> Result<VirtAddr, MmError> {
        let mut candidate = hint.as_u64().max(USER_SPACE_FLOOR);
        for region in regions.values() {
            let start = region.base().as_u64();
            let end = region.end().as_u64();
            if end <= candidate {
                continue;
            }
            if start >= candidate.saturating_add(size) {
                break;
            }
            candidate = end;
        }

        match candidate.checked_add(size) {
            Some(end) if end <= USER_SPACE_CEILING => Ok(VirtAddr::new(candidate)),
            _ => Err(MmError::OutOfAddressSpace),
        }
    }

    // ========================================================================
    // Page commitment
    // ========================================================================

    /// Commit and map the page holding `address`
    pub fn hit(&self, address: VirtAddr) -> Result<(), MmError> {
        let region = self.region_at(address).ok_or(MmError::NotMapped)?;
        let index = region.page_index(address);
        let frame = region.object().hit(index)?;
        let shared = region.object().is_page_shared(index);
        self.paging.map_page(
            self.root,
            region.page_address(index),
            frame.phys(),
            region.page_flags(shared),
        );
        Ok(())
    }

    /// Commit and map every page of the region at `base`
    pub fn force_allocate(&self, base: VirtAddr) -> Result<(), MmError> {
        let region = self.region_at(base).ok_or(MmError::NotMapped)?;
        for index in 0..region.object().page_count() {
            self.hit(region.page_address(index))?;
        }
        Ok(())
    }

    // ========================================================================
    // Kernel access
    // ========================================================================

    /// Copy bytes out of the address space. Uncommitted pages read as zero.
    pub fn read(&self, address: VirtAddr, buf: &mut [u8]) -> Result<(), MmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let region = self.region_at(at).ok_or(MmError::NotMapped)?;
            let index = region.page_index(at);
            let offset = (at.as_u64() % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE_BYTES - offset).min(buf.len() - done);

            match region.object().frame_at(index) {
                Some(frame) => frame.read(offset, &mut buf[done..done + chunk]),
                None => buf[done..done + chunk].fill(0),
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes into the address space, committing pages and breaking
    /// copy-on-write sharing as needed
    pub fn write(&self, address: VirtAddr, buf: &[u8]) -> Result<(), MmError> {
        let mut done = 0;
        while done < buf.len() {
            let at = address + done as u64;
            let region = self.region_at(at).ok_or(MmError::NotMapped)?;
            let index = region.page_index(at);
            let offset = (at.as_u64() % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE_BYTES - offset).min(buf.len() - done);

            let (frame, remap) = region.object().frame_for_write(index)?;
            frame.write(offset, &buf[done..done + chunk]);
            if remap {
                self.paging.map_page(
                    self.root,
                    region.page_address(index),
                    frame.phys(),
                    region.page_flags(false),
                );
            }
            done += chunk;
        }
        Ok(())
    }

    pub fn read_u32(&self, address: VirtAddr) -> Result<u32, MmError> {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    pub fn read_u64(&self, address: VirtAddr) -> Result<u64, MmError> {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_u32(&self, address: VirtAddr, value: u32) -> Result<(), MmError> {
        self.write(address, &value.to_le_bytes())
    }

    pub fn write_u64(&self, address: VirtAddr, value: u64) -> Result<(), MmError> {
        self.write(address, &value.to_le_bytes())
    }

    /// Read a NUL-terminated string of at most `max` bytes
    pub fn read_c_string(&self, address: VirtAddr, max: usize) -> Result<String, MmError> {
        let mut bytes = Vec::new();
        let mut byte = [0u8; 1];
        while bytes.len() < max {
            self.read(address + bytes.len() as u64, &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // ========================================================================
    // Fork
    // ========================================================================

    /// Build the child address space for fork.
    ///
    /// The shared-data window maps the same object. Every other region
    /// gets a new object sharing the committed frames; both sides map
    /// those frames read-only until a write breaks the sharing.
    pub fn fork(&self) -> Result<AddressSpace, MmError> {
        let child = AddressSpace::new(self.paging.clone())?;
        let regions = self.regions();

        for region in &regions {
            let object = region.object().clone_for_fork();
            child.map_object(object, region.base(), true, region.flags())?;

            if region.object().is_shared_data() {
                continue;
            }
            for (index, frame) in region.object().committed() {
                self.paging.map_page(
                    self.root,
                    region.page_address(index),
                    frame.phys(),
                    region.page_flags(true),
                );
            }
        }

        log::trace!(
            "[MM] forked address space {:#x} -> {:#x} ({} regions)",
            self.root.as_u64(),
            child.root.as_u64(),
            regions.len()
        );
        Ok(child)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.regions.get_mut().clear();
        self.paging.destroy_root(self.root);
        log::trace!("[MM] destroyed address space, root {:#x}", self.root.as_u64());
    }
}
