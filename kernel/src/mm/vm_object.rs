//! VM Objects
//!
//! A VM object is the page array behind a mapped region. Anonymous
//! objects commit zeroed frames on demand and are cloned copy-on-write
//! by fork. The shared-data object is committed up front, read-only,
//! and shared by reference across every address space that maps it.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::frame::Frame;
use super::paging::Paging;
use super::MmError;
use crate::config::{PAGE_SIZE, PAGE_SIZE_BYTES};
use crate::ke::SpinLock;

/// Kind of backing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmObjectKind {
    /// Private zero-fill memory
    Anonymous,
    /// The kernel's shared-data window
    SharedData,
}

/// A committed page
#[derive(Clone)]
struct Page {
    frame: Arc<Frame>,
    /// Mapped read-only since a fork; the next write must remap it
    copy_on_write: bool,
}

impl Page {
    fn new(frame: Arc<Frame>) -> Self {
        Page {
            frame,
            copy_on_write: false,
        }
    }
}

/// Page array behind a region
pub struct VmObject {
    kind: VmObjectKind,
    size: u64,
    pages: SpinLock<Vec<Option<Page>>>,
    paging: Arc<dyn Paging>,
}

impl VmObject {
    /// Uncommitted anonymous object of `size` bytes (rounded up to pages)
    pub fn anonymous(paging: &Arc<dyn Paging>, size: u64) -> Arc<VmObject> {
        let pages = page_count(size);
        Arc::new(VmObject {
            kind: VmObjectKind::Anonymous,
            size: pages as u64 * PAGE_SIZE,
            pages: SpinLock::new(vec![None; pages]),
            paging: paging.clone(),
        })
    }

    /// Fully committed shared-data object holding `contents`
    pub fn shared_data(paging: &Arc<dyn Paging>, contents: &[u8]) -> Result<Arc<VmObject>, MmError> {
        let pages = page_count(contents.len() as u64).max(1);
        let mut frames = Vec::with_capacity(pages);
        for chunk in 0..pages {
            let frame = Frame::allocate(paging)?;
            let start = chunk * PAGE_SIZE_BYTES;
            if start < contents.len() {
                let end = (start + PAGE_SIZE_BYTES).min(contents.len());
                frame.write(0, &contents[start..end]);
            }
            frames.push(Some(Page::new(frame)));
        }

        Ok(Arc::new(VmObject {
            kind: VmObjectKind::SharedData,
            size: pages as u64 * PAGE_SIZE,
            pages: SpinLock::new(frames),
            paging: paging.clone(),
        }))
    }

    pub fn kind(&self) -> VmObjectKind {
        self.kind
    }

    pub fn is_shared_data(&self) -> bool {
        self.kind == VmObjectKind::SharedData
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    /// Number of pages with a frame behind them
    pub fn committed_pages(&self) -> usize {
        self.pages.lock().iter().filter(|p| p.is_some()).count()
    }

    /// Frame at page `index`, if committed
    pub fn frame_at(&self, index: usize) -> Option<Arc<Frame>> {
        self.pages
            .lock()
            .get(index)
            .and_then(Option::as_ref)
            .map(|page| page.frame.clone())
    }

    /// Every committed page as (index, frame)
    pub fn committed(&self) -> Vec<(usize, Arc<Frame>)> {
        self.pages
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(i, p)| p.as_ref().map(|page| (i, page.frame.clone())))
            .collect()
    }

    /// Commit page `index` if needed and return its frame
    pub fn hit(&self, index: usize) -> Result<Arc<Frame>, MmError> {
        let mut pages = self.pages.lock();
        let slot = pages.get_mut(index).ok_or(MmError::NotMapped)?;
        if let Some(page) = slot.as_ref() {
            return Ok(page.frame.clone());
        }

        let frame = Frame::allocate(&self.paging)?;
        *slot = Some(Page::new(frame.clone()));
        Ok(frame)
    }

    /// Commit every page
    pub fn force_allocate(&self) -> Result<(), MmError> {
        for index in 0..self.page_count() {
            self.hit(index)?;
        }
        Ok(())
    }

    /// Frame at `index` that this object alone owns, ready for writing.
    ///
    /// Commits the page if needed and breaks copy-on-write sharing by
    /// copying. The flag is true when the mapping must be refreshed,
    /// which includes the last owner of a page still mapped read-only
    /// after a fork.
    pub fn frame_for_write(&self, index: usize) -> Result<(Arc<Frame>, bool), MmError> {
        if self.is_shared_data() {
            return Err(MmError::ReadOnly);
        }

        let mut pages = self.pages.lock();
        let slot = pages.get_mut(index).ok_or(MmError::NotMapped)?;
        let copy = match slot.as_mut() {
            Some(page) if Arc::strong_count(&page.frame) == 1 => {
                let remap = page.copy_on_write;
                page.copy_on_write = false;
                return Ok((page.frame.clone(), remap));
            }
            Some(page) => Some(page.frame.duplicate()?),
            None => None,
        };

        let frame = match copy {
            Some(copy) => copy,
            None => Frame::allocate(&self.paging)?,
        };
        *slot = Some(Page::new(frame.clone()));
        Ok((frame, true))
    }

    /// Whether page `index` is shared with another object
    pub fn is_page_shared(&self, index: usize) -> bool {
        self.pages
            .lock()
            .get(index)
            .and_then(Option::as_ref)
            .map_or(false, |page| Arc::strong_count(&page.frame) > 1)
    }

    /// Object for the child side of a fork.
    ///
    /// The shared-data object is the same object in every address space.
    /// Anything else becomes a new object sharing the committed frames.
    pub fn clone_for_fork(self: &Arc<Self>) -> Arc<VmObject> {
        if self.is_shared_data() {
            return self.clone();
        }

        let pages = {
            let mut pages = self.pages.lock();
            for page in pages.iter_mut().flatten() {
                page.copy_on_write = true;
            }
            pages.clone()
        };
        Arc::new(VmObject {
            kind: self.kind,
            size: self.size,
            pages: SpinLock::new(pages),
            paging: self.paging.clone(),
        })
    }
}

fn page_count(size: u64) -> usize {
    size.div_ceil(PAGE_SIZE) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPaging;

    fn paging() -> (Arc<SimPaging>, Arc<dyn Paging>) {
        let sim = Arc::new(SimPaging::new());
        let paging: Arc<dyn Paging> = sim.clone();
        (sim, paging)
    }

    #[test]
    fn test_anonymous_commits_on_hit() {
        let (sim, paging) = paging();
        let object = VmObject::anonymous(&paging, PAGE_SIZE * 3 - 10);
        assert_eq!(object.page_count(), 3);
        assert_eq!(object.committed_pages(), 0);

        let frame = object.hit(1).unwrap();
        assert!(Arc::ptr_eq(&frame, &object.hit(1).unwrap()));
        assert_eq!(object.committed_pages(), 1);
        assert_eq!(sim.live_frames(), 1);
        assert_eq!(object.hit(3).err(), Some(MmError::NotMapped));
    }

    #[test]
    fn test_fork_clone_breaks_sharing_on_write() {
        let (_sim, paging) = paging();
        let parent = VmObject::anonymous(&paging, PAGE_SIZE);
        parent.hit(0).unwrap().write(0, &[1, 2, 3]);

        let child = parent.clone_for_fork();
        assert!(!Arc::ptr_eq(&parent, &child));
        assert!(parent.is_page_shared(0));

        let (frame, refreshed) = child.frame_for_write(0).unwrap();
        assert!(refreshed);
        frame.write(0, &[9]);
        assert!(!parent.is_page_shared(0));

        let mut buf = [0u8; 3];
        parent.frame_at(0).unwrap().read(0, &mut buf);
        assert_eq!(buf, [1, 2, 3]);
        child.frame_at(0).unwrap().read(0, &mut buf);
        assert_eq!(buf, [9, 2, 3]);
    }

    #[test]
    fn test_last_owner_is_remapped_after_fork() {
        let (_sim, paging) = paging();
        let parent = VmObject::anonymous(&paging, PAGE_SIZE);
        parent.hit(0).unwrap();
        let child = parent.clone_for_fork();

        assert!(child.frame_for_write(0).unwrap().1);
        let (_, remap) = parent.frame_for_write(0).unwrap();
        assert!(remap);
        let (_, again) = parent.frame_for_write(0).unwrap();
        assert!(!again);
    }

    #[test]
    fn test_shared_data_is_shared_and_read_only() {
        let (_sim, paging) = paging();
        let object = VmObject::shared_data(&paging, &[0xAB; 5000]).unwrap();
        assert_eq!(object.page_count(), 2);
        assert_eq!(object.committed_pages(), 2);
        assert!(Arc::ptr_eq(&object, &object.clone_for_fork()));
        assert_eq!(object.frame_for_write(0).err(), Some(MmError::ReadOnly));
    }
}
