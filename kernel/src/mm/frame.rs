//! Physical Frames
//!
//! A frame pairs a physical page with the bytes it holds. Frames are
//! shared between VM objects by reference count: two objects holding the
//! same frame is exactly the copy-on-write state after fork.

use alloc::boxed::Box;
use alloc::sync::Arc;

use x86_64::PhysAddr;

use super::paging::Paging;
use super::MmError;
use crate::config::PAGE_SIZE_BYTES;
use crate::ke::SpinLock;

/// One physical page
pub struct Frame {
    phys: PhysAddr,
    data: SpinLock<Box<[u8; PAGE_SIZE_BYTES]>>,
    paging: Arc<dyn Paging>,
}

impl Frame {
    /// Allocate a zeroed frame
    pub fn allocate(paging: &Arc<dyn Paging>) -> Result<Arc<Frame>, MmError> {
        let phys = paging.allocate_frame()?;
        Ok(Arc::new(Frame {
            phys,
            data: SpinLock::new(Box::new([0u8; PAGE_SIZE_BYTES])),
            paging: paging.clone(),
        }))
    }

    /// Allocate a frame holding a copy of `self`
    pub fn duplicate(&self) -> Result<Arc<Frame>, MmError> {
        let copy = Frame::allocate(&self.paging)?;
        {
            let source = self.data.lock();
            copy.data.lock().copy_from_slice(&source[..]);
        }
        Ok(copy)
    }

    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Copy out `buf.len()` bytes starting at `offset`
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let data = self.data.lock();
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy `buf` in starting at `offset`
    pub fn write(&self, offset: usize, buf: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.paging.free_frame(self.phys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimPaging;

    #[test]
    fn test_frames_are_freed_on_drop() {
        let sim = Arc::new(SimPaging::new());
        let paging: Arc<dyn Paging> = sim.clone();
        let frame = Frame::allocate(&paging).unwrap();
        frame.write(10, b"hello");

        let copy = frame.duplicate().unwrap();
        assert_ne!(copy.phys(), frame.phys());
        let mut buf = [0u8; 5];
        copy.read(10, &mut buf);
        assert_eq!(&buf, b"hello");
        assert_eq!(sim.live_frames(), 2);

        drop(frame);
        drop(copy);
        assert_eq!(sim.live_frames(), 0);
    }
}
