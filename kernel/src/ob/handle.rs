//! Handle Table Implementation
//!
//! Each process has a handle table that maps handles (small integers)
//! to kernel objects. A new table starts with a few reserved empty slots
//! (standard input, output and error); allocation takes the lowest free
//! slot. Entries carry a close-on-exec attribute honoured by exec.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{KernelObject, ObError};
use crate::config::MAX_HANDLES;
use crate::ke::SpinLock;

/// Handle type
pub type Handle = u32;

/// Standard input slot
pub const STDIN_HANDLE: Handle = 0;

/// Standard output slot
pub const STDOUT_HANDLE: Handle = 1;

/// Standard error slot
pub const STDERR_HANDLE: Handle = 2;

/// Handle attributes
pub mod handle_attributes {
    /// Close the handle when the process execs (O_CLOEXEC)
    pub const CLOSE_ON_EXEC: u32 = 0o2000000;
}

/// Handle table entry
#[derive(Clone)]
pub struct HandleEntry {
    pub object: Arc<dyn KernelObject>,
    pub close_on_exec: bool,
}

impl HandleEntry {
    pub fn new(object: Arc<dyn KernelObject>) -> Self {
        Self {
            object,
            close_on_exec: false,
        }
    }
}

/// Handle table for a process
pub struct HandleTable {
    entries: SpinLock<Vec<Option<HandleEntry>>>,
}

impl HandleTable {
    /// Create a table with `reserved` empty leading slots
    pub fn new(reserved: usize) -> Self {
        let mut entries = Vec::with_capacity(reserved.max(8));
        entries.resize_with(reserved, || None);
        Self {
            entries: SpinLock::new(entries),
        }
    }

    /// Store `entry` in the lowest free slot
    pub fn allocate(&self, entry: HandleEntry) -> Handle {
        let mut entries = self.entries.lock();
        let index = match entries.iter().position(Option::is_none) {
            Some(index) => {
                entries[index] = Some(entry);
                index
            }
            None => {
                entries.push(Some(entry));
                entries.len() - 1
            }
        };
        index as Handle
    }

    /// Store `object` in the lowest free slot
    pub fn insert(&self, object: Arc<dyn KernelObject>) -> Handle {
        self.allocate(HandleEntry::new(object))
    }

    /// Store `entry` at `handle`, replacing whatever was there
    pub fn replace(&self, handle: Handle, entry: Option<HandleEntry>) -> Result<(), ObError> {
        let index = handle as usize;
        if index >= MAX_HANDLES {
            return Err(ObError::BadHandle);
        }
        let previous = {
            let mut entries = self.entries.lock();
            if index >= entries.len() {
                entries.resize_with(index + 1, || None);
            }
            core::mem::replace(&mut entries[index], entry)
        };
        drop(previous);
        Ok(())
    }

    pub fn get(&self, handle: Handle) -> Option<HandleEntry> {
        self.entries.lock().get(handle as usize).cloned().flatten()
    }

    pub fn object(&self, handle: Handle) -> Option<Arc<dyn KernelObject>> {
        self.get(handle).map(|entry| entry.object)
    }

    /// Close `handle`
    pub fn close(&self, handle: Handle) -> Result<(), ObError> {
        let removed = {
            let mut entries = self.entries.lock();
            entries
                .get_mut(handle as usize)
                .and_then(Option::take)
                .ok_or(ObError::BadHandle)?
        };
        drop(removed);
        Ok(())
    }

    /// Duplicate `old`.
    ///
    /// With `new` the duplicate replaces whatever `new` held; otherwise it
    /// takes the lowest free slot. `flags` may only carry close-on-exec.
    pub fn dup(&self, old: Handle, new: Option<Handle>, flags: u32) -> Result<Handle, ObError> {
        if flags & !handle_attributes::CLOSE_ON_EXEC != 0 {
            return Err(ObError::InvalidArgument);
        }
        if new == Some(old) {
            return Err(ObError::InvalidArgument);
        }

        let source = self.get(old).ok_or(ObError::BadHandle)?;
        let entry = HandleEntry {
            object: source.object,
            close_on_exec: flags & handle_attributes::CLOSE_ON_EXEC != 0,
        };

        match new {
            Some(handle) => {
                self.replace(handle, Some(entry))?;
                Ok(handle)
            }
            None => Ok(self.allocate(entry)),
        }
    }

    /// Set or clear close-on-exec on `handle`
    pub fn set_close_on_exec(&self, handle: Handle, close_on_exec: bool) -> Result<(), ObError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(handle as usize)
            .and_then(Option::as_mut)
            .ok_or(ObError::BadHandle)?;
        entry.close_on_exec = close_on_exec;
        Ok(())
    }

    /// Close every close-on-exec handle, returning how many went
    pub fn close_on_exec(&self) -> usize {
        let removed: Vec<HandleEntry> = {
            let mut entries = self.entries.lock();
            entries
                .iter_mut()
                .filter(|slot| slot.as_ref().map_or(false, |e| e.close_on_exec))
                .filter_map(Option::take)
                .collect()
        };
        removed.len()
    }

    /// Replace this table's contents with a copy of `other`'s
    pub fn copy_from(&self, other: &HandleTable) {
        let snapshot = other.entries.lock().clone();
        *self.entries.lock() = snapshot;
    }

    /// Drop every handle
    pub fn clear(&self) {
        let removed = core::mem::take(&mut *self.entries.lock());
        drop(removed);
    }

    /// Number of open handles
    pub fn len(&self) -> usize {
        self.entries.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestObject;

    #[test]
    fn test_reserved_slots_stay_empty() {
        let table = HandleTable::new(3);
        assert!(table.get(STDIN_HANDLE).is_none());
        let handle = table.insert(TestObject::new("a"));
        assert_eq!(handle, 0);
        let next = table.insert(TestObject::new("b"));
        assert_eq!(next, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lowest_free_slot_is_reused() {
        let table = HandleTable::new(0);
        for name in ["a", "b", "c"] {
            table.insert(TestObject::new(name));
        }
        table.close(1).unwrap();
        assert_eq!(table.insert(TestObject::new("d")), 1);
        assert_eq!(table.close(9).err(), Some(ObError::BadHandle));
    }

    #[test]
    fn test_dup_rules() {
        let table = HandleTable::new(0);
        let a = table.insert(TestObject::new("a"));

        assert_eq!(table.dup(a, Some(a), 0).err(), Some(ObError::InvalidArgument));
        assert_eq!(table.dup(a, None, 0x1).err(), Some(ObError::InvalidArgument));
        assert_eq!(table.dup(7, None, 0).err(), Some(ObError::BadHandle));

        let b = table.dup(a, None, 0).unwrap();
        assert_eq!(b, 1);
        let c = table.dup(a, Some(5), handle_attributes::CLOSE_ON_EXEC).unwrap();
        assert_eq!(c, 5);
        assert!(table.get(5).unwrap().close_on_exec);
        assert!(Arc::ptr_eq(&table.object(5).unwrap(), &table.object(a).unwrap()));
    }

    #[test]
    fn test_dup_target_is_bounded() {
        let table = HandleTable::new(0);
        let a = table.insert(TestObject::new("a"));

        assert_eq!(table.dup(a, Some(u32::MAX), 0).err(), Some(ObError::BadHandle));
        let limit = MAX_HANDLES as Handle;
        assert_eq!(table.dup(a, Some(limit), 0).err(), Some(ObError::BadHandle));
        assert_eq!(table.dup(a, Some(limit - 1), 0), Ok(limit - 1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_close_on_exec_sweep() {
        let table = HandleTable::new(0);
        let keep = table.insert(TestObject::new("keep"));
        let go = table.insert(TestObject::new("go"));
        table.set_close_on_exec(go, true).unwrap();

        assert_eq!(table.close_on_exec(), 1);
        assert!(table.get(keep).is_some());
        assert!(table.get(go).is_none());
    }

    #[test]
    fn test_copy_shares_objects() {
        let parent = HandleTable::new(3);
        parent.replace(1, Some(HandleEntry::new(TestObject::new("log")))).unwrap();
        let child = HandleTable::new(3);
        child.copy_from(&parent);

        assert!(Arc::ptr_eq(&child.object(1).unwrap(), &parent.object(1).unwrap()));
        child.clear();
        assert!(child.is_empty());
        assert_eq!(parent.len(), 1);
    }
}
