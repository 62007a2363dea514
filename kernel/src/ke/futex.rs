//! Futex Wait Queues
//!
//! Waiters are keyed by (process, user address). The value check and the
//! enqueue happen under the table lock, so a wake issued after the value
//! changed can never be missed.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use super::event::KEvent;
use super::spinlock::SpinLock;
use crate::mm::MmError;
use crate::ps::ProcessId;

/// Identity of a futex word
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FutexKey {
    pub process: ProcessId,
    pub address: u64,
}

/// Why a futex wait did not enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutexError {
    /// The word no longer held the expected value
    WouldBlock,
    /// The word could not be read
    Fault(MmError),
}

impl From<MmError> for FutexError {
    fn from(error: MmError) -> Self {
        FutexError::Fault(error)
    }
}

/// All futex wait queues in the system
pub struct FutexTable {
    queues: SpinLock<BTreeMap<FutexKey, VecDeque<Arc<KEvent>>>>,
}

impl FutexTable {
    pub const fn new() -> Self {
        Self {
            queues: SpinLock::new(BTreeMap::new()),
        }
    }

    /// Enqueue a waiter on `key` if `read` still yields `expected`
    pub fn prepare_wait<F>(&self, key: FutexKey, expected: u32, read: F) -> Result<Arc<KEvent>, FutexError>
    where
        F: FnOnce() -> Result<u32, MmError>,
    {
        let mut queues = self.queues.lock();

        if read()? != expected {
            return Err(FutexError::WouldBlock);
        }

        let event = Arc::new(KEvent::new());
        queues.entry(key).or_default().push_back(event.clone());
        Ok(event)
    }

    /// Withdraw a waiter whose wait ended without a wake
    pub fn cancel(&self, key: FutexKey, event: &Arc<KEvent>) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(&key) {
            queue.retain(|e| !Arc::ptr_eq(e, event));
            if queue.is_empty() {
                queues.remove(&key);
            }
        }
    }

    /// Release up to `count` waiters in FIFO order
    pub fn wake(&self, key: FutexKey, count: usize) -> usize {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(&key) else {
            return 0;
        };

        let mut woken = 0;
        while woken < count {
            match queue.pop_front() {
                Some(event) => {
                    event.set();
                    woken += 1;
                }
                None => break,
            }
        }

        if queue.is_empty() {
            queues.remove(&key);
        }
        woken
    }

    /// Drop every queue owned by `process`, releasing its waiters
    pub fn purge_process(&self, process: ProcessId) -> usize {
        let mut queues = self.queues.lock();
        let mut released = 0;
        queues.retain(|key, queue| {
            if key.process != process {
                return true;
            }
            for event in queue.drain(..) {
                event.set();
                released += 1;
            }
            false
        });
        released
    }

    /// Number of waiters on `key`
    pub fn waiters(&self, key: FutexKey) -> usize {
        self.queues.lock().get(&key).map_or(0, VecDeque::len)
    }
}

impl Default for FutexTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(address: u64) -> FutexKey {
        FutexKey {
            process: ProcessId(3),
            address,
        }
    }

    #[test]
    fn test_mismatch_would_block() {
        let table = FutexTable::new();
        let result = table.prepare_wait(key(0x1000), 1, || Ok(2));
        assert_eq!(result.err(), Some(FutexError::WouldBlock));
        assert_eq!(table.waiters(key(0x1000)), 0);
    }

    #[test]
    fn test_fault_is_reported() {
        let table = FutexTable::new();
        let result = table.prepare_wait(key(0x1000), 1, || Err(MmError::NotMapped));
        assert_eq!(result.err(), Some(FutexError::Fault(MmError::NotMapped)));
    }

    #[test]
    fn test_wake_is_fifo_and_counted() {
        let table = FutexTable::new();
        let first = table.prepare_wait(key(0x2000), 0, || Ok(0)).unwrap();
        let second = table.prepare_wait(key(0x2000), 0, || Ok(0)).unwrap();
        let other = table.prepare_wait(key(0x3000), 0, || Ok(0)).unwrap();

        assert_eq!(table.wake(key(0x2000), 1), 1);
        assert!(first.is_signaled());
        assert!(!second.is_signaled());
        assert_eq!(table.wake(key(0x2000), 10), 1);
        assert!(second.is_signaled());
        assert_eq!(table.wake(key(0x2000), 10), 0);
        assert!(!other.is_signaled());
    }

    #[test]
    fn test_cancel_and_purge() {
        let table = FutexTable::new();
        let a = table.prepare_wait(key(0x10), 0, || Ok(0)).unwrap();
        let b = table.prepare_wait(key(0x20), 0, || Ok(0)).unwrap();
        table.cancel(key(0x10), &a);
        assert_eq!(table.waiters(key(0x10)), 0);

        assert_eq!(table.purge_process(ProcessId(3)), 1);
        assert!(b.is_signaled());
        assert_eq!(table.waiters(key(0x20)), 0);
    }
}
