//! Process Registry and Reaper
//!
//! Every live process is reachable by PID from the table. A process that
//! has finished dying is queued for destruction rather than freed in
//! place, because the last steps of termination may still be running on
//! one of its own kernel stacks. [`ProcessTable::collect`] frees queued
//! processes once their parent has let go of them.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use super::{Process, ProcessId};
use crate::ke::SpinLock;

/// PID -> process registry plus the deferred-destruction queue
pub struct ProcessTable {
    processes: RwLock<BTreeMap<ProcessId, Arc<Process>>>,
    destroyed: SpinLock<Vec<Arc<Process>>>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            processes: RwLock::new(BTreeMap::new()),
            destroyed: SpinLock::new(Vec::new()),
        }
    }

    pub fn register(&self, process: Arc<Process>) {
        log::trace!("[PS] [{}] registered '{}'", process.pid(), process.name());
        self.processes.write().insert(process.pid(), process);
    }

    pub fn unregister(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.write().remove(&pid)
    }

    pub fn get(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.processes.read().get(&pid).cloned()
    }

    pub fn count(&self) -> usize {
        self.processes.read().len()
    }

    /// Every registered process in PID order
    pub fn snapshot(&self) -> Vec<Arc<Process>> {
        self.processes.read().values().cloned().collect()
    }

    // ========================================================================
    // Reaper
    // ========================================================================

    /// Queue a Dead process for destruction
    pub fn mark_for_destruction(&self, process: Arc<Process>) {
        log::trace!("[PS] [{}] queued for destruction", process.pid());
        self.destroyed.lock().push(process);
    }

    pub fn pending_destruction(&self) -> usize {
        self.destroyed.lock().len()
    }

    /// Destroy every queued process that no parent still refers to.
    ///
    /// Returns how many were destroyed; parented ones stay queued.
    pub fn collect(&self) -> usize {
        let ready: Vec<Arc<Process>> = {
            let mut queue = self.destroyed.lock();
            let (ready, parented): (Vec<_>, Vec<_>) =
                queue.drain(..).partition(|p| !p.has_parent());
            *queue = parented;
            ready
        };

        for process in &ready {
            self.destroy(process);
        }
        ready.len()
    }

    /// Destroy one queued process now if it is unparented
    pub fn reap(&self, pid: ProcessId) -> bool {
        let process = {
            let mut queue = self.destroyed.lock();
            match queue.iter().position(|p| p.pid() == pid && !p.has_parent()) {
                Some(index) => queue.remove(index),
                None => return false,
            }
        };
        self.destroy(&process);
        true
    }

    fn destroy(&self, process: &Arc<Process>) {
        process.destroy();
        self.unregister(process.pid());
        log::debug!("[PS] [{}] reaped", process.pid());
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
