//! Kernel Processor Control Block (KPRCB)
//!
//! Per-processor scheduling state:
//! - The run queue of threads waiting for this CPU
//! - The current thread, kept under the same lock as the queue
//! - The idle thread
//! - The IPI request summary
//!
//! In a multiprocessor system, each CPU has its own KPRCB.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use super::spinlock::{SpinLock, SpinLockGuard};
use super::thread::Thread;
use crate::ps::ProcessId;

/// Processor number
pub type CpuId = usize;

/// A processor's run queue plus its current-thread cell
#[derive(Default)]
pub struct RunQueue {
    threads: Vec<Arc<Thread>>,
    current: Option<Arc<Thread>>,
}

impl RunQueue {
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Thread>> {
        self.threads.get(index)
    }

    pub fn remove_at(&mut self, index: usize) -> Arc<Thread> {
        self.threads.remove(index)
    }

    /// Remove `thread` if queued, returning whether it was
    pub fn remove(&mut self, thread: &Arc<Thread>) -> bool {
        match self.threads.iter().position(|t| Arc::ptr_eq(t, thread)) {
            Some(index) => {
                self.threads.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, thread: Arc<Thread>) {
        self.threads.push(thread);
    }

    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.threads.iter().any(|t| Arc::ptr_eq(t, thread))
    }

    /// Whether any queued thread belongs to `pid`
    pub fn holds_process(&self, pid: ProcessId) -> bool {
        self.threads.iter().any(|t| t.pid() == pid)
    }

    /// Drop every queued thread of `pid` except `keep`, returning the count
    pub fn remove_process(&mut self, pid: ProcessId, keep: Option<&Arc<Thread>>) -> usize {
        self.remove_matching(|t| t.pid() == pid, keep)
    }

    /// Drop every queued thread `matches` selects except `keep`
    pub fn remove_matching<F>(&mut self, matches: F, keep: Option<&Arc<Thread>>) -> usize
    where
        F: Fn(&Arc<Thread>) -> bool,
    {
        let before = self.threads.len();
        self.threads.retain(|t| {
            !matches(t) || keep.map_or(false, |keep| Arc::ptr_eq(t, keep))
        });
        before - self.threads.len()
    }

    pub fn threads(&self) -> &[Arc<Thread>] {
        &self.threads
    }

    pub fn current(&self) -> Option<&Arc<Thread>> {
        self.current.as_ref()
    }

    pub fn set_current(&mut self, thread: Option<Arc<Thread>>) -> Option<Arc<Thread>> {
        core::mem::replace(&mut self.current, thread)
    }
}

/// Kernel Processor Control Block
pub struct KPrcb {
    number: CpuId,
    run_queue: SpinLock<RunQueue>,
    idle_thread: SpinLock<Option<Arc<Thread>>>,
    /// Pending IPI requests (bitmask of [`IpiRequest`](super::ipi::IpiRequest))
    pub(super) request_summary: AtomicU32,
    context_switches: AtomicU64,
}

impl KPrcb {
    pub fn new(number: CpuId) -> Self {
        Self {
            number,
            run_queue: SpinLock::new(RunQueue::default()),
            idle_thread: SpinLock::new(None),
            request_summary: AtomicU32::new(0),
            context_switches: AtomicU64::new(0),
        }
    }

    pub fn number(&self) -> CpuId {
        self.number
    }

    pub fn run_queue(&self) -> SpinLockGuard<'_, RunQueue> {
        self.run_queue.lock()
    }

    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.idle_thread.lock().clone()
    }

    pub fn set_idle_thread(&self, thread: Arc<Thread>) {
        *self.idle_thread.lock() = Some(thread);
    }

    /// Currently running thread
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.run_queue.lock().current().cloned()
    }

    pub fn pending_requests(&self) -> u32 {
        self.request_summary.load(Ordering::Acquire)
    }

    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    pub(super) fn note_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }
}
