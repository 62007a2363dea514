//! Thread Scheduler
//!
//! Round-robin over per-processor run queues. New threads go to the
//! least loaded processor; [`Scheduler::balance`] moves threads between
//! queues under the global balance lock, which the termination path also
//! holds while it evicts a dying process from every queue.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::bugcheck::{codes, ke_bug_check_ex};
use super::ipi::{ki_ipi_send_reschedule, ki_ipi_take_requests};
use super::prcb::{CpuId, KPrcb};
use super::spinlock::{SpinLock, SpinLockGuard};
use super::thread::{Thread, ThreadState};
use crate::hal::Platform;
use crate::ps::ProcessId;

/// Proof that the caller holds the balance lock
pub type BalanceGuard<'a> = SpinLockGuard<'a, ()>;

/// Multiprocessor round-robin scheduler
pub struct Scheduler {
    processors: Vec<KPrcb>,
    balance_lock: SpinLock<()>,
}

impl Scheduler {
    pub fn new(processor_count: usize) -> Self {
        let count = processor_count.max(1);
        Self {
            processors: (0..count).map(KPrcb::new).collect(),
            balance_lock: SpinLock::new(()),
        }
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Control block of `cpu`
    ///
    /// Panics if `cpu` is out of range, which only a broken platform can do.
    pub fn processor(&self, cpu: CpuId) -> &KPrcb {
        &self.processors[cpu]
    }

    pub fn processors(&self) -> &[KPrcb] {
        &self.processors
    }

    /// Current thread of `cpu`
    pub fn current_thread(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.processors.get(cpu).and_then(KPrcb::current_thread)
    }

    /// Stop all rebalancing until the guard is dropped
    pub fn lock_balance(&self) -> BalanceGuard<'_> {
        self.balance_lock.lock()
    }

    /// Queue a new thread on the least loaded processor
    pub fn insert_new_thread(&self, thread: Arc<Thread>) -> CpuId {
        let _balance = self.lock_balance();

        let target = self
            .processors
            .iter()
            .min_by_key(|prcb| prcb.run_queue().len())
            .map_or(0, KPrcb::number);

        thread.refill_time_slice();
        self.processors[target].run_queue().push(thread);
        target
    }

    /// Move one thread from the busiest queue to the idlest.
    ///
    /// Returns whether a thread moved.
    pub fn balance(&self) -> bool {
        let _balance = self.lock_balance();

        let lengths: Vec<usize> = self.processors.iter().map(|p| p.run_queue().len()).collect();
        let (Some(busiest), Some(idlest)) = (
            (0..lengths.len()).max_by_key(|&i| lengths[i]),
            (0..lengths.len()).min_by_key(|&i| lengths[i]),
        ) else {
            return false;
        };

        if lengths[busiest] < lengths[idlest] + 2 {
            return false;
        }

        let moved = {
            let mut rq = self.processors[busiest].run_queue();
            let index = (0..rq.len()).rev().find(|&i| {
                rq.get(i).map_or(false, |t| t.state() == ThreadState::Running)
            });
            index.map(|i| rq.remove_at(i))
        };

        match moved {
            Some(thread) => {
                self.processors[idlest].run_queue().push(thread);
                true
            }
            None => false,
        }
    }

    /// Pick the next thread for `cpu`.
    ///
    /// The outgoing thread goes to the back of the queue if it can still
    /// run. Dying and zero-slice threads are never picked; with nothing
    /// dispatchable the idle thread runs.
    pub fn schedule(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        let prcb = self.processor(cpu);
        let _requests = ki_ipi_take_requests(prcb);
        let idle = prcb.idle_thread();

        let mut rq = prcb.run_queue();

        if let Some(outgoing) = rq.current().cloned() {
            let is_idle = idle.as_ref().map_or(false, |i| Arc::ptr_eq(i, &outgoing));
            if !is_idle && outgoing.is_dispatchable() && !rq.contains(&outgoing) {
                rq.push(outgoing);
            }
        }

        let next = (0..rq.len())
            .find(|&i| rq.get(i).map_or(false, |t| t.is_dispatchable()))
            .map(|i| rq.remove_at(i));

        let next = match next {
            Some(thread) => {
                thread.refill_time_slice();
                Some(thread)
            }
            None => idle,
        };

        rq.set_current(next.clone());
        prcb.note_context_switch();
        next
    }

    /// Remove every thread of `pid` from every run queue.
    ///
    /// On `local` the current thread is left alone (it is the caller). On
    /// other processors a current thread of `pid` must already be Dying;
    /// it is cleared and that processor alone is sent a reschedule IPI.
    pub fn evict_process(
        &self,
        _balance: &BalanceGuard<'_>,
        pid: ProcessId,
        local: CpuId,
        platform: &dyn Platform,
    ) -> usize {
        self.evict_where(|t| t.pid() == pid, local, platform)
    }

    /// Remove one retired thread from every run queue, with the same
    /// rules as [`Scheduler::evict_process`]
    pub fn evict_thread(
        &self,
        _balance: &BalanceGuard<'_>,
        thread: &Arc<Thread>,
        local: CpuId,
        platform: &dyn Platform,
    ) -> usize {
        self.evict_where(|t| Arc::ptr_eq(t, thread), local, platform)
    }

    fn evict_where<F>(&self, matches: F, local: CpuId, platform: &dyn Platform) -> usize
    where
        F: Fn(&Arc<Thread>) -> bool,
    {
        let mut removed = 0;

        for prcb in &self.processors {
            let mut rq = prcb.run_queue();

            if prcb.number() == local {
                let current = rq.current().cloned();
                removed += rq.remove_matching(&matches, current.as_ref());
                continue;
            }

            let mut cleared = false;
            if let Some(current) = rq.current().filter(|&t| matches(t)).cloned() {
                if current.state() != ThreadState::Dying {
                    ke_bug_check_ex(
                        codes::THREAD_NOT_TERMINATED,
                        current.pid().as_u32() as u64,
                        current.tid().0 as u64,
                        current.state() as u64,
                        prcb.number() as u64,
                    );
                }
                rq.set_current(None);
                cleared = true;
            }
            removed += rq.remove_matching(&matches, None);
            drop(rq);

            if cleared {
                ki_ipi_send_reschedule(prcb, platform);
            }
        }

        removed
    }
}
