//! Process Manager
//!
//! The manager ties the process core to its collaborators (platform,
//! paging, namespace) and owns the system-wide state: the scheduler, the
//! process table, the PID allocator, the shared-data singleton and the
//! futex queues. Creation, fork, exec and termination are implemented
//! as `impl ProcessManager` blocks in their own modules.
//!
//! # Kernel Entry and Exit
//!
//! A thread holds its kernel lock while it runs kernel code on its own
//! behalf. [`ProcessManager::enter_kernel`] takes it;
//! [`ProcessManager::leave_kernel`] delivers pending signals and releases
//! it, or parks the thread for good if it has been asked to terminate.

use alloc::sync::Arc;

use x86_64::VirtAddr;

use super::signal::{default_action, DefaultAction, SignalAction, SIGKILL};
use super::{PidAllocator, Process, ProcessId, ProcessTable, PsError};
use crate::hal::Platform;
use crate::ke::bugcheck::{codes, ke_bug_check_ex};
use crate::ke::futex::{FutexKey, FutexTable};
use crate::ke::{Scheduler, Thread, ThreadState, WaitStatus};
use crate::mm::{MmError, Paging, SharedData, SharedDataImage};
use crate::ob::Namespace;

/// System-wide process management state
pub struct ProcessManager {
    pub(super) platform: Arc<dyn Platform>,
    pub(super) paging: Arc<dyn Paging>,
    pub(super) namespace: Arc<dyn Namespace>,
    pub(super) scheduler: Scheduler,
    pub(super) table: ProcessTable,
    pub(super) pids: PidAllocator,
    pub(super) shared_data: SharedData,
    pub(super) futexes: FutexTable,
}

impl ProcessManager {
    pub fn new(
        platform: Arc<dyn Platform>,
        paging: Arc<dyn Paging>,
        namespace: Arc<dyn Namespace>,
        shared_data: SharedDataImage,
    ) -> Self {
        let scheduler = Scheduler::new(platform.processor_count());
        Self {
            platform,
            paging,
            namespace,
            scheduler,
            table: ProcessTable::new(),
            pids: PidAllocator::new(),
            shared_data: SharedData::new(shared_data),
            futexes: FutexTable::new(),
        }
    }

    /// Give every processor an idle process and make it current
    pub fn init(&self, idle_entry: VirtAddr) -> Result<(), PsError> {
        for cpu in 0..self.scheduler.processor_count() {
            let idle = self.create_idle_process(idle_entry)?;
            let thread = idle.main_thread();
            let prcb = self.scheduler.processor(cpu);
            prcb.set_idle_thread(thread.clone());
            prcb.run_queue().set_current(Some(thread));
        }
        log::info!(
            "[PS] initialized on {} processor(s)",
            self.scheduler.processor_count()
        );
        Ok(())
    }

    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    pub fn paging(&self) -> &Arc<dyn Paging> {
        &self.paging
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn table(&self) -> &ProcessTable {
        &self.table
    }

    pub fn shared_data(&self) -> &SharedData {
        &self.shared_data
    }

    pub fn futexes(&self) -> &FutexTable {
        &self.futexes
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Thread running on the calling processor
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.scheduler.current_thread(self.platform.current_processor())
    }

    pub fn current_process(&self) -> Option<Arc<Process>> {
        self.current_thread().and_then(|t| t.process())
    }

    pub fn lookup(&self, pid: ProcessId) -> Option<Arc<Process>> {
        self.table.get(pid)
    }

    /// Current thread and its process
    pub(super) fn current(&self) -> Result<(Arc<Thread>, Arc<Process>), PsError> {
        let thread = self.current_thread().ok_or(PsError::NoCurrentThread)?;
        let process = thread.process().ok_or(PsError::NoCurrentThread)?;
        Ok((thread, process))
    }

    // ========================================================================
    // Kernel entry and exit
    // ========================================================================

    /// Pin `thread` for a kernel entry (syscall or fault).
    ///
    /// A thread that was retired while it ran in user mode never gets
    /// the pin back; it gives up its processor instead.
    pub fn enter_kernel(&self, thread: &Arc<Thread>) {
        loop {
            if thread.kernel_lock().try_acquire() {
                return;
            }
            if thread.state() == ThreadState::Dying {
                self.relinquish(thread);
            }
            self.platform.yield_now();
        }
    }

    /// Return-to-user hook.
    ///
    /// Runs pending signal dispositions, then releases the pin. Returns a
    /// signal the caller must deliver to a user handler, if any. A thread
    /// that has been asked to terminate does not return.
    pub fn leave_kernel(&self, thread: &Arc<Thread>) -> Option<u32> {
        let handled = self.dispatch_pending_signals(thread);
        if thread.state() == ThreadState::Zombie {
            self.park(thread);
        }
        thread.kernel_lock().release();
        handled
    }

    /// Act on pending signals with a kernel disposition.
    ///
    /// SIGKILL and default-terminate signals drive termination; ignored
    /// signals are dropped. The first signal with a user handler is
    /// returned for delivery.
    pub fn dispatch_pending_signals(&self, thread: &Arc<Thread>) -> Option<u32> {
        let process = thread.process()?;

        while let Some(signal) = thread.take_pending_signal() {
            let action = if signal == SIGKILL {
                SignalAction::Default
            } else {
                process
                    .signal_handlers()
                    .get(signal as usize)
                    .map_or(SignalAction::Default, |h| h.action)
            };

            match action {
                SignalAction::Handler(_) => return Some(signal),
                SignalAction::Ignore => continue,
                SignalAction::Default => match default_action(signal) {
                    DefaultAction::Terminate => {
                        log::debug!(
                            "[PS] [{}] thread {} terminating on signal {}",
                            process.pid(),
                            thread.tid().0,
                            signal
                        );
                        self.die(&process);
                        // Another caller is driving termination.
                        self.park(thread);
                    }
                    DefaultAction::Ignore | DefaultAction::Stop | DefaultAction::Continue => {}
                },
            }
        }
        None
    }

    /// Wait to be retired, then give up the processor for good
    pub(super) fn park(&self, thread: &Arc<Thread>) -> ! {
        thread.kernel_lock().release();
        while thread.state() != ThreadState::Dying {
            self.platform.yield_now();
        }
        self.relinquish(thread)
    }

    /// Hand the processor to whatever its queue names next. A retired
    /// thread never comes back from this.
    pub(super) fn relinquish(&self, thread: &Arc<Thread>) -> ! {
        let cpu = self.platform.current_processor();
        self.platform.dispatch(cpu);
        ke_bug_check_ex(
            codes::DEAD_PROCESS_CONTINUED_EXECUTION,
            thread.pid().as_u32() as u64,
            thread.tid().0 as u64,
            cpu as u64,
            0,
        )
    }

    // ========================================================================
    // Futex
    // ========================================================================

    /// Block the current thread on the user word at `address` while it
    /// still holds `expected`
    pub fn futex_wait(&self, address: VirtAddr, expected: u32) -> Result<(), PsError> {
        let (thread, process) = self.current()?;
        let space = process.address_space().ok_or(PsError::Mm(MmError::NotMapped))?;
        let key = FutexKey {
            process: process.pid(),
            address: address.as_u64(),
        };

        let event = self
            .futexes
            .prepare_wait(key, expected, || space.read_u32(address))?;

        match event.wait(Some(&thread), self.platform.as_ref()) {
            WaitStatus::Signaled => Ok(()),
            WaitStatus::Interrupted => {
                self.futexes.cancel(key, &event);
                Err(PsError::Interrupted)
            }
        }
    }

    /// Wake up to `count` waiters on `address`
    pub fn futex_wake(&self, address: VirtAddr, count: usize) -> Result<usize, PsError> {
        let (_, process) = self.current()?;
        let key = FutexKey {
            process: process.pid(),
            address: address.as_u64(),
        };
        Ok(self.futexes.wake(key, count))
    }
}
