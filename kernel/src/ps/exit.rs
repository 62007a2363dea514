//! Process Termination
//!
//! `die` is cooperative: every thread of the process must give up its
//! kernel lock before it can be retired, so the driver asks each one to
//! stop and waits for it.
//!
//! Order:
//! 1. A member thread other than main hands the job to main and parks
//! 2. Win Running -> Dying; losers park (members) or return (others)
//! 3. Mark every other thread Zombie, interrupting blocked ones
//! 4. Retire each thread once its kernel lock can be taken
//! 5. Terminate every child and wait for it to reach Dead
//! 6. Evict the threads from every run queue (balance lock held)
//! 7. Close all handles, fire watchers (Dead)
//! 8. Drop futex waiters, tell a running parent (SIGCHLD)
//! 9. Queue the process for destruction
//! 10. A member driver retires itself and leaves the processor

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::signal::{SIGCHLD, SIGKILL};
use super::watcher::{WatchEvents, Watcher};
use super::{Process, ProcessId, ProcessManager, ProcessState, PsError};
use crate::arch::interrupts;
use crate::ke::bugcheck::{codes, ke_bug_check_ex};
use crate::ke::thread::ZombieOutcome;
use crate::ke::{Thread, ThreadState, WaitStatus};

impl ProcessManager {
    /// Terminate `process`.
    ///
    /// When the calling thread belongs to `process` this does not return.
    /// Any other caller gets control back once the process is Dead, or at
    /// once if someone else is already driving its termination.
    pub fn die(&self, process: &Arc<Process>) {
        let pid = process.pid();
        let caller = self.current_thread().filter(|t| t.pid() == pid);

        if let Some(thread) = &caller {
            let main = process.main_thread();
            if !Arc::ptr_eq(thread, &main) {
                log::trace!(
                    "[PS] [{}] thread {} handing termination to the main thread",
                    pid,
                    thread.tid().0
                );
                main.signal(SIGKILL);
                self.park(thread);
            }
        }

        if !process.begin_dying() {
            if let Some(thread) = &caller {
                self.park(thread);
            }
            return;
        }

        if let Some(thread) = &caller {
            // Held from here on so nobody can retire the driver
            if thread.kernel_lock().try_acquire() {
                log::trace!("[PS] [{}] driver thread {} pinned on entry", pid, thread.tid().0);
            }
            debug_assert!(thread.kernel_lock().is_held());
        }

        log::debug!("[PS] [{}] Killing threads...", pid);
        let others: Vec<Arc<Thread>> = process
            .threads()
            .into_iter()
            .filter(|t| !is_caller(caller.as_ref(), t))
            .collect();
        self.retire_threads(&others, None);

        self.terminate_children(process);

        {
            let balance = self.scheduler.lock_balance();
            for thread in process.threads() {
                if !is_caller(caller.as_ref(), &thread) && thread.state() != ThreadState::Dying {
                    ke_bug_check_ex(
                        codes::THREAD_NOT_TERMINATED,
                        pid.as_u32() as u64,
                        thread.tid().0 as u64,
                        thread.state() as u64,
                        0,
                    );
                }
            }
            let local = self.platform.current_processor();
            let evicted = self
                .scheduler
                .evict_process(&balance, pid, local, self.platform.as_ref());
            log::trace!("[PS] [{}] evicted {} queued thread(s)", pid, evicted);
        }

        let closed = process.handles().len();
        process.handles().clear();
        let watchers = process.mark_dead();
        let waiters = self.futexes.purge_process(pid);
        log::debug!(
            "[PS] [{}] dead ({} handles closed, {} watchers, {} futex waiters)",
            pid,
            closed,
            watchers,
            waiters
        );

        if let Some(parent) = process.parent() {
            if parent.is_running() {
                parent.main_thread().signal(SIGCHLD);
            }
        }

        self.table.mark_for_destruction(process.clone());

        if let Some(thread) = caller {
            self.retire_current(&thread);
        }
    }

    /// Retire every thread of `process` except `caller`.
    ///
    /// The retired threads are evicted and dropped from the thread list
    /// and `caller` becomes the main thread. Returns how many were killed.
    /// If the process starts dying meanwhile, `caller` is retired with the
    /// rest and this does not return.
    pub fn kill_all_other_threads(
        &self,
        process: &Arc<Process>,
        caller: &Arc<Thread>,
    ) -> Result<usize, PsError> {
        if caller.pid() != process.pid() {
            return Err(PsError::NotCurrentProcess);
        }

        let others: Vec<Arc<Thread>> = process
            .threads()
            .into_iter()
            .filter(|t| !Arc::ptr_eq(t, caller))
            .collect();
        if others.is_empty() {
            return Ok(0);
        }

        log::debug!(
            "[PS] [{}] killing {} thread(s) other than {}",
            process.pid(),
            others.len(),
            caller.tid().0
        );
        self.retire_threads(&others, Some(caller));

        {
            let balance = self.scheduler.lock_balance();
            let local = self.platform.current_processor();
            for thread in &others {
                self.scheduler
                    .evict_thread(&balance, thread, local, self.platform.as_ref());
            }
        }

        Ok(process.remove_threads_except(caller).len())
    }

    /// Mark `threads` Zombie and wait until each is retired, by this
    /// sweep or a concurrent one.
    ///
    /// A `caller` that is itself asked to terminate meanwhile parks
    /// instead of returning.
    fn retire_threads(&self, threads: &[Arc<Thread>], caller: Option<&Arc<Thread>>) {
        let mut running: Vec<&Arc<Thread>> = Vec::new();
        for thread in threads {
            if thread.mark_zombie() == ZombieOutcome::AlreadyDying {
                continue;
            }
            if !thread.try_retire() {
                running.push(thread);
            }
        }

        loop {
            if let Some(caller) = caller {
                if caller.state() == ThreadState::Zombie {
                    self.park(caller);
                }
            }
            if running.is_empty() {
                return;
            }
            self.platform.yield_now();
            // A thread retired by the other sweep keeps its pin forever
            running.retain(|t| t.state() != ThreadState::Dying && !t.try_retire());
        }
    }

    /// Terminate every child of `process` and unlink it once Dead
    fn terminate_children(&self, process: &Arc<Process>) {
        for child in process.children() {
            if child.is_running() {
                if child.is_started() {
                    child.main_thread().signal(SIGKILL);
                } else {
                    // Nothing will ever run it, so drive it from here
                    self.die(&child);
                }
            }

            let watcher = Watcher::new();
            if child.watch(watcher.clone(), WatchEvents::TERMINATED).is_ok() {
                while watcher.wait(None, self.platform.as_ref()) != WaitStatus::Signaled {
                    self.platform.yield_now();
                }
            }

            process.remove_child(child.pid());
            child.set_parent(None);
            log::trace!("[PS] [{}] released child {}", process.pid(), child.pid());
        }
    }

    /// Retire the calling thread of a Dead process and leave the processor
    fn retire_current(&self, thread: &Arc<Thread>) -> ! {
        let cpu = self.platform.current_processor();
        interrupts::without_interrupts(|| self.paging.activate(self.paging.kernel_root()));

        {
            let prcb = self.scheduler.processor(cpu);
            let idle = prcb.idle_thread();
            let mut rq = prcb.run_queue();
            thread.mark_zombie();
            thread.retire();
            rq.remove(thread);
            rq.set_current(idle);
        }

        log::trace!("[PS] [{}] driver thread {} retired", thread.pid(), thread.tid().0);
        self.relinquish(thread)
    }

    // ========================================================================
    // Child reaping
    // ========================================================================

    /// Block until child `pid` is Dead, then unlink it
    pub fn wait_child(&self, pid: ProcessId) -> Result<ProcessId, PsError> {
        let (thread, process) = self.current()?;
        let child = process.child(pid).ok_or(PsError::NoSuchChild)?;

        let watcher = Watcher::new();
        child.watch(watcher.clone(), WatchEvents::TERMINATED)?;

        loop {
            match watcher.wait(Some(&thread), self.platform.as_ref()) {
                WaitStatus::Signaled => break,
                WaitStatus::Interrupted if watcher.is_signaled() => break,
                WaitStatus::Interrupted
                    if !process.is_running() && thread.state() != ThreadState::Zombie =>
                {
                    self.platform.yield_now();
                }
                WaitStatus::Interrupted => {
                    child.unwatch(&watcher);
                    return Err(PsError::Interrupted);
                }
            }
        }

        self.unlink_child(&process, pid)
    }

    /// Unlink child `pid`, which must already be Dead
    pub fn release_child(&self, pid: ProcessId) -> Result<ProcessId, PsError> {
        let (_, process) = self.current()?;
        self.unlink_child(&process, pid)
    }

    fn unlink_child(&self, parent: &Process, pid: ProcessId) -> Result<ProcessId, PsError> {
        let child = parent.child(pid).ok_or(PsError::NoSuchChild)?;
        if child.state() != ProcessState::Dead {
            return Err(PsError::ChildNotDead);
        }
        parent.remove_child(pid);
        child.set_parent(None);
        log::trace!("[PS] [{}] released child {}", parent.pid(), pid);
        Ok(pid)
    }
}

fn is_caller(caller: Option<&Arc<Thread>>, thread: &Arc<Thread>) -> bool {
    caller.map_or(false, |c| Arc::ptr_eq(c, thread))
}
