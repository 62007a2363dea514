//! Kernel Event Implementation (KEVENT)
//!
//! A notification event: once set it stays signaled and every waiter is
//! released. Waiters register the event as their thread's blocker, so a
//! termination request can interrupt the wait.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use super::thread::{Blocker, Thread};
use crate::hal::Platform;

/// How a wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The event was set
    Signaled,
    /// The waiting thread was asked to stop waiting
    Interrupted,
}

/// Kernel Event
///
/// Equivalent to NT's KEVENT with notification semantics
pub struct KEvent {
    signaled: AtomicBool,
    interrupted: AtomicBool,
}

impl KEvent {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    /// Set the event, returning the previous state
    pub fn set(&self) -> bool {
        self.signaled.swap(true, Ordering::AcqRel)
    }

    /// Clear the event
    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Wait until the event is set or the wait is interrupted.
    ///
    /// When `thread` is given it is moved to Blocked for the duration
    /// with this event as its blocker. A thread that has already been
    /// asked to terminate, or has a deliverable signal pending, does not
    /// block at all.
    pub fn wait(self: &Arc<Self>, thread: Option<&Arc<Thread>>, platform: &dyn Platform) -> WaitStatus {
        if self.is_signaled() {
            return WaitStatus::Signaled;
        }

        if let Some(thread) = thread {
            let blocker: Arc<dyn Blocker> = self.clone();
            if !thread.block(Some(blocker)) {
                return WaitStatus::Interrupted;
            }
            if thread.has_pending_signals() {
                thread.unblock();
                return WaitStatus::Interrupted;
            }
        }

        let status = loop {
            if self.is_signaled() {
                break WaitStatus::Signaled;
            }
            if self.interrupted.swap(false, Ordering::AcqRel) {
                break WaitStatus::Interrupted;
            }
            platform.yield_now();
        };

        if let Some(thread) = thread {
            thread.unblock();
        }
        status
    }
}

impl Default for KEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl Blocker for KEvent {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}
