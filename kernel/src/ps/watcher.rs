//! Process Watchers
//!
//! A watcher is signalled once when a watched process reaches Dead. It
//! is built on a notification event so the waiting thread can be
//! interrupted by a termination request.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

use crate::hal::Platform;
use crate::ke::{KEvent, Thread, WaitStatus};

bitflags! {
    /// Events a watcher can subscribe to
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WatchEvents: u32 {
        /// The process reached Dead
        const TERMINATED = 1 << 0;
    }
}

/// Waitable handle on another process's termination
pub struct Watcher {
    event: Arc<KEvent>,
    signals: AtomicU32,
}

impl Watcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            event: Arc::new(KEvent::new()),
            signals: AtomicU32::new(0),
        })
    }

    /// Fire the watcher
    pub fn signal(&self) {
        self.signals.fetch_add(1, Ordering::AcqRel);
        self.event.set();
    }

    pub fn is_signaled(&self) -> bool {
        self.event.is_signaled()
    }

    /// Number of times the watcher fired
    pub fn signal_count(&self) -> u32 {
        self.signals.load(Ordering::Acquire)
    }

    /// Block `thread` (if any) until the watcher fires or is interrupted
    pub fn wait(&self, thread: Option<&Arc<Thread>>, platform: &dyn Platform) -> WaitStatus {
        self.event.wait(thread, platform)
    }
}
