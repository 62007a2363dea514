//! Client IDs
//!
//! Every process has a unique Process ID (PID) drawn from a monotonic
//! allocator, and every thread a Thread ID (TID) unique within its
//! process. Together they form a [`ClientId`].

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Process identifier
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl ProcessId {
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, unique within the owning process
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client ID - identifies a process/thread pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientId {
    pub process: ProcessId,
    pub thread: ThreadId,
}

impl ClientId {
    pub const fn new(process: ProcessId, thread: ThreadId) -> Self {
        Self { process, thread }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process, self.thread)
    }
}

/// Monotonic PID source
///
/// PIDs are never reused while the allocator lives.
pub struct PidAllocator {
    next: AtomicU32,
}

impl PidAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
        }
    }

    /// Hand out the next PID
    pub fn allocate(&self) -> ProcessId {
        ProcessId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for PidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
