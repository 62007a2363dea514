//! Process Manager (ps)
//!
//! The process manager handles process and thread lifecycle:
//!
//! - **Process**: resource owner with its state machine, threads, children
//! - **Client IDs**: process and thread identifiers
//! - **Creation**: idle, kernel and ELF image processes, extra threads
//! - **Fork / Exec**: copy-on-write duplication and image replacement
//! - **Termination**: the die protocol, watchers and the reaper
//! - **Signals**: numbers, default actions, per-process handler table
//!
//! # Process Structure
//!
//! A process contains:
//! - Address space (regions, page-table root)
//! - Handle table
//! - Thread list (main thread first)
//! - Children (owned) and a weak parent link
//! - Watchers notified when it reaches Dead
//!
//! # Lock Ordering
//!
//! balance lock -> run queue -> process -> thread state. Watcher lists
//! are only taken with no other process lock held.

use core::fmt;

pub mod cid;
pub mod create;
pub mod exec;
pub mod exit;
pub mod fork;
pub mod manager;
pub mod peb;
pub mod process;
pub mod signal;
pub mod table;
pub mod watcher;

pub use cid::{ClientId, PidAllocator, ProcessId, ThreadId};
pub use manager::ProcessManager;
pub use peb::EnvironmentBlock;
pub use process::{Credentials, Process, ProcessState};
pub use table::ProcessTable;
pub use watcher::{WatchEvents, Watcher};

use crate::ke::futex::FutexError;
use crate::ldr::LoadError;
use crate::mm::MmError;
use crate::ob::ObError;

/// Process manager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PsError {
    Mm(MmError),
    Ob(ObError),
    Load(LoadError),
    /// The calling processor has no current thread
    NoCurrentThread,
    /// The thread does not belong to the process being operated on
    NotCurrentProcess,
    /// The process has started dying
    ProcessNotRunning,
    /// No child with that PID
    NoSuchChild,
    /// The child has not reached Dead
    ChildNotDead,
    /// Watch requested an event other than termination
    UnsupportedEvent,
    /// The futex word did not hold the expected value
    WouldBlock,
    /// The wait was cut short
    Interrupted,
}

impl From<MmError> for PsError {
    fn from(error: MmError) -> Self {
        PsError::Mm(error)
    }
}

impl From<ObError> for PsError {
    fn from(error: ObError) -> Self {
        PsError::Ob(error)
    }
}

impl From<LoadError> for PsError {
    fn from(error: LoadError) -> Self {
        match error {
            LoadError::Mm(error) => PsError::Mm(error),
            other => PsError::Load(other),
        }
    }
}

impl From<FutexError> for PsError {
    fn from(error: FutexError) -> Self {
        match error {
            FutexError::WouldBlock => PsError::WouldBlock,
            FutexError::Fault(error) => PsError::Mm(error),
        }
    }
}

impl fmt::Display for PsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsError::Mm(error) => write!(f, "memory: {}", error),
            PsError::Ob(error) => write!(f, "object: {}", error),
            PsError::Load(error) => write!(f, "image: {}", error),
            PsError::NoCurrentThread => f.write_str("no current thread"),
            PsError::NotCurrentProcess => f.write_str("thread is not part of the process"),
            PsError::ProcessNotRunning => f.write_str("process is not running"),
            PsError::NoSuchChild => f.write_str("no such child"),
            PsError::ChildNotDead => f.write_str("child has not terminated"),
            PsError::UnsupportedEvent => f.write_str("unsupported watch event"),
            PsError::WouldBlock => f.write_str("operation would block"),
            PsError::Interrupted => f.write_str("interrupted"),
        }
    }
}
