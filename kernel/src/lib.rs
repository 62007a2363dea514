//! Process Core
//!
//! Process and thread management for a preemptive, multiprocessor
//! x86_64 kernel:
//! - Process and thread lifecycle state machines
//! - Address space construction for create, fork and exec
//! - The cooperative termination protocol (die) and the reaper
//! - Process watchers, handle tables and futex wait queues
//! - ELF image loading with interpreter PLT binding
//!
//! The hardware facing pieces (context switching, IPI delivery, page
//! table encoding, the VFS) are reached through the collaborator traits
//! in [`hal`], [`mm::paging`] and [`ob::namespace`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod hal;
pub mod ke;
pub mod ldr;
pub mod mm;
pub mod ob;
pub mod ps;

#[cfg(test)]
pub(crate) mod testing;

pub use ps::{ProcessManager, PsError};
