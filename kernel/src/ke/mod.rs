//! Kernel Executive (ke)
//!
//! Low-level scheduling and synchronization used by the process core:
//!
//! - **Spinlocks**: interrupt-disabling mutual exclusion
//! - **Threads**: KTHREAD state machine, kernel lock, saved context
//! - **Events**: notification events that threads can block on
//! - **Scheduler**: per-processor run queues, balancing, eviction
//! - **IPI**: reschedule requests between processors
//! - **Futex**: user-address keyed wait queues
//! - **Bug check**: unrecoverable invariant violations

pub mod bugcheck;
pub mod event;
pub mod futex;
pub mod ipi;
pub mod prcb;
pub mod scheduler;
pub mod spinlock;
pub mod thread;

pub use bugcheck::{codes as bugcheck_codes, ke_bug_check_ex};
pub use event::{KEvent, WaitStatus};
pub use prcb::{CpuId, KPrcb, RunQueue};
pub use scheduler::Scheduler;
pub use spinlock::{SpinLock, SpinLockGuard};
pub use thread::{Blocker, KernelLock, Thread, ThreadContext, ThreadState};
