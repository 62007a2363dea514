//! Kernel Thread (KTHREAD)
//!
//! A thread is a schedulable execution context belonging to exactly one
//! process. Its lifecycle is:
//!
//! ```text
//! Running <-> Blocked
//!    |           |
//!    +--> Zombie <+
//!           |
//!         Dying
//! ```
//!
//! A Zombie has been asked to terminate but may still be finishing
//! kernel work on another processor. It becomes Dying once the thread
//! driving termination wins its kernel lock, and a Dying thread is never
//! dispatched again.

use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use x86_64::VirtAddr;

use super::bugcheck::{codes, ke_bug_check_ex};
use super::spinlock::{SpinLock, SpinLockGuard};
use crate::config::{
    DEFAULT_FCW, DEFAULT_MXCSR, DEFAULT_MXCSR_MASK, KERNEL_STACK_SIZE, THREAD_TIMESLICE_DEFAULT,
};
use crate::ps::signal::{signal_bit, UNBLOCKABLE_SIGNALS};
use crate::ps::{Process, ProcessId, ThreadId};

/// Thread states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Runnable or executing
    Running = 0,
    /// Waiting on a blocker
    Blocked = 1,
    /// Asked to terminate, may still hold its kernel lock
    Zombie = 2,
    /// Retired; never dispatched again
    Dying = 3,
}

impl ThreadState {
    /// Check whether the state machine permits `self -> next`
    pub fn can_transition_to(self, next: ThreadState) -> bool {
        use ThreadState::*;
        matches!(
            (self, next),
            (Running, Running)
                | (Running, Blocked)
                | (Blocked, Running)
                | (Blocked, Blocked)
                | (Running, Zombie)
                | (Blocked, Zombie)
                | (Zombie, Zombie)
                | (Zombie, Dying)
                | (Dying, Dying)
        )
    }
}

/// Something a thread can be waiting on
///
/// `interrupt` makes the current wait return early. It is called without
/// the thread's state lock held.
pub trait Blocker: Send + Sync {
    fn interrupt(&self);
}

/// Outcome of [`Thread::mark_zombie`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieOutcome {
    /// The thread was already retired
    AlreadyDying,
    /// The thread was blocked and its blocker was interrupted
    Interrupted,
    /// The thread was marked without needing an interrupt
    Marked,
}

// ============================================================================
// Kernel Lock
// ============================================================================

/// Per-thread pin held while the thread executes kernel code.
///
/// Whoever holds it owns the right to run the thread's kernel path, so a
/// terminating thread is only retired once its kernel lock is won.
pub struct KernelLock {
    held: AtomicBool,
}

impl KernelLock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Spin until the pin is taken
    pub fn acquire(&self) {
        while !self.try_acquire() {
            core::hint::spin_loop();
        }
    }

    /// Take the pin if it is free
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Saved Context
// ============================================================================

/// General purpose register frame
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// FXSAVE area
#[repr(C, align(16))]
#[derive(Clone)]
pub struct FxState {
    bytes: [u8; 512],
}

impl FxState {
    const FCW_OFFSET: usize = 0;
    const MXCSR_OFFSET: usize = 24;
    const MXCSR_MASK_OFFSET: usize = 28;

    /// Zeroed area with the architectural defaults loaded
    pub fn new() -> Self {
        let mut state = Self { bytes: [0; 512] };
        state.reset();
        state
    }

    /// Zero the area and reload the default control words
    pub fn reset(&mut self) {
        self.bytes = [0; 512];
        self.bytes[Self::FCW_OFFSET..Self::FCW_OFFSET + 2].copy_from_slice(&DEFAULT_FCW.to_le_bytes());
        self.bytes[Self::MXCSR_OFFSET..Self::MXCSR_OFFSET + 4]
            .copy_from_slice(&DEFAULT_MXCSR.to_le_bytes());
        self.bytes[Self::MXCSR_MASK_OFFSET..Self::MXCSR_MASK_OFFSET + 4]
            .copy_from_slice(&DEFAULT_MXCSR_MASK.to_le_bytes());
    }

    pub fn fcw(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn mxcsr(&self) -> u32 {
        let o = Self::MXCSR_OFFSET;
        u32::from_le_bytes([self.bytes[o], self.bytes[o + 1], self.bytes[o + 2], self.bytes[o + 3]])
    }

    pub fn mxcsr_mask(&self) -> u32 {
        let o = Self::MXCSR_MASK_OFFSET;
        u32::from_le_bytes([self.bytes[o], self.bytes[o + 1], self.bytes[o + 2], self.bytes[o + 3]])
    }

    pub fn as_bytes(&self) -> &[u8; 512] {
        &self.bytes
    }
}

impl Default for FxState {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything restored when the thread is dispatched
#[derive(Clone)]
pub struct ThreadContext {
    pub registers: RegisterContext,
    pub fx_state: Box<FxState>,
    pub fs_base: u64,
    pub gs_base: u64,
    /// Base of the user stack region
    pub user_stack_base: VirtAddr,
    /// Top of the user stack region
    pub user_stack_limit: VirtAddr,
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self {
            registers: RegisterContext::default(),
            fx_state: Box::new(FxState::new()),
            fs_base: 0,
            gs_base: 0,
            user_stack_base: VirtAddr::zero(),
            user_stack_limit: VirtAddr::zero(),
        }
    }
}

/// Per-thread kernel stack
pub struct KernelStack {
    memory: Box<[u8]>,
}

impl KernelStack {
    fn new() -> Self {
        Self {
            memory: vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice(),
        }
    }

    /// First byte past the stack
    pub fn top(&self) -> VirtAddr {
        let range = self.memory.as_ptr_range();
        VirtAddr::new_truncate(range.end as usize as u64).align_down(16u64)
    }

    pub fn size(&self) -> usize {
        self.memory.len()
    }
}

// ============================================================================
// Thread
// ============================================================================

struct ThreadStateCell {
    state: ThreadState,
    blocker: Option<Arc<dyn Blocker>>,
}

/// Kernel thread object
pub struct Thread {
    tid: ThreadId,
    pid: ProcessId,
    process: Weak<Process>,
    state: SpinLock<ThreadStateCell>,
    kernel_lock: KernelLock,
    context: SpinLock<ThreadContext>,
    kernel_stack: KernelStack,
    priority: AtomicU8,
    time_slice: AtomicU32,
    time_slice_default: AtomicU32,
    pending_signals: AtomicU64,
    blocked_signals: AtomicU64,
}

impl Thread {
    /// Create a Running thread owned by `process`
    pub fn new(tid: ThreadId, pid: ProcessId, process: Weak<Process>) -> Self {
        Self {
            tid,
            pid,
            process,
            state: SpinLock::new(ThreadStateCell {
                state: ThreadState::Running,
                blocker: None,
            }),
            kernel_lock: KernelLock::new(),
            context: SpinLock::new(ThreadContext::default()),
            kernel_stack: KernelStack::new(),
            priority: AtomicU8::new(0),
            time_slice: AtomicU32::new(THREAD_TIMESLICE_DEFAULT),
            time_slice_default: AtomicU32::new(THREAD_TIMESLICE_DEFAULT),
            pending_signals: AtomicU64::new(0),
            blocked_signals: AtomicU64::new(0),
        }
    }

    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// PID of the owning process
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Owning process, if it is still alive
    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn kernel_lock(&self) -> &KernelLock {
        &self.kernel_lock
    }

    pub fn kernel_stack(&self) -> &KernelStack {
        &self.kernel_stack
    }

    pub fn context(&self) -> SpinLockGuard<'_, ThreadContext> {
        self.context.lock()
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub fn state(&self) -> ThreadState {
        self.state.lock().state
    }

    /// Move to `next`, bug checking on a forbidden transition
    pub fn set_state(&self, next: ThreadState) {
        let mut cell = self.state.lock();
        Self::transition(&mut cell, self.pid, self.tid, next);
    }

    fn transition(cell: &mut ThreadStateCell, pid: ProcessId, tid: ThreadId, next: ThreadState) {
        if !cell.state.can_transition_to(next) {
            ke_bug_check_ex(
                codes::INVALID_THREAD_STATE_TRANSITION,
                pid.as_u32() as u64,
                tid.0 as u64,
                cell.state as u64,
                next as u64,
            );
        }
        cell.state = next;
    }

    /// Enter Blocked with `blocker` registered.
    ///
    /// Returns false without blocking when the thread has already been
    /// asked to terminate.
    pub fn block(&self, blocker: Option<Arc<dyn Blocker>>) -> bool {
        let mut cell = self.state.lock();
        match cell.state {
            ThreadState::Running | ThreadState::Blocked => {
                cell.state = ThreadState::Blocked;
                cell.blocker = blocker;
                true
            }
            ThreadState::Zombie | ThreadState::Dying => false,
        }
    }

    /// Leave Blocked. A Zombie stays a Zombie.
    pub fn unblock(&self) {
        let mut cell = self.state.lock();
        cell.blocker = None;
        if cell.state == ThreadState::Blocked {
            cell.state = ThreadState::Running;
        }
    }

    /// Whether a blocker is currently registered
    pub fn has_blocker(&self) -> bool {
        self.state.lock().blocker.is_some()
    }

    /// Ask the thread to terminate.
    ///
    /// A blocked thread has its blocker interrupted (outside the state
    /// lock) so its wait returns. The thread ends up Zombie unless it was
    /// already retired.
    pub fn mark_zombie(&self) -> ZombieOutcome {
        let blocker = {
            let mut cell = self.state.lock();
            let state = cell.state;
            match state {
                ThreadState::Dying => return ZombieOutcome::AlreadyDying,
                ThreadState::Blocked if cell.blocker.is_some() => {
                    Self::transition(&mut cell, self.pid, self.tid, ThreadState::Zombie);
                    cell.blocker.clone()
                }
                _ => {
                    Self::transition(&mut cell, self.pid, self.tid, ThreadState::Zombie);
                    None
                }
            }
        };

        let outcome = match blocker {
            Some(blocker) => {
                blocker.interrupt();
                ZombieOutcome::Interrupted
            }
            None => ZombieOutcome::Marked,
        };

        // The interrupted wait may have raced an unblock; Zombie is sticky.
        // A concurrent sweep may have retired the thread in between.
        {
            let mut cell = self.state.lock();
            if cell.state != ThreadState::Dying {
                Self::transition(&mut cell, self.pid, self.tid, ThreadState::Zombie);
            }
        }
        outcome
    }

    /// Retire a Zombie whose kernel lock can be won.
    ///
    /// On success the lock is kept forever, the thread is Dying and its
    /// time slices are zero.
    pub fn try_retire(&self) -> bool {
        if !self.kernel_lock.try_acquire() {
            return false;
        }
        self.retire();
        true
    }

    /// Retire a thread whose kernel lock the caller already holds
    pub fn retire(&self) {
        {
            let mut cell = self.state.lock();
            Self::transition(&mut cell, self.pid, self.tid, ThreadState::Dying);
            cell.blocker = None;
        }
        self.time_slice.store(0, Ordering::Relaxed);
        self.time_slice_default.store(0, Ordering::Relaxed);
    }

    /// Whether the scheduler may pick this thread
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.state(), ThreadState::Running | ThreadState::Zombie)
            && self.time_slice_default.load(Ordering::Relaxed) != 0
    }

    // ------------------------------------------------------------------
    // Scheduling parameters
    // ------------------------------------------------------------------

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn time_slice(&self) -> u32 {
        self.time_slice.load(Ordering::Relaxed)
    }

    pub fn time_slice_default(&self) -> u32 {
        self.time_slice_default.load(Ordering::Relaxed)
    }

    /// Set both the current and the default time slice
    pub fn set_time_slice(&self, ticks: u32) {
        self.time_slice.store(ticks, Ordering::Relaxed);
        self.time_slice_default.store(ticks, Ordering::Relaxed);
    }

    /// Refill the current slice from the default
    pub fn refill_time_slice(&self) {
        self.time_slice
            .store(self.time_slice_default.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    /// Post `signal`, interrupting the current wait if it is deliverable
    pub fn signal(&self, signal: u32) {
        let bit = signal_bit(signal);
        self.pending_signals.fetch_or(bit, Ordering::AcqRel);

        if bit & self.deliverable_mask() == 0 {
            return;
        }

        let blocker = {
            let cell = self.state.lock();
            match cell.state {
                ThreadState::Blocked => cell.blocker.clone(),
                _ => None,
            }
        };
        if let Some(blocker) = blocker {
            blocker.interrupt();
        }
    }

    fn deliverable_mask(&self) -> u64 {
        !self.blocked_signals.load(Ordering::Acquire) | UNBLOCKABLE_SIGNALS
    }

    pub fn pending_signals(&self) -> u64 {
        self.pending_signals.load(Ordering::Acquire)
    }

    /// Whether any unmasked signal is pending
    pub fn has_pending_signals(&self) -> bool {
        self.pending_signals() & self.deliverable_mask() != 0
    }

    /// Dequeue the lowest numbered deliverable signal
    pub fn take_pending_signal(&self) -> Option<u32> {
        loop {
            let pending = self.pending_signals();
            let deliverable = pending & self.deliverable_mask();
            if deliverable == 0 {
                return None;
            }
            let signal = deliverable.trailing_zeros();
            let bit = signal_bit(signal);
            if self
                .pending_signals
                .compare_exchange(pending, pending & !bit, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(signal);
            }
        }
    }

    pub fn blocked_signals(&self) -> u64 {
        self.blocked_signals.load(Ordering::Acquire)
    }

    /// Replace the signal mask; SIGKILL and SIGSTOP stay deliverable
    pub fn set_blocked_signals(&self, mask: u64) {
        self.blocked_signals
            .store(mask & !UNBLOCKABLE_SIGNALS, Ordering::Release);
    }
}
