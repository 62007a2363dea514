//! Kernel Spinlock Implementation (KSPIN_LOCK)
//!
//! Spinlocks provide mutual exclusion for short critical sections.
//! Interrupts are disabled while a lock is held so an interrupt handler
//! on the same processor can never spin on a lock its own CPU owns.
//!
//! Lock order across the process core:
//! balance lock, run-queue lock, process lock, thread state lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::interrupts;

/// A spinlock for mutual exclusion
///
/// Equivalent to NT's KSPIN_LOCK
pub struct SpinLock<T: ?Sized> {
    /// Lock state (true = locked)
    locked: AtomicBool,
    /// Protected data
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Sync for SpinLock<T> {}
unsafe impl<T: ?Sized + Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Create a new unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the protected data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Acquire the spinlock, returning a guard that releases on drop
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts_enabled = interrupts::save_and_disable();

        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }

        SpinLockGuard {
            lock: self,
            interrupts_enabled,
        }
    }

    /// Try to acquire the lock without spinning
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let interrupts_enabled = interrupts::save_and_disable();

        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard {
                lock: self,
                interrupts_enabled,
            })
        } else {
            interrupts::restore(interrupts_enabled);
            None
        }
    }

    /// Check if the lock is currently held
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Access the data through an exclusive borrow, no locking needed
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard for spinlock
///
/// Releases the lock and restores interrupt state when dropped
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
    interrupts_enabled: bool,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        interrupts::restore(self.interrupts_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_disables_interrupts() {
        let lock = SpinLock::new(5u32);
        {
            let mut guard = lock.lock();
            assert!(!interrupts::are_enabled());
            *guard += 1;
        }
        assert!(interrupts::are_enabled());
        assert_eq!(*lock.lock(), 6);
    }

    #[test]
    fn test_try_lock_fails_while_held() {
        let lock = SpinLock::new(());
        let guard = lock.lock();
        assert!(lock.try_lock().is_none());
        assert!(lock.is_locked());
        drop(guard);
        assert!(lock.try_lock().is_some());
        assert!(interrupts::are_enabled());
    }
}
