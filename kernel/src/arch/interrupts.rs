//! Interrupt Flag Control
//!
//! On bare metal this is RFLAGS.IF. Hosted builds keep an emulated flag
//! (per host thread under test) so lock and page-table switching
//! discipline can still be observed.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use x86_64::instructions::interrupts;

    #[inline]
    pub fn are_enabled() -> bool {
        interrupts::are_enabled()
    }

    #[inline]
    pub fn disable() {
        interrupts::disable();
    }

    #[inline]
    pub fn enable() {
        interrupts::enable();
    }
}

#[cfg(all(not(all(target_arch = "x86_64", target_os = "none")), test))]
mod imp {
    use std::cell::Cell;

    std::thread_local! {
        static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    }

    pub fn are_enabled() -> bool {
        INTERRUPTS_ENABLED.with(|flag| flag.get())
    }

    pub fn disable() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(false));
    }

    pub fn enable() {
        INTERRUPTS_ENABLED.with(|flag| flag.set(true));
    }
}

#[cfg(all(not(all(target_arch = "x86_64", target_os = "none")), not(test)))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

    pub fn are_enabled() -> bool {
        INTERRUPTS_ENABLED.load(Ordering::Relaxed)
    }

    pub fn disable() {
        INTERRUPTS_ENABLED.store(false, Ordering::Relaxed);
    }

    pub fn enable() {
        INTERRUPTS_ENABLED.store(true, Ordering::Relaxed);
    }
}

pub use imp::{are_enabled, disable, enable};

/// Disable interrupts and return whether they were enabled
#[inline]
pub fn save_and_disable() -> bool {
    let enabled = are_enabled();
    if enabled {
        disable();
    }
    enabled
}

/// Re-enable interrupts if `was_enabled`
#[inline]
pub fn restore(was_enabled: bool) {
    if was_enabled {
        enable();
    }
}

/// Run `f` with interrupts disabled, restoring the previous state after
#[inline]
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let enabled = save_and_disable();
    let result = f();
    restore(enabled);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_without_interrupts_restores_state() {
        assert!(are_enabled());
        let inside = without_interrupts(are_enabled);
        assert!(!inside);
        assert!(are_enabled());
    }

    #[test]
    fn test_nested_save_keeps_outer_state() {
        let outer = save_and_disable();
        let inner = save_and_disable();
        assert!(outer);
        assert!(!inner);
        restore(inner);
        assert!(!are_enabled());
        restore(outer);
        assert!(are_enabled());
    }
}
