//! Kernel Bug Check Implementation
//!
//! Invariant violations in the process core are not recoverable. They
//! are reported through [`ke_bug_check_ex`], which logs the stop code
//! and its parameters and then panics so the kernel's panic handler can
//! halt every processor.

// ============================================================================
// Bug Check Codes (STOP Codes)
// ============================================================================

pub mod codes {
    //! Stop codes raised by the process core

    /// A retired thread was resumed by the dispatcher
    pub const DEAD_PROCESS_CONTINUED_EXECUTION: u32 = 0x0000_01A0;

    /// A thread of a dying process was still runnable during eviction
    pub const THREAD_NOT_TERMINATED: u32 = 0x0000_01A1;

    /// A process was destroyed while still linked to its parent
    pub const PROCESS_DESTROYED_WHILE_PARENTED: u32 = 0x0000_01A2;

    /// A process was destroyed before reaching the Dead state
    pub const PROCESS_DESTROYED_WHILE_ALIVE: u32 = 0x0000_01A3;

    /// A process state change that the state machine forbids
    pub const INVALID_PROCESS_STATE_TRANSITION: u32 = 0x0000_01A4;

    /// A thread state change that the state machine forbids
    pub const INVALID_THREAD_STATE_TRANSITION: u32 = 0x0000_01A5;

    /// A freshly built user stack was not 16-byte aligned
    pub const USER_STACK_MISALIGNED: u32 = 0x0000_01A6;
}

/// Get the name of a bug check code
pub fn bugcheck_code_name(code: u32) -> &'static str {
    match code {
        codes::DEAD_PROCESS_CONTINUED_EXECUTION => "DEAD_PROCESS_CONTINUED_EXECUTION",
        codes::THREAD_NOT_TERMINATED => "THREAD_NOT_TERMINATED",
        codes::PROCESS_DESTROYED_WHILE_PARENTED => "PROCESS_DESTROYED_WHILE_PARENTED",
        codes::PROCESS_DESTROYED_WHILE_ALIVE => "PROCESS_DESTROYED_WHILE_ALIVE",
        codes::INVALID_PROCESS_STATE_TRANSITION => "INVALID_PROCESS_STATE_TRANSITION",
        codes::INVALID_THREAD_STATE_TRANSITION => "INVALID_THREAD_STATE_TRANSITION",
        codes::USER_STACK_MISALIGNED => "USER_STACK_MISALIGNED",
        _ => "UNKNOWN_BUGCHECK",
    }
}

/// Bring down the system with a stop code and four parameters
#[cold]
pub fn ke_bug_check_ex(code: u32, p1: u64, p2: u64, p3: u64, p4: u64) -> ! {
    log::error!(
        "*** STOP: 0x{:08X} (0x{:016X}, 0x{:016X}, 0x{:016X}, 0x{:016X})",
        code,
        p1,
        p2,
        p3,
        p4
    );
    log::error!("{}", bugcheck_code_name(code));

    panic!("KeBugCheck: {} (0x{:08X})", bugcheck_code_name(code), code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_names() {
        assert_eq!(
            bugcheck_code_name(codes::THREAD_NOT_TERMINATED),
            "THREAD_NOT_TERMINATED"
        );
        assert_eq!(bugcheck_code_name(0xDEAD), "UNKNOWN_BUGCHECK");
    }

    #[test]
    #[should_panic(expected = "USER_STACK_MISALIGNED")]
    fn test_bug_check_panics_with_name() {
        ke_bug_check_ex(codes::USER_STACK_MISALIGNED, 0x7000_0000_0008, 0, 0, 0);
    }
}
