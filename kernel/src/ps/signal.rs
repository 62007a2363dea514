//! Signal Numbers and Dispositions
//!
//! Signals are posted to threads as bits in a pending mask. Delivery to
//! user handlers (frame construction, trampolines) belongs to the
//! signal-delivery path; this module only tracks what each process wants
//! done with each signal.

use x86_64::VirtAddr;

use crate::config::SIGNAL_MAX;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGILL: u32 = 4;
pub const SIGTRAP: u32 = 5;
pub const SIGABRT: u32 = 6;
pub const SIGBUS: u32 = 7;
pub const SIGFPE: u32 = 8;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGPIPE: u32 = 13;
pub const SIGALRM: u32 = 14;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGWINCH: u32 = 28;

/// Mask bit for `signal`
#[inline]
pub const fn signal_bit(signal: u32) -> u64 {
    1u64 << (signal as u64 & 63)
}

/// Signals that cannot be caught, ignored or blocked
pub const UNBLOCKABLE_SIGNALS: u64 = signal_bit(SIGKILL) | signal_bit(SIGSTOP);

/// What the kernel does with a signal that has no user handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    Stop,
    Continue,
}

/// Default disposition of `signal`
pub fn default_action(signal: u32) -> DefaultAction {
    match signal {
        SIGCHLD | SIGWINCH => DefaultAction::Ignore,
        SIGSTOP | SIGTSTP => DefaultAction::Stop,
        SIGCONT => DefaultAction::Continue,
        _ => DefaultAction::Terminate,
    }
}

/// Disposition chosen by the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalAction {
    #[default]
    Default,
    Ignore,
    Handler(VirtAddr),
}

/// Per-signal handler slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignalHandler {
    pub action: SignalAction,
    pub flags: u64,
    pub mask: u64,
}

impl SignalHandler {
    /// Whether exec must reset this slot to the default disposition
    pub fn resets_on_exec(&self) -> bool {
        matches!(self.action, SignalAction::Handler(_))
    }
}

/// Handler slots indexed by signal number
pub type SignalHandlerTable = [SignalHandler; SIGNAL_MAX];

/// Check that `signal` names a real slot
#[inline]
pub fn is_valid_signal(signal: u32) -> bool {
    signal > 0 && (signal as usize) < SIGNAL_MAX
}
