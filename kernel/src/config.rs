//! Process Manager Configuration
//!
//! Layout constants shared by the create, fork and exec paths. Runtime
//! inputs (the shared-data image and its symbol table) are supplied when
//! the [`ProcessManager`](crate::ps::ProcessManager) is constructed.

use x86_64::structures::paging::{PageSize, Size4KiB};

// ============================================================================
// Paging
// ============================================================================

/// Size of a small page
pub const PAGE_SIZE: u64 = Size4KiB::SIZE;

/// Size of a small page as a buffer length
pub const PAGE_SIZE_BYTES: usize = PAGE_SIZE as usize;

// ============================================================================
// User Address Space Layout
// ============================================================================

/// Preferred base of the initial user stack region
pub const USER_STACK_BASE: u64 = 0x70_0000_0000;

/// Size of the initial user stack region (4 MiB)
pub const USER_STACK_SIZE: u64 = 0x40_0000;

/// Number of pages at the top of a new stack committed eagerly
pub const USER_STACK_EAGER_PAGES: u64 = 3;

/// Fixed base of the per-process signal trampoline page
pub const SIGNAL_TRAMPOLINE_BASE: u64 = 0x70_00A0_0000;

/// Preferred base of the shared-data window
pub const SHARED_DATA_BASE: u64 = 0x7F_E000_0000;

/// Preferred base of the process environment block
pub const ENVIRONMENT_BLOCK_BASE: u64 = 0x7F_F000_0000;

/// Load base for the dynamic linker
pub const INTERPRETER_BASE: u64 = 0x7F_C000_0000;

/// Base advertised to user space for the main executable
pub const EXECUTABLE_BASE: u64 = 0x8000_0000;

/// Lowest address handed out for non-fixed placements
pub const USER_SPACE_FLOOR: u64 = 0x1000;

/// Highest canonical user address (exclusive)
pub const USER_SPACE_CEILING: u64 = 0x0000_8000_0000_0000;

// ============================================================================
// Threads
// ============================================================================

/// Kernel stack size per thread (16 KiB)
pub const KERNEL_STACK_SIZE: usize = 16384;

/// Default time slice in scheduler ticks
pub const THREAD_TIMESLICE_DEFAULT: u32 = 6;

/// Priority given to user-mode main threads
pub const USER_THREAD_PRIORITY: u8 = 4;

/// Priority given to kernel threads
pub const KERNEL_THREAD_PRIORITY: u8 = 8;

/// Ring 3 code selector
pub const USER_CS: u64 = 0x23;

/// Ring 3 stack selector
pub const USER_SS: u64 = 0x1B;

/// Ring 0 code selector
pub const KERNEL_CS: u64 = 0x08;

/// Ring 0 stack selector
pub const KERNEL_SS: u64 = 0x10;

/// RFLAGS for a fresh user image (IF set, reserved bit 1 set)
pub const USER_RFLAGS: u64 = 0x202;

/// Default MXCSR for a fresh floating point state
pub const DEFAULT_MXCSR: u32 = 0x1F80;

/// MXCSR mask for a fresh floating point state
pub const DEFAULT_MXCSR_MASK: u32 = 0xFFBF;

/// Default x87 control word
pub const DEFAULT_FCW: u16 = 0x033F;

// ============================================================================
// Processes
// ============================================================================

/// Maximum process name length in bytes
pub const NAME_MAX: usize = 255;

/// Maximum path length in bytes
pub const PATH_MAX: usize = 4096;

/// Number of signal slots per process
pub const SIGNAL_MAX: usize = 64;

/// Handle slots reserved (and left empty) in every new handle table
pub const RESERVED_HANDLES: usize = 3;

/// Upper bound on handle numbers in a table
pub const MAX_HANDLES: usize = 1024;

/// Device opened as standard input for new user processes
pub const NULL_DEVICE_PATH: &str = "/dev/null";

/// Device opened as standard output and error for new user processes
pub const LOG_DEVICE_PATH: &str = "/dev/kernellog";

/// Dynamic linker path
pub const INTERPRETER_PATH: &str = "/lib/ld.so";

/// Working directory of processes created by the kernel
pub const ROOT_DIRECTORY: &str = "/";
