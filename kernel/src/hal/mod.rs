//! Hardware Abstraction Layer
//!
//! The process core never touches the local APIC, the context switch
//! path or the timer directly. The platform collaborator supplies them.

use crate::ke::prcb::CpuId;

/// Processor services the process core depends on
pub trait Platform: Send + Sync {
    /// Number of processors the scheduler manages
    fn processor_count(&self) -> usize;

    /// Processor the caller is executing on
    fn current_processor(&self) -> CpuId;

    /// Give up the remainder of the caller's time slice
    fn yield_now(&self);

    /// Deliver interrupt `vector` to processor `target`
    fn request_ipi(&self, target: CpuId, vector: u8);

    /// Switch `cpu` to whatever its run queue names as current.
    ///
    /// When the caller has retired itself this never returns.
    fn dispatch(&self, cpu: CpuId);

    /// Monotonic time since boot in microseconds
    fn uptime_us(&self) -> u64;
}
