//! Inter-Processor Interrupt (IPI) Requests
//!
//! Requests are merged atomically into the target's request summary and
//! then the interrupt is raised through the platform. The target drains
//! the summary when it next enters the scheduler.

use core::sync::atomic::{fence, Ordering};

use bitflags::bitflags;

use super::prcb::KPrcb;
use crate::hal::Platform;

/// IPI vector for reschedule requests
pub const IPI_VECTOR_RESCHEDULE: u8 = 0xFD;

bitflags! {
    /// Request bits carried in a processor's request summary
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpiRequest: u32 {
        /// Pick a new current thread
        const RESCHEDULE = 1 << 0;
    }
}

/// Ask `prcb` to reschedule
pub fn ki_ipi_send_reschedule(prcb: &KPrcb, platform: &dyn Platform) {
    prcb.request_summary
        .fetch_or(IpiRequest::RESCHEDULE.bits(), Ordering::AcqRel);

    // The request must be visible before the interrupt lands.
    fence(Ordering::SeqCst);

    log::trace!("[KE] reschedule IPI -> CPU {}", prcb.number());
    platform.request_ipi(prcb.number(), IPI_VECTOR_RESCHEDULE);
}

/// Drain the pending requests of `prcb`
pub fn ki_ipi_take_requests(prcb: &KPrcb) -> IpiRequest {
    IpiRequest::from_bits_truncate(prcb.request_summary.swap(0, Ordering::AcqRel))
}
