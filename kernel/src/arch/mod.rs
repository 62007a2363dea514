//! Architecture Support
//!
//! Only the interrupt flag is touched directly by the process core;
//! everything else goes through the HAL collaborators.

pub mod interrupts;
