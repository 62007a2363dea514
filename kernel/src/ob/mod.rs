//! Object Manager (ob)
//!
//! The slice of the object manager the process core relies on:
//!
//! - **Kernel objects**: reference-counted resources reachable by handle
//! - **Namespace**: path resolution into filesystem nodes (a collaborator)
//! - **Handle tables**: per-process handle-to-object mapping

use core::fmt;

pub mod handle;
pub mod namespace;

pub use handle::{Handle, HandleEntry, HandleTable};
pub use namespace::{FsNode, Namespace};

/// A resource a process can hold a handle to
pub trait KernelObject: Send + Sync {
    /// Short type name for diagnostics
    fn type_name(&self) -> &'static str;
}

/// Object manager failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObError {
    /// The handle does not name an open object
    BadHandle,
    /// Path resolution failed
    NotFound,
    /// The node exists but is not a directory
    NotDirectory,
    /// Malformed arguments
    InvalidArgument,
    /// The node could not be read
    Io,
}

impl fmt::Display for ObError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ObError::BadHandle => "bad handle",
            ObError::NotFound => "no such file or directory",
            ObError::NotDirectory => "not a directory",
            ObError::InvalidArgument => "invalid argument",
            ObError::Io => "I/O error",
        };
        f.write_str(text)
    }
}
