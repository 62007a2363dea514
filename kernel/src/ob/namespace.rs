//! Filesystem Namespace Collaborator
//!
//! Path resolution, device opening and file reads belong to the VFS. The
//! process core only needs to resolve the working directory, open the
//! standard devices and read the dynamic linker.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{KernelObject, ObError};

/// A resolved filesystem node
pub trait FsNode: Send + Sync {
    fn is_directory(&self) -> bool;

    /// Size in bytes of the node's contents
    fn size(&self) -> u64;

    /// Read from `offset`, returning the number of bytes copied
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, ObError>;

    /// Open the node as a handle-able object
    fn open(&self) -> Result<Arc<dyn KernelObject>, ObError>;
}

/// Path resolution
pub trait Namespace: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<dyn FsNode>>;
}

/// Read a node's entire contents
pub fn read_all(node: &dyn FsNode) -> Result<Vec<u8>, ObError> {
    let size = usize::try_from(node.size()).map_err(|_| ObError::Io)?;
    let mut buf = vec![0u8; size];
    let mut done = 0;
    while done < size {
        let n = node.read(done as u64, &mut buf[done..])?;
        if n == 0 {
            return Err(ObError::Io);
        }
        done += n;
    }
    Ok(buf)
}

/// Resolve `path` to a directory node
pub fn resolve_directory(namespace: &dyn Namespace, path: &str) -> Result<Arc<dyn FsNode>, ObError> {
    let node = namespace.resolve(path).ok_or(ObError::NotFound)?;
    if !node.is_directory() {
        return Err(ObError::NotDirectory);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SimNamespace;

    #[test]
    fn test_read_all_and_directories() {
        let ns = SimNamespace::new().with_file("/lib/ld.so", alloc::vec![7u8; 9000]);
        let node = ns.resolve("/lib/ld.so").unwrap();
        assert_eq!(read_all(node.as_ref()).unwrap(), alloc::vec![7u8; 9000]);

        assert!(resolve_directory(&ns, "/").is_ok());
        assert_eq!(resolve_directory(&ns, "/lib/ld.so").err(), Some(ObError::NotDirectory));
        assert_eq!(resolve_directory(&ns, "/nope").err(), Some(ObError::NotFound));
    }
}
