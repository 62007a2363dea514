//! Shared Data Window
//!
//! A read-only block exposed to every user process: the runtime support
//! library (with the dynamic linker's call vector table) and the symbol
//! table used to bind the linker's PLT. The backing object is created on
//! first use and shared by reference from then on.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Once;

use super::paging::Paging;
use super::vm_object::VmObject;
use super::MmError;

/// Contents of the shared-data window, supplied at boot
#[derive(Debug, Clone, Default)]
pub struct SharedDataImage {
    /// Bytes mapped at the window base
    pub contents: Vec<u8>,
    /// Offset of the linker call vector table within the window
    pub linker_vector_offset: u64,
    /// Size of the linker call vector table
    pub linker_vector_size: u64,
    /// Exported symbols, as offsets from the vector table base
    pub symbols: BTreeMap<String, u64>,
    /// Code copied into each process's signal trampoline page
    pub signal_trampoline: Vec<u8>,
}

impl SharedDataImage {
    /// Offset of `name` from the vector table base
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }
}

/// The lazily created shared-data object
pub struct SharedData {
    image: SharedDataImage,
    object: Once<Arc<VmObject>>,
}

impl SharedData {
    pub fn new(image: SharedDataImage) -> Self {
        Self {
            image,
            object: Once::new(),
        }
    }

    pub fn image(&self) -> &SharedDataImage {
        &self.image
    }

    /// The backing object, created on first call
    pub fn object(&self, paging: &Arc<dyn Paging>) -> Result<Arc<VmObject>, MmError> {
        self.object
            .try_call_once(|| {
                VmObject::shared_data(paging, &self.image.contents).map(|object| {
                    log::debug!(
                        "[MM] shared data window created ({} bytes, {} pages)",
                        self.image.contents.len(),
                        object.page_count()
                    );
                    object
                })
            })
            .cloned()
    }

    pub fn is_created(&self) -> bool {
        self.object.is_completed()
    }
}
