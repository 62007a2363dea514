//! Dynamic Linker PLT Binding
//!
//! The dynamic linker imports its runtime services from the shared-data
//! window. Its jump-slot relocations are resolved here, by name, against
//! the kernel's symbol table before the process first runs. Every such
//! import must be weakly bound.

use x86_64::VirtAddr;

use super::LoadError;
use crate::mm::{AddressSpace, SharedDataImage};

pub const DT_NULL: u64 = 0;
pub const DT_PLTRELSZ: u64 = 2;
pub const DT_STRTAB: u64 = 5;
pub const DT_SYMTAB: u64 = 6;
pub const DT_JMPREL: u64 = 23;

/// Jump-slot relocation type
pub const R_X86_64_JUMP_SLOT: u32 = 7;

/// Weak symbol binding
pub const STB_WEAK: u8 = 2;

const DYN_ENTRY_SIZE: u64 = 16;
const RELA_ENTRY_SIZE: u64 = 24;
const SYM_ENTRY_SIZE: u64 = 24;
const SYMBOL_NAME_MAX: usize = 256;

/// Tables named by the dynamic section, relative to the load base
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicInfo {
    pub plt_rel_size: u64,
    pub string_table: u64,
    pub symbol_table: u64,
    pub jump_relocations: u64,
}

impl DynamicInfo {
    /// Read the dynamic section of an image loaded at `base`
    pub fn read(space: &AddressSpace, base: VirtAddr, dynamic: u64, size: u64) -> Result<Self, LoadError> {
        let mut info = DynamicInfo::default();
        let count = size / DYN_ENTRY_SIZE;

        for index in 0..count {
            let entry = base + dynamic + index * DYN_ENTRY_SIZE;
            let tag = space.read_u64(entry)?;
            let value = space.read_u64(entry + 8u64)?;
            match tag {
                DT_NULL => break,
                DT_PLTRELSZ => info.plt_rel_size = value,
                DT_STRTAB => info.string_table = value,
                DT_SYMTAB => info.symbol_table = value,
                DT_JMPREL => info.jump_relocations = value,
                _ => {}
            }
        }

        if info.plt_rel_size != 0
            && (info.string_table == 0 || info.symbol_table == 0 || info.jump_relocations == 0)
        {
            return Err(LoadError::MissingDynamicTable);
        }
        Ok(info)
    }
}

/// Result of binding the PLT
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PltBinding {
    pub bound: usize,
    pub unresolved: usize,
}

/// Resolve every jump slot of the image at `base`.
///
/// A slot becomes `vector_base + symbol offset + addend`. A symbol the
/// kernel does not export is logged and left unbound.
pub fn bind_plt(
    space: &AddressSpace,
    base: VirtAddr,
    info: &DynamicInfo,
    symbols: &SharedDataImage,
    vector_base: VirtAddr,
) -> Result<PltBinding, LoadError> {
    let mut binding = PltBinding::default();

    for index in 0..info.plt_rel_size / RELA_ENTRY_SIZE {
        let rela = base + info.jump_relocations + index * RELA_ENTRY_SIZE;
        let offset = space.read_u64(rela)?;
        let r_info = space.read_u64(rela + 8u64)?;
        let addend = space.read_u64(rela + 16u64)? as i64;

        if (r_info & 0xFFFF_FFFF) as u32 != R_X86_64_JUMP_SLOT {
            continue;
        }

        let symbol = base + info.symbol_table + (r_info >> 32) * SYM_ENTRY_SIZE;
        let name_offset = space.read_u32(symbol)?;
        if name_offset == 0 {
            continue;
        }

        let mut st_info = [0u8; 1];
        space.read(symbol + 4u64, &mut st_info)?;
        if st_info[0] >> 4 != STB_WEAK {
            log::error!("[LDR] PLT symbol at index {} is not weakly bound", r_info >> 32);
            return Err(LoadError::InvalidSymbolBinding);
        }

        let name = space.read_c_string(base + info.string_table + name_offset as u64, SYMBOL_NAME_MAX)?;
        match symbols.resolve(&name) {
            Some(value) => {
                let target = vector_base.as_u64().wrapping_add(value).wrapping_add(addend as u64);
                space.write_u64(base + offset, target)?;
                binding.bound += 1;
            }
            None => {
                log::error!("[LDR] could not resolve '{}'", name);
                binding.unresolved += 1;
            }
        }
    }

    log::debug!(
        "[LDR] PLT bound {} slots, {} unresolved",
        binding.bound,
        binding.unresolved
    );
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldr::ElfImage;
    use crate::testing::{interpreter_image, shared_data_image, SimPaging, STB_GLOBAL};
    use alloc::sync::Arc;

    fn load(imports: &[(&str, u8)]) -> (AddressSpace, ElfImage, VirtAddr, alloc::vec::Vec<u64>) {
        let space = AddressSpace::new(Arc::new(SimPaging::new())).unwrap();
        let (bytes, slots) = interpreter_image(imports);
        let image = ElfImage::parse(&bytes).unwrap();
        let base = VirtAddr::new(0x7F_C000_0000);
        image.map_segments(&space, base).unwrap();
        (space, image, base, slots)
    }

    #[test]
    fn test_weak_imports_are_bound() {
        let (space, image, base, slots) = load(&[("le_log", STB_WEAK), ("le_exit", STB_WEAK)]);
        let (dynamic, size) = image.dynamic().unwrap();
        let info = DynamicInfo::read(&space, base, dynamic, size).unwrap();
        let symbols = shared_data_image();
        let vectors = VirtAddr::new(0x7F_E000_1000);

        let result = bind_plt(&space, base, &info, &symbols, vectors).unwrap();
        assert_eq!(result, PltBinding { bound: 2, unresolved: 0 });

        let log_slot = space.read_u64(base + slots[0]).unwrap();
        assert_eq!(log_slot, vectors.as_u64() + symbols.resolve("le_log").unwrap());
        let exit_slot = space.read_u64(base + slots[1]).unwrap();
        assert_eq!(exit_slot, vectors.as_u64() + symbols.resolve("le_exit").unwrap());
    }

    #[test]
    fn test_unknown_import_is_left_alone() {
        let (space, image, base, slots) = load(&[("le_missing", STB_WEAK)]);
        let (dynamic, size) = image.dynamic().unwrap();
        let info = DynamicInfo::read(&space, base, dynamic, size).unwrap();

        let result = bind_plt(&space, base, &info, &shared_data_image(), VirtAddr::new(0x1000)).unwrap();
        assert_eq!(result.unresolved, 1);
        assert_eq!(space.read_u64(base + slots[0]).unwrap(), 0);
    }

    #[test]
    fn test_strong_import_is_rejected() {
        let (space, image, base, _) = load(&[("le_log", STB_GLOBAL)]);
        let (dynamic, size) = image.dynamic().unwrap();
        let info = DynamicInfo::read(&space, base, dynamic, size).unwrap();

        let result = bind_plt(&space, base, &info, &shared_data_image(), VirtAddr::new(0x1000));
        assert_eq!(result.err(), Some(LoadError::InvalidSymbolBinding));
    }
}
