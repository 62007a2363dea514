//! ELF64 Image Parsing and Mapping
//!
//! Parsing copies what loading needs out of the file, so a parsed image
//! outlives the buffer it came from and can be validated before any
//! address space is touched.

use alloc::string::String;
use alloc::vec::Vec;

use x86_64::VirtAddr;
use xmas_elf::header::{Class, Machine, Type as ElfType};
use xmas_elf::program::{ProgramHeader, Type as SegmentType};
use xmas_elf::ElfFile;

use super::LoadError;
use crate::config::PAGE_SIZE;
use crate::mm::{AddressSpace, RegionFlags};

/// ELF magic bytes
pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

/// Executable or position-independent object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Executable,
    SharedObject,
}

/// One PT_LOAD segment
#[derive(Debug, Clone)]
pub struct LoadSegment {
    pub vaddr: u64,
    pub mem_size: u64,
    pub data: Vec<u8>,
    pub flags: RegionFlags,
}

/// A parsed ELF image
#[derive(Debug, Clone)]
pub struct ElfImage {
    kind: ImageKind,
    entry: u64,
    segments: Vec<LoadSegment>,
    interpreter: Option<String>,
    dynamic: Option<(u64, u64)>,
    phdr: u64,
    phent: u16,
    phnum: u16,
}

impl ElfImage {
    /// Validate and parse `bytes`
    pub fn parse(bytes: &[u8]) -> Result<Self, LoadError> {
        if bytes.len() < ELF_MAGIC.len() || bytes[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }

        let elf = ElfFile::new(bytes).map_err(LoadError::Malformed)?;
        if elf.header.pt1.magic != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if elf.header.pt1.class() != Class::SixtyFour {
            return Err(LoadError::UnsupportedClass);
        }
        if !matches!(elf.header.pt2.machine().as_machine(), Machine::X86_64) {
            return Err(LoadError::UnsupportedMachine);
        }
        let kind = match elf.header.pt2.type_().as_type() {
            ElfType::Executable => ImageKind::Executable,
            ElfType::SharedObject => ImageKind::SharedObject,
            _ => return Err(LoadError::UnsupportedType),
        };

        let ph_offset = elf.header.pt2.ph_offset();
        let phent = elf.header.pt2.ph_entry_size();
        let phnum = elf.header.pt2.ph_count();

        let mut segments = Vec::new();
        let mut interpreter = None;
        let mut dynamic = None;
        let mut phdr = None;
        let mut covering_load = None;

        for index in 0..phnum {
            let ph = elf.program_header(index).map_err(LoadError::Malformed)?;
            match ph.get_type().map_err(LoadError::Malformed)? {
                SegmentType::Load => {
                    if ph.mem_size() < ph.file_size() {
                        return Err(LoadError::Malformed("segment file size exceeds memory size"));
                    }
                    if ph_offset >= ph.offset() && ph_offset < ph.offset() + ph.file_size() {
                        covering_load = Some(ph.virtual_addr() + (ph_offset - ph.offset()));
                    }
                    segments.push(LoadSegment {
                        vaddr: ph.virtual_addr(),
                        mem_size: ph.mem_size(),
                        data: file_bytes(bytes, &ph)?.to_vec(),
                        flags: segment_flags(&ph),
                    });
                }
                SegmentType::Interp => {
                    let raw = file_bytes(bytes, &ph)?;
                    let path = raw.split(|&b| b == 0).next().unwrap_or(&[]);
                    let path = core::str::from_utf8(path)
                        .map_err(|_| LoadError::Malformed("interpreter path is not UTF-8"))?;
                    interpreter = Some(String::from(path));
                }
                SegmentType::Dynamic => {
                    dynamic = Some((ph.virtual_addr(), ph.mem_size()));
                }
                SegmentType::Phdr => {
                    phdr = Some(ph.virtual_addr());
                }
                _ => {}
            }
        }

        Ok(Self {
            kind,
            entry: elf.header.pt2.entry_point(),
            segments,
            interpreter,
            dynamic,
            phdr: phdr.or(covering_load).unwrap_or(0),
            phent,
            phnum,
        })
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    /// Entry point relative to the load base
    pub fn entry(&self) -> u64 {
        self.entry
    }

    pub fn segments(&self) -> &[LoadSegment] {
        &self.segments
    }

    /// Requested dynamic linker, if any
    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    /// (vaddr, size) of PT_DYNAMIC
    pub fn dynamic(&self) -> Option<(u64, u64)> {
        self.dynamic
    }

    /// Address of the program headers once loaded (relative to base)
    pub fn phdr(&self) -> u64 {
        self.phdr
    }

    pub fn phent(&self) -> u16 {
        self.phent
    }

    pub fn phnum(&self) -> u16 {
        self.phnum
    }

    /// Map every PT_LOAD segment at `base` and copy in its file bytes.
    ///
    /// Regions are page granular and fixed; a page already claimed by an
    /// earlier segment is shared rather than mapped twice.
    pub fn map_segments(&self, space: &AddressSpace, base: VirtAddr) -> Result<(), LoadError> {
        for segment in &self.segments {
            if segment.mem_size == 0 {
                continue;
            }

            let start = VirtAddr::new(base.as_u64() + segment.vaddr);
            let end = (start + segment.mem_size).align_up(PAGE_SIZE);
            let mut region_start = start.align_down(PAGE_SIZE);
            if let Some(existing) = space.region_at(region_start) {
                region_start = existing.end();
            }

            if region_start < end {
                space.allocate_anonymous(end - region_start, region_start, true, segment.flags)?;
            }
            if !segment.data.is_empty() {
                space.write(start, &segment.data)?;
            }

            log::trace!(
                "[LDR] segment {:#x}-{:#x} {:?}",
                start.as_u64(),
                end.as_u64(),
                segment.flags
            );
        }
        Ok(())
    }
}

fn file_bytes<'a>(bytes: &'a [u8], ph: &ProgramHeader<'_>) -> Result<&'a [u8], LoadError> {
    let start = usize::try_from(ph.offset()).map_err(|_| LoadError::Malformed("segment offset"))?;
    let len = usize::try_from(ph.file_size()).map_err(|_| LoadError::Malformed("segment size"))?;
    start
        .checked_add(len)
        .and_then(|end| bytes.get(start..end))
        .ok_or(LoadError::Malformed("segment data out of bounds"))
}

fn segment_flags(ph: &ProgramHeader<'_>) -> RegionFlags {
    let mut flags = RegionFlags::empty();
    let ph_flags = ph.flags();
    if ph_flags.is_read() {
        flags |= RegionFlags::READ;
    }
    if ph_flags.is_write() {
        flags |= RegionFlags::WRITE;
    }
    if ph_flags.is_execute() {
        flags |= RegionFlags::EXECUTE;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ElfBuilder, SimPaging};
    use alloc::sync::Arc;

    #[test]
    fn test_rejects_non_elf() {
        assert_eq!(ElfImage::parse(b"MZ\x90\x00").err(), Some(LoadError::BadMagic));
        assert_eq!(ElfImage::parse(&[]).err(), Some(LoadError::BadMagic));
    }

    #[test]
    fn test_rejects_wrong_machine() {
        let bytes = ElfBuilder::executable(0x40_1000).machine(0xB7).build();
        assert_eq!(ElfImage::parse(&bytes).err(), Some(LoadError::UnsupportedMachine));
    }

    #[test]
    fn test_rejects_relocatable() {
        let bytes = ElfBuilder::executable(0x40_1000).object_type(1).build();
        assert_eq!(ElfImage::parse(&bytes).err(), Some(LoadError::UnsupportedType));
    }

    #[test]
    fn test_parses_segments_and_interpreter() {
        let bytes = ElfBuilder::executable(0x40_1000)
            .interpreter("/lib/ld.so")
            .segment(0x40_0000, RegionFlags::READ_EXECUTE, &[0x90; 32], 0x2000)
            .segment(0x60_0000, RegionFlags::READ_WRITE, &[1, 2, 3], 0x1800)
            .build();
        let image = ElfImage::parse(&bytes).unwrap();

        assert_eq!(image.kind(), ImageKind::Executable);
        assert_eq!(image.entry(), 0x40_1000);
        assert_eq!(image.interpreter(), Some("/lib/ld.so"));
        assert_eq!(image.segments().len(), 2);
        assert_eq!(image.segments()[1].flags, RegionFlags::READ_WRITE);
        assert_eq!(image.phent(), 56);
    }

    #[test]
    fn test_map_segments_zero_fills_bss() {
        let paging = Arc::new(SimPaging::new());
        let space = AddressSpace::new(paging).unwrap();
        let bytes = ElfBuilder::executable(0x40_0000)
            .segment(0x40_0010, RegionFlags::READ_WRITE, &[5, 6, 7], 0x1800)
            .build();
        let image = ElfImage::parse(&bytes).unwrap();
        image.map_segments(&space, VirtAddr::zero()).unwrap();

        let region = space.region_at(VirtAddr::new(0x40_0010)).unwrap();
        assert_eq!(region.base().as_u64(), 0x40_0000);
        assert_eq!(region.size(), 0x2000);

        let mut buf = [0xFFu8; 5];
        space.read(VirtAddr::new(0x40_0010), &mut buf).unwrap();
        assert_eq!(buf, [5, 6, 7, 0, 0]);
    }
}
