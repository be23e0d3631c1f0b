use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;

use super::{
    BinaryLoader, ExecError, LoaderScratch, AT_ENTRY, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM,
};
use crate::config::is_user_va;
use crate::fs::{self, VfsFile};
use crate::memory::{align_down, align_up, AddressSpace, PAGE_SIZE};

// ══════════════════════════════════════════════════════════════
//  ELF64 constants
// ══════════════════════════════════════════════════════════════

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8    = 2;
const ELFDATA2LSB: u8   = 1;
const ET_EXEC: u16      = 2;
const EM_X86_64: u16    = 62;
const PT_LOAD: u32      = 1;
const PT_PHDR: u32      = 6;
const PF_X: u32         = 1;
const PF_W: u32         = 2;

// ══════════════════════════════════════════════════════════════
//  ELF64 structures
// ══════════════════════════════════════════════════════════════

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[off..off + 4]);
    u32::from_le_bytes(raw)
}

fn u64_at(data: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(raw)
}

struct Elf64Ehdr {
    e_entry: u64,
    e_phoff: u64,
    e_phentsize: u16,
    e_phnum: u16,
}

impl Elf64Ehdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 64 { return Err(ExecError::InvalidFormat); }
        if data[0..4] != ELF_MAGIC { return Err(ExecError::InvalidFormat); }
        if data[4] != ELFCLASS64 { return Err(ExecError::UnsupportedArch); }
        if data[5] != ELFDATA2LSB { return Err(ExecError::UnsupportedArch); }

        if u16_at(data, 16) != ET_EXEC { return Err(ExecError::UnsupportedType); }
        if u16_at(data, 18) != EM_X86_64 { return Err(ExecError::UnsupportedArch); }

        Ok(Elf64Ehdr {
            e_entry: u64_at(data, 24),
            e_phoff: u64_at(data, 32),
            e_phentsize: u16_at(data, 54),
            e_phnum: u16_at(data, 56),
        })
    }

    fn program_headers(&self, data: &[u8]) -> Result<Vec<Elf64Phdr>, ExecError> {
        let size = self.e_phentsize as usize;
        if size < 56 { return Err(ExecError::InvalidFormat); }
        (0..self.e_phnum as usize)
            .map(|i| {
                let off = (self.e_phoff as usize)
                    .checked_add(i * size)
                    .ok_or(ExecError::InvalidFormat)?;
                data.get(off..).ok_or(ExecError::InvalidFormat).and_then(Elf64Phdr::parse)
            })
            .collect()
    }
}

struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_filesz: u64,
    p_memsz: u64,
}

impl Elf64Phdr {
    fn parse(data: &[u8]) -> Result<Self, ExecError> {
        if data.len() < 56 { return Err(ExecError::InvalidFormat); }
        Ok(Elf64Phdr {
            p_type: u32_at(data, 0),
            p_flags: u32_at(data, 4),
            p_offset: u64_at(data, 8),
            p_vaddr: u64_at(data, 16),
            p_filesz: u64_at(data, 32),
            p_memsz: u64_at(data, 40),
        })
    }

    fn page_flags(&self) -> PageTableFlags {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if self.p_flags & PF_W != 0 {
            flags |= PageTableFlags::WRITABLE;
        }
        if self.p_flags & PF_X == 0 {
            flags |= PageTableFlags::NO_EXECUTE;
        }
        flags
    }
}

// ══════════════════════════════════════════════════════════════
//  ELF Loader
// ══════════════════════════════════════════════════════════════

/// Static ELF64 executables for x86_64.
pub struct ElfLoader;

impl ElfLoader {
    /// Map every page of `[vaddr, vaddr+memsz)`. Pages first touched by this
    /// load get fresh zeroed frames; a page shared with an earlier segment
    /// keeps its frame and takes the union of both permissions.
    fn map_segment(space: &mut AddressSpace, phdr: &Elf64Phdr, fresh: &mut Vec<u64>) -> Result<(), ExecError> {
        let memory = space.memory().clone();
        let start = align_down(phdr.p_vaddr, PAGE_SIZE);
        let end = align_up(phdr.p_vaddr + phdr.p_memsz, PAGE_SIZE);
        let flags = phdr.page_flags();

        for page in (start..end).step_by(PAGE_SIZE as usize) {
            if fresh.contains(&page) {
                let existing = space.leaf_flags(page).ok_or(ExecError::MemoryError)?;
                let phys = space.translate(page).ok_or(ExecError::MemoryError)?;
                let mut merged = existing | flags;
                if !(existing & flags).contains(PageTableFlags::NO_EXECUTE) {
                    merged.remove(PageTableFlags::NO_EXECUTE);
                }
                space.map_page(page, phys, merged).map_err(|_| ExecError::MemoryError)?;
                continue;
            }
            let frame = memory.alloc_page().ok_or(ExecError::MemoryError)?;
            memory.zero_page(frame);
            if space.map_page(page, frame, flags).is_err() {
                memory.free_page(frame);
                return Err(ExecError::MemoryError);
            }
            fresh.push(page);
        }
        Ok(())
    }
}

impl BinaryLoader for ElfLoader {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn probe(&self, file: &dyn VfsFile) -> bool {
        let mut magic = [0u8; 4];
        matches!(file.read_at(0, &mut magic), Ok(4)) && magic == ELF_MAGIC
    }

    fn load(&self, file: &dyn VfsFile, space: &mut AddressSpace, scratch: &mut LoaderScratch) -> Result<(), ExecError> {
        let data = fs::read_all(file).map_err(|_| ExecError::ReadError)?;
        let ehdr = Elf64Ehdr::parse(&data)?;
        let phdrs = ehdr.program_headers(&data)?;

        let mut load_base = u64::MAX;
        let mut fresh = Vec::new();
        for phdr in phdrs.iter().filter(|p| p.p_type == PT_LOAD) {
            let seg_end = phdr.p_vaddr.checked_add(phdr.p_memsz).ok_or(ExecError::InvalidFormat)?;
            let file_end = phdr.p_offset.checked_add(phdr.p_filesz).ok_or(ExecError::InvalidFormat)?;
            if phdr.p_filesz > phdr.p_memsz
                || file_end > data.len() as u64
                || !is_user_va(phdr.p_vaddr)
                || !is_user_va(seg_end.saturating_sub(1))
            {
                return Err(ExecError::InvalidFormat);
            }

            Self::map_segment(space, phdr, &mut fresh)?;
            let bytes = &data[phdr.p_offset as usize..file_end as usize];
            space.write_bytes(phdr.p_vaddr, bytes).map_err(|_| ExecError::MemoryError)?;
            load_base = load_base.min(align_down(phdr.p_vaddr, PAGE_SIZE));
        }

        if load_base == u64::MAX {
            return Err(ExecError::InvalidFormat);
        }
        if space.translate(ehdr.e_entry).is_none() {
            crate::log_error!("ELF: entry {:#x} is not inside a loaded segment", ehdr.e_entry);
            return Err(ExecError::InvalidFormat);
        }

        let phdr_va = phdrs
            .iter()
            .find(|p| p.p_type == PT_PHDR)
            .map(|p| p.p_vaddr)
            .or_else(|| {
                phdrs
                    .iter()
                    .filter(|p| p.p_type == PT_LOAD)
                    .find(|p| (p.p_offset..p.p_offset + p.p_filesz).contains(&ehdr.e_phoff))
                    .map(|p| p.p_vaddr + (ehdr.e_phoff - p.p_offset))
            })
            .unwrap_or(0);

        scratch.entry = ehdr.e_entry;
        scratch.load_base = load_base;
        scratch.phdr = phdr_va;
        scratch.phent = ehdr.e_phentsize as u64;
        scratch.phnum = ehdr.e_phnum as u64;

        crate::log_debug!(
            "ELF: {} pages mapped from {:#x}, entry={:#x}",
            fresh.len(),
            load_base,
            ehdr.e_entry
        );
        Ok(())
    }

    fn build_auxv(&self, _file: &dyn VfsFile, scratch: &LoaderScratch, out: &mut [u64]) -> Option<usize> {
        let pairs = [
            (AT_PHDR, scratch.phdr),
            (AT_PHENT, scratch.phent),
            (AT_PHNUM, scratch.phnum),
            (AT_PAGESZ, PAGE_SIZE),
            (AT_ENTRY, scratch.entry),
            (AT_NULL, 0),
        ];
        if out.len() < pairs.len() * 2 {
            return None;
        }
        for (i, (key, value)) in pairs.iter().enumerate() {
            out[2 * i] = *key;
            out[2 * i + 1] = *value;
        }
        Some(pairs.len() * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{OpenFlags, RamFs, Vfs};
    use crate::testing::{elf_image, elf_image_at, Arena};

    fn open(bytes: &[u8]) -> (RamFs, crate::fs::FileRef) {
        let fs = RamFs::new("ramfs");
        fs.write_file("/bin", bytes).unwrap();
        let file = fs.open("/bin", OpenFlags::RDONLY).unwrap();
        (fs, file)
    }

    #[test]
    fn segment_bytes_land_at_their_virtual_address() {
        let arena = Arena::new(64);
        let (_fs, file) = open(&elf_image(0x40_1000, &[0xB8, 0x3C, 0x00, 0x00, 0x00, 0x0F, 0x05]));
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let mut scratch = LoaderScratch::default();
        ElfLoader.load(file.as_ref(), &mut space, &mut scratch).unwrap();

        let mut code = [0u8; 7];
        space.read_bytes(0x40_1000, &mut code).unwrap();
        assert_eq!(code, [0xB8, 0x3C, 0x00, 0x00, 0x00, 0x0F, 0x05]);
        assert_eq!(scratch.entry, 0x40_1000);
        assert_eq!(scratch.phnum, 1);
        assert_eq!(scratch.phdr, 0x40_0040);
        let flags = space.leaf_flags(0x40_1000).unwrap();
        assert!(flags.contains(PageTableFlags::USER_ACCESSIBLE));
        assert!(!flags.contains(PageTableFlags::NO_EXECUTE));
    }

    #[test]
    fn header_validation() {
        let arena = Arena::new(16);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let mut scratch = LoaderScratch::default();

        let mut bad_class = elf_image(0x40_1000, &[0xC3]);
        bad_class[4] = 1;
        let (_fs, file) = open(&bad_class);
        assert_eq!(ElfLoader.load(file.as_ref(), &mut space, &mut scratch), Err(ExecError::UnsupportedArch));

        let mut dyn_type = elf_image(0x40_1000, &[0xC3]);
        dyn_type[16] = 3;
        let (_fs, file) = open(&dyn_type);
        assert_eq!(ElfLoader.load(file.as_ref(), &mut space, &mut scratch), Err(ExecError::UnsupportedType));

        let (_fs, file) = open(b"\x7FELF");
        assert!(ElfLoader.probe(file.as_ref()));
        assert_eq!(ElfLoader.load(file.as_ref(), &mut space, &mut scratch), Err(ExecError::InvalidFormat));
    }

    #[test]
    fn entry_outside_segments_is_rejected() {
        let arena = Arena::new(64);
        let (_fs, file) = open(&elf_image_at(0x40_0000, 0x90_0000, &[0xC3]));
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let mut scratch = LoaderScratch::default();
        assert_eq!(ElfLoader.load(file.as_ref(), &mut space, &mut scratch), Err(ExecError::InvalidFormat));
    }

    #[test]
    fn auxv_needs_room_for_every_pair() {
        let (_fs, file) = open(&elf_image(0x40_1000, &[0xC3]));
        let scratch = LoaderScratch { entry: 0x40_1000, ..Default::default() };
        let mut small = [0u64; 4];
        assert_eq!(ElfLoader.build_auxv(file.as_ref(), &scratch, &mut small), None);
        let mut room = [0u64; 16];
        assert_eq!(ElfLoader.build_auxv(file.as_ref(), &scratch, &mut room), Some(12));
        assert_eq!(&room[8..10], &[AT_ENTRY, 0x40_1000]);
    }
}
