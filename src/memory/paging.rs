//! Per-process four-level page tables.
//!
//! Only the lower (user) half of the hierarchy belongs to an
//! [`AddressSpace`]; P4 slots 256..512 are copied from the kernel template
//! and never walked, duplicated, or freed here. Every leaf frame and every
//! intermediate table reachable from the user half is owned by the space
//! and returned to the allocator on drop.

use alloc::sync::Arc;
use alloc::vec::Vec;
use x86_64::{
    structures::paging::{PageTable, PageTableFlags},
    PhysAddr,
};

use super::{align_up, PhysMemory, PAGE_SIZE};
use crate::config::{is_user_va, USER_VA_END};
use crate::error::{ProcError, ProcResult};

const ENTRIES: usize = 512;
const USER_P4_ENTRIES: usize = 256;

/// Flags carried over from a parent leaf into the child's copy.
const FORK_FLAG_MASK: PageTableFlags = PageTableFlags::from_bits_truncate(
    PageTableFlags::PRESENT.bits()
        | PageTableFlags::WRITABLE.bits()
        | PageTableFlags::USER_ACCESSIBLE.bits()
        | PageTableFlags::WRITE_THROUGH.bits()
        | PageTableFlags::NO_CACHE.bits()
        | PageTableFlags::ACCESSED.bits()
        | PageTableFlags::DIRTY.bits()
        | PageTableFlags::NO_EXECUTE.bits(),
);

fn table_flags() -> PageTableFlags {
    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
}

fn indexes(va: u64) -> [usize; 4] {
    [
        ((va >> 39) & 0x1FF) as usize,
        ((va >> 30) & 0x1FF) as usize,
        ((va >> 21) & 0x1FF) as usize,
        ((va >> 12) & 0x1FF) as usize,
    ]
}

pub struct AddressSpace {
    root: PhysAddr,
    memory: Arc<dyn PhysMemory>,
}

impl AddressSpace {
    /// Allocate an empty space. When `kernel_root` is given, its upper-half
    /// P4 entries are shared into the new root.
    pub fn new(memory: Arc<dyn PhysMemory>, kernel_root: Option<PhysAddr>) -> Option<Self> {
        let root = memory.alloc_page()?;
        memory.zero_page(root);
        let space = AddressSpace { root, memory };
        if let Some(kernel) = kernel_root {
            let src = space.table(kernel);
            let dst = space.table_mut(space.root);
            for i in USER_P4_ENTRIES..ENTRIES {
                dst[i] = src[i].clone();
            }
        }
        Some(space)
    }

    /// Physical address of the P4 table, i.e. the CR3 value.
    pub fn physical_base(&self) -> PhysAddr {
        self.root
    }

    pub fn memory(&self) -> &Arc<dyn PhysMemory> {
        &self.memory
    }

    fn table(&self, phys: PhysAddr) -> &PageTable {
        unsafe { &*self.memory.phys_to_virt(phys).as_ptr::<PageTable>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, phys: PhysAddr) -> &mut PageTable {
        unsafe { &mut *self.memory.phys_to_virt(phys).as_mut_ptr::<PageTable>() }
    }

    /// Physical address of the next-level table behind `table[index]`,
    /// allocating a zeroed one if the slot is empty.
    fn next_table_create(&mut self, table: PhysAddr, index: usize) -> ProcResult<PhysAddr> {
        let entry = &mut self.table_mut(table)[index];
        if entry.flags().contains(PageTableFlags::PRESENT) {
            if entry.flags().contains(PageTableFlags::HUGE_PAGE) {
                return Err(ProcError::StateConflict);
            }
            return Ok(entry.addr());
        }
        let frame = self.memory.alloc_page().ok_or(ProcError::OutOfMemory)?;
        self.memory.zero_page(frame);
        self.table_mut(table)[index].set_addr(frame, table_flags());
        Ok(frame)
    }

    /// Install one 4 KiB leaf. A frame already mapped at `va` is released.
    pub fn map_page(&mut self, va: u64, phys: PhysAddr, flags: PageTableFlags) -> ProcResult<()> {
        if !is_user_va(va) || va % PAGE_SIZE != 0 {
            return Err(ProcError::BadAddress);
        }
        let [i4, i3, i2, i1] = indexes(va);
        let p3 = self.next_table_create(self.root, i4)?;
        let p2 = self.next_table_create(p3, i3)?;
        let p1 = self.next_table_create(p2, i2)?;
        let leaf = &mut self.table_mut(p1)[i1];
        if leaf.flags().contains(PageTableFlags::PRESENT) {
            let old = leaf.addr();
            if old != phys {
                self.memory.free_page(old);
            }
        }
        self.table_mut(p1)[i1].set_addr(phys, flags | PageTableFlags::PRESENT);
        Ok(())
    }

    /// Map `len` bytes (rounded up to whole pages) at `base` onto freshly
    /// allocated, contiguous, zero-filled frames.
    pub fn map_range_zeroed(&mut self, base: u64, len: u64, flags: PageTableFlags) -> ProcResult<()> {
        let pages = align_up(len, PAGE_SIZE) / PAGE_SIZE;
        if pages == 0 {
            return Ok(());
        }
        let phys = self.memory.alloc_pages(pages).ok_or(ProcError::OutOfMemory)?;
        for i in 0..pages {
            let frame = phys + i * PAGE_SIZE;
            if let Err(err) = self.map_page(base + i * PAGE_SIZE, frame, flags) {
                for j in i..pages {
                    self.memory.free_page(phys + j * PAGE_SIZE);
                }
                crate::log_error!("paging: map_range_zeroed failed at {:#x}: {}", base + i * PAGE_SIZE, err);
                return Err(err);
            }
            self.memory.zero_page(frame);
        }
        Ok(())
    }

    /// Resolve `va` to the physical byte it maps, following huge leaves.
    pub fn translate(&self, va: u64) -> Option<PhysAddr> {
        if va >= USER_VA_END {
            return None;
        }
        let [i4, i3, i2, i1] = indexes(va);
        let e4 = &self.table(self.root)[i4];
        if !e4.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let e3 = &self.table(e4.addr())[i3];
        if !e3.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if e3.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(e3.addr() + (va & 0x3FFF_FFFF));
        }
        let e2 = &self.table(e3.addr())[i2];
        if !e2.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        if e2.flags().contains(PageTableFlags::HUGE_PAGE) {
            return Some(e2.addr() + (va & 0x1F_FFFF));
        }
        let e1 = &self.table(e2.addr())[i1];
        if !e1.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(e1.addr() + (va & 0xFFF))
    }

    /// Flags of the 4 KiB leaf mapping `va`.
    pub fn leaf_flags(&self, va: u64) -> Option<PageTableFlags> {
        self.leaf(va).map(|(p1, i1)| self.table(p1)[i1].flags())
    }

    fn leaf(&self, va: u64) -> Option<(PhysAddr, usize)> {
        if va >= USER_VA_END {
            return None;
        }
        let [i4, i3, i2, i1] = indexes(va);
        let mut table = self.root;
        for index in [i4, i3, i2] {
            let entry = &self.table(table)[index];
            let flags = entry.flags();
            if !flags.contains(PageTableFlags::PRESENT) || flags.contains(PageTableFlags::HUGE_PAGE) {
                return None;
            }
            table = entry.addr();
        }
        self.table(table)[i1]
            .flags()
            .contains(PageTableFlags::PRESENT)
            .then_some((table, i1))
    }

    /// Build a child space holding a private copy of every present,
    /// user-accessible 4 KiB leaf of this one. Huge leaves are skipped.
    ///
    /// On failure the partial child is dropped, which frees every frame it
    /// had acquired.
    pub fn duplicate(&self) -> ProcResult<AddressSpace> {
        let mut child = AddressSpace::new(self.memory.clone(), Some(self.root)).ok_or(ProcError::OutOfMemory)?;
        let present = PageTableFlags::PRESENT;
        let huge = PageTableFlags::HUGE_PAGE;

        for l4 in 0..USER_P4_ENTRIES {
            let e4 = self.table(self.root)[l4].clone();
            if !e4.flags().contains(present) {
                continue;
            }
            for l3 in 0..ENTRIES {
                let e3 = self.table(e4.addr())[l3].clone();
                if !e3.flags().contains(present) || e3.flags().contains(huge) {
                    continue;
                }
                for l2 in 0..ENTRIES {
                    let e2 = self.table(e3.addr())[l2].clone();
                    if !e2.flags().contains(present) || e2.flags().contains(huge) {
                        continue;
                    }
                    for l1 in 0..ENTRIES {
                        let leaf = self.table(e2.addr())[l1].clone();
                        let flags = leaf.flags();
                        if !flags.contains(present) || !flags.contains(PageTableFlags::USER_ACCESSIBLE) {
                            continue;
                        }
                        let va = ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12);
                        if !is_user_va(va) {
                            continue;
                        }
                        let Some(copy) = self.memory.alloc_page() else {
                            crate::log_error!("paging: duplicate out of frames at va={:#x}", va);
                            return Err(ProcError::OutOfMemory);
                        };
                        self.memory.copy_page(copy, leaf.addr());
                        if let Err(err) = child.map_page(va, copy, flags & FORK_FLAG_MASK) {
                            self.memory.free_page(copy);
                            return Err(err);
                        }
                    }
                }
            }
        }
        Ok(child)
    }

    /// Virtual addresses of all mapped user 4 KiB pages, ascending.
    pub fn user_pages(&self) -> Vec<u64> {
        let mut pages = Vec::new();
        self.walk_user(|va, _| pages.push(va));
        pages
    }

    fn walk_user(&self, mut visit: impl FnMut(u64, PhysAddr)) {
        for l4 in 0..USER_P4_ENTRIES {
            let e4 = &self.table(self.root)[l4];
            if !e4.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            for l3 in 0..ENTRIES {
                let e3 = &self.table(e4.addr())[l3];
                if !e3.flags().contains(PageTableFlags::PRESENT) || e3.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                for l2 in 0..ENTRIES {
                    let e2 = &self.table(e3.addr())[l2];
                    if !e2.flags().contains(PageTableFlags::PRESENT) || e2.flags().contains(PageTableFlags::HUGE_PAGE) {
                        continue;
                    }
                    for l1 in 0..ENTRIES {
                        let leaf = &self.table(e2.addr())[l1];
                        if leaf.flags().contains(PageTableFlags::PRESENT) {
                            let va = ((l4 as u64) << 39) | ((l3 as u64) << 30) | ((l2 as u64) << 21) | ((l1 as u64) << 12);
                            visit(va, leaf.addr());
                        }
                    }
                }
            }
        }
    }

    // ── user memory access through the page tables ──

    pub fn write_bytes(&self, va: u64, data: &[u8]) -> ProcResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let cur = va.checked_add(done as u64).ok_or(ProcError::BadAddress)?;
            let phys = self.translate(cur).ok_or(ProcError::BadAddress)?;
            let room = (PAGE_SIZE - (cur % PAGE_SIZE)) as usize;
            let chunk = room.min(data.len() - done);
            let dst = self.memory.phys_to_virt(phys).as_mut_ptr::<u8>();
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), dst, chunk) };
            done += chunk;
        }
        Ok(())
    }

    pub fn read_bytes(&self, va: u64, buf: &mut [u8]) -> ProcResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let cur = va.checked_add(done as u64).ok_or(ProcError::BadAddress)?;
            let phys = self.translate(cur).ok_or(ProcError::BadAddress)?;
            let room = (PAGE_SIZE - (cur % PAGE_SIZE)) as usize;
            let chunk = room.min(buf.len() - done);
            let src = self.memory.phys_to_virt(phys).as_ptr::<u8>();
            unsafe { core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk) };
            done += chunk;
        }
        Ok(())
    }

    pub fn write_u64(&self, va: u64, value: u64) -> ProcResult<()> {
        self.write_bytes(va, &value.to_le_bytes())
    }

    pub fn read_u64(&self, va: u64) -> ProcResult<u64> {
        let mut raw = [0u8; 8];
        self.read_bytes(va, &mut raw)?;
        Ok(u64::from_le_bytes(raw))
    }

    /// NUL-terminated string at `va`, at most `max` bytes before the NUL.
    pub fn read_cstr(&self, va: u64, max: usize) -> ProcResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.read_bytes(va + out.len() as u64, &mut byte)?;
            if byte[0] == 0 {
                return Ok(out);
            }
            if out.len() == max {
                return Err(ProcError::InvalidArgument);
            }
            out.push(byte[0]);
        }
    }

    fn release(&mut self) {
        let memory = self.memory.clone();
        let mut tables = Vec::new();
        for l4 in 0..USER_P4_ENTRIES {
            let e4 = self.table(self.root)[l4].clone();
            if !e4.flags().contains(PageTableFlags::PRESENT) {
                continue;
            }
            for l3 in 0..ENTRIES {
                let e3 = self.table(e4.addr())[l3].clone();
                if !e3.flags().contains(PageTableFlags::PRESENT) || e3.flags().contains(PageTableFlags::HUGE_PAGE) {
                    continue;
                }
                for l2 in 0..ENTRIES {
                    let e2 = self.table(e3.addr())[l2].clone();
                    if !e2.flags().contains(PageTableFlags::PRESENT) || e2.flags().contains(PageTableFlags::HUGE_PAGE) {
                        continue;
                    }
                    tables.push(e2.addr());
                }
                tables.push(e3.addr());
            }
            tables.push(e4.addr());
        }
        self.walk_user(|_, phys| memory.free_page(phys));
        for table in tables {
            memory.free_page(table);
        }
        memory.free_page(self.root);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    fn user_rw() -> PageTableFlags {
        PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE
    }

    #[test]
    fn map_and_translate_single_page() {
        let arena = Arena::new(32);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let frame = arena.allocator().alloc_page().unwrap();
        space.map_page(0x40_0000, frame, user_rw()).unwrap();
        assert_eq!(space.translate(0x40_0123), Some(frame + 0x123u64));
        assert_eq!(space.translate(0x40_1000), None);
    }

    #[test]
    fn kernel_half_and_unaligned_addresses_are_rejected() {
        let arena = Arena::new(16);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let frame = arena.allocator().alloc_page().unwrap();
        assert_eq!(space.map_page(USER_VA_END, frame, user_rw()), Err(ProcError::BadAddress));
        assert_eq!(space.map_page(0x40_0010, frame, user_rw()), Err(ProcError::BadAddress));
    }

    #[test]
    fn zeroed_range_rounds_up_and_reads_back_zero() {
        let arena = Arena::new(64);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        space.map_range_zeroed(0x80_0000, PAGE_SIZE + 1, user_rw()).unwrap();
        assert_eq!(space.user_pages(), [0x80_0000, 0x80_1000]);
        let mut buf = [0xFFu8; 64];
        space.read_bytes(0x80_1000 - 32, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn zeroed_range_fails_when_frames_run_out() {
        let arena = Arena::new(4);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        assert_eq!(
            space.map_range_zeroed(0x80_0000, 16 * PAGE_SIZE, user_rw()),
            Err(ProcError::OutOfMemory)
        );
    }

    #[test]
    fn writes_cross_page_boundaries() {
        let arena = Arena::new(64);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        space.map_range_zeroed(0x80_0000, 2 * PAGE_SIZE, user_rw()).unwrap();
        space.write_bytes(0x80_0FFC, b"abcdefgh\0").unwrap();
        assert_eq!(space.read_cstr(0x80_0FFC, 64).unwrap(), b"abcdefgh");
        space.write_u64(0x80_0FF8, 0xDEAD_BEEF_0BAD_F00D).unwrap();
        assert_eq!(space.read_u64(0x80_0FF8).unwrap(), 0xDEAD_BEEF_0BAD_F00D);
        assert_eq!(space.read_u64(0x90_0000), Err(ProcError::BadAddress));
    }

    #[test]
    fn duplicate_isolates_every_user_page() {
        let arena = Arena::new(128);
        let mut parent = AddressSpace::new(arena.memory(), None).unwrap();
        parent.map_range_zeroed(0x40_0000, 3 * PAGE_SIZE, user_rw()).unwrap();
        for (i, va) in parent.user_pages().into_iter().enumerate() {
            parent.write_u64(va, i as u64 + 1).unwrap();
        }

        let child = parent.duplicate().unwrap();
        assert_eq!(child.user_pages(), parent.user_pages());
        for (i, va) in child.user_pages().into_iter().enumerate() {
            assert_eq!(child.read_u64(va).unwrap(), i as u64 + 1);
            assert_ne!(child.translate(va), parent.translate(va));
            child.write_u64(va, 0xC0FFEE).unwrap();
            assert_eq!(parent.read_u64(va).unwrap(), i as u64 + 1);
        }
    }

    #[test]
    fn duplicate_preserves_protection_bits() {
        let arena = Arena::new(64);
        let mut parent = AddressSpace::new(arena.memory(), None).unwrap();
        let flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE | PageTableFlags::NO_EXECUTE;
        parent.map_range_zeroed(0x40_0000, PAGE_SIZE, flags).unwrap();
        let child = parent.duplicate().unwrap();
        let copied = child.leaf_flags(0x40_0000).unwrap();
        assert!(copied.contains(PageTableFlags::NO_EXECUTE));
        assert!(!copied.contains(PageTableFlags::WRITABLE));
    }

    #[test]
    fn duplicate_skips_supervisor_leaves() {
        let arena = Arena::new(64);
        let mut parent = AddressSpace::new(arena.memory(), None).unwrap();
        parent
            .map_range_zeroed(0x40_0000, PAGE_SIZE, PageTableFlags::PRESENT | PageTableFlags::WRITABLE)
            .unwrap();
        let child = parent.duplicate().unwrap();
        assert!(child.user_pages().is_empty());
    }

    #[test]
    fn failed_duplicate_returns_every_frame() {
        let arena = Arena::new(20);
        let mut parent = AddressSpace::new(arena.memory(), None).unwrap();
        parent.map_range_zeroed(0x40_0000, 8 * PAGE_SIZE, user_rw()).unwrap();
        let before = arena.allocator().free_frames();
        assert_eq!(parent.duplicate().err(), Some(ProcError::OutOfMemory));
        assert_eq!(arena.allocator().free_frames(), before);
    }

    #[test]
    fn drop_returns_tables_and_frames() {
        let arena = Arena::new(64);
        let before = arena.allocator().free_frames();
        {
            let mut space = AddressSpace::new(arena.memory(), None).unwrap();
            space.map_range_zeroed(0x40_0000, 4 * PAGE_SIZE, user_rw()).unwrap();
        }
        assert_eq!(arena.allocator().free_frames(), before);
    }
}
