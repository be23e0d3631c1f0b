use alloc::vec::Vec;
use spin::Mutex;
use x86_64::{
    structures::paging::{FrameAllocator, PhysFrame, Size4KiB},
    PhysAddr, VirtAddr,
};

use super::{PhysMemory, PAGE_SIZE};

/// A bump allocator for physical memory frames.
///
/// Single frames given back are recycled through a free list; contiguous
/// runs always come from the bump region.
pub struct BumpFrameAllocator {
    inner: Mutex<BumpInner>,
    /// Virtual address of physical 0 in the kernel's direct map.
    phys_offset: u64,
}

struct BumpInner {
    next_free_frame: PhysFrame,
    current_limit: PhysFrame,
    recycled: Vec<PhysFrame>,
}

impl BumpInner {
    fn allocate_run(&mut self, count: u64) -> Option<PhysFrame> {
        let first = self.next_free_frame;
        let end = first.start_address().as_u64().checked_add(count.checked_mul(PAGE_SIZE)?)?;
        if count == 0 || end > self.current_limit.start_address().as_u64() {
            return None;
        }
        self.next_free_frame = PhysFrame::containing_address(PhysAddr::new(end));
        Some(first)
    }
}

impl BumpFrameAllocator {
    /// Hand out frames in `[start, end)`; `phys_offset` is where the direct
    /// map places physical address 0.
    ///
    /// # Safety
    /// The range must be unused RAM and fully covered by the direct map.
    pub unsafe fn new(start: PhysAddr, end: PhysAddr, phys_offset: VirtAddr) -> Self {
        BumpFrameAllocator {
            inner: Mutex::new(BumpInner {
                next_free_frame: PhysFrame::containing_address(start.align_up(PAGE_SIZE)),
                current_limit: PhysFrame::containing_address(end.align_down(PAGE_SIZE)),
                recycled: Vec::new(),
            }),
            phys_offset: phys_offset.as_u64(),
        }
    }

    /// Frames still available from the bump region and the free list.
    pub fn free_frames(&self) -> u64 {
        let inner = self.inner.lock();
        let bump = (inner.current_limit.start_address() - inner.next_free_frame.start_address()) / PAGE_SIZE;
        bump + inner.recycled.len() as u64
    }
}

unsafe impl FrameAllocator<Size4KiB> for BumpFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let inner = self.inner.get_mut();
        if let Some(frame) = inner.recycled.pop() {
            return Some(frame);
        }
        inner.allocate_run(1)
    }
}

impl PhysMemory for BumpFrameAllocator {
    fn alloc_page(&self) -> Option<PhysAddr> {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.recycled.pop() {
            return Some(frame.start_address());
        }
        inner.allocate_run(1).map(|f| f.start_address())
    }

    fn alloc_pages(&self, count: u64) -> Option<PhysAddr> {
        self.inner.lock().allocate_run(count).map(|f| f.start_address())
    }

    fn free_page(&self, page: PhysAddr) {
        self.inner.lock().recycled.push(PhysFrame::containing_address(page));
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.phys_offset.wrapping_add(phys.as_u64()))
    }
}
