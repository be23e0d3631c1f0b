pub mod frame_allocator;
pub mod paging;

use x86_64::{PhysAddr, VirtAddr};

pub use paging::AddressSpace;

pub const PAGE_SIZE: u64 = 4096;

/// Physical page allocator plus the kernel's direct map.
///
/// Every page handed out stays owned by the caller until it is given back
/// with [`PhysMemory::free_page`].
pub trait PhysMemory: Send + Sync {
    fn alloc_page(&self) -> Option<PhysAddr>;

    /// `count` physically contiguous pages.
    fn alloc_pages(&self, count: u64) -> Option<PhysAddr>;

    fn free_page(&self, page: PhysAddr);

    /// Kernel-visible address of a physical address.
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;

    /// Fill one page with zeros through the direct map.
    fn zero_page(&self, page: PhysAddr) {
        let ptr = self.phys_to_virt(page).as_mut_ptr::<u8>();
        unsafe { core::ptr::write_bytes(ptr, 0, PAGE_SIZE as usize) };
    }

    fn copy_page(&self, dst: PhysAddr, src: PhysAddr) {
        let d = self.phys_to_virt(dst).as_mut_ptr::<u8>();
        let s = self.phys_to_virt(src).as_ptr::<u8>();
        unsafe { core::ptr::copy_nonoverlapping(s, d, PAGE_SIZE as usize) };
    }
}

pub fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
