//! Host-side fixtures: a heap-backed physical arena, tiny ELF images and a
//! fully wired process manager.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::vec::Vec;

use x86_64::{PhysAddr, VirtAddr};

use crate::config::ProcConfig;
use crate::fs::RamFs;
use crate::memory::frame_allocator::BumpFrameAllocator;
use crate::memory::{align_down, PhysMemory, PAGE_SIZE};
use crate::process::{Pid, ProcObserver, ProcessManager, ProcessRef};
use crate::scheduler::ThreadManager;

/// Pretend physical address of the first arena page.
const ARENA_PHYS: u64 = 0x10_0000;

/// Page-aligned host memory posing as physical RAM behind a direct map.
pub struct Arena {
    base: *mut u8,
    layout: Layout,
    frames: Arc<BumpFrameAllocator>,
}

impl Arena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "arena allocation failed");
        let offset = VirtAddr::new(base as u64 - ARENA_PHYS);
        let end = PhysAddr::new(ARENA_PHYS + layout.size() as u64);
        let frames = unsafe { BumpFrameAllocator::new(PhysAddr::new(ARENA_PHYS), end, offset) };
        Arena { base, layout, frames: Arc::new(frames) }
    }

    pub fn allocator(&self) -> &BumpFrameAllocator {
        &self.frames
    }

    pub fn memory(&self) -> Arc<dyn PhysMemory> {
        self.frames.clone()
    }

    pub fn free_frames(&self) -> u64 {
        self.frames.free_frames()
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // Something still holds the allocator (the global manager, say):
        // leak the pages rather than leave it pointing at freed memory.
        if Arc::strong_count(&self.frames) == 1 {
            unsafe { dealloc(self.base, self.layout) };
        }
    }
}

/// Static x86_64 executable with one R+X segment at `base`. The headers sit
/// at the start of the segment and `code` at `base + 0x1000`.
pub fn elf_image_at(base: u64, entry: u64, code: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; PAGE_SIZE as usize + code.len()];
    let len = image.len() as u64;

    image[..4].copy_from_slice(b"\x7FELF");
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[6] = 1;
    image[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image[18..20].copy_from_slice(&62u16.to_le_bytes()); // EM_X86_64
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[24..32].copy_from_slice(&entry.to_le_bytes());
    image[32..40].copy_from_slice(&0x40u64.to_le_bytes());
    image[52..54].copy_from_slice(&64u16.to_le_bytes());
    image[54..56].copy_from_slice(&56u16.to_le_bytes());
    image[56..58].copy_from_slice(&1u16.to_le_bytes());

    let ph = &mut image[0x40..0x40 + 56];
    ph[0..4].copy_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    ph[4..8].copy_from_slice(&5u32.to_le_bytes()); // R | X
    ph[16..24].copy_from_slice(&base.to_le_bytes());
    ph[24..32].copy_from_slice(&base.to_le_bytes());
    ph[32..40].copy_from_slice(&len.to_le_bytes());
    ph[40..48].copy_from_slice(&len.to_le_bytes());
    ph[48..56].copy_from_slice(&PAGE_SIZE.to_le_bytes());

    image[PAGE_SIZE as usize..].copy_from_slice(code);
    image
}

/// Image whose code page starts at `entry`.
pub fn elf_image(entry: u64, code: &[u8]) -> Vec<u8> {
    elf_image_at(align_down(entry, PAGE_SIZE) - PAGE_SIZE, entry, code)
}

pub const PROG: &str = "/bin/prog";

#[derive(Default)]
pub struct CountingObserver {
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl CountingObserver {
    pub fn added(&self) -> usize {
        self.added.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl ProcObserver for CountingObserver {
    fn process_added(&self, _pid: Pid) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }

    fn process_removed(&self, _pid: Pid) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Manager, scheduler and filesystem wired over one arena. Fields drop in
/// order, so the arena goes last.
pub struct TestKernel {
    pub procs: Arc<ProcessManager>,
    pub sched: Arc<ThreadManager>,
    pub fs: Arc<RamFs>,
    pub observer: Arc<CountingObserver>,
    pub arena: Arena,
}

impl TestKernel {
    pub fn new() -> Self {
        Self::build(ProcConfig::default(), 1024, true)
    }

    pub fn without_tty() -> Self {
        Self::build(ProcConfig::default(), 1024, false)
    }

    pub fn with_pid_max(pid_max: Pid) -> Self {
        Self::build(ProcConfig { pid_max, ..Default::default() }, 1024, true)
    }

    pub fn with_max_procs(max_procs: usize) -> Self {
        Self::build(ProcConfig { max_procs, ..Default::default() }, 1024, true)
    }

    pub fn with_arena_pages(pages: usize) -> Self {
        Self::build(ProcConfig::default(), pages, true)
    }

    fn build(config: ProcConfig, pages: usize, tty: bool) -> Self {
        let arena = Arena::new(pages);
        let fs = Arc::new(RamFs::with_devices("ramfs", tty));
        fs.mkdir("/bin").unwrap();
        fs.mkdir("/etc").unwrap();
        fs.mkdir("/tmp").unwrap();
        // nop; ret
        fs.write_file(PROG, &elf_image(0x40_1000, &[0x90, 0xC3])).unwrap();
        fs.write_file("/etc/motd", b"hello world").unwrap();

        let sched = Arc::new(ThreadManager::new(1, || 0, std::thread::yield_now));
        let observer = Arc::new(CountingObserver::default());
        let procs = ProcessManager::new(config, arena.memory(), fs.clone(), sched.clone())
            .with_observer(observer.clone());

        TestKernel { procs: Arc::new(procs), sched, fs, observer, arena }
    }

    /// Create a process and exec `path` in it.
    pub fn spawn(&self, path: &str, argv: &[&[u8]], envp: &[&[u8]]) -> ProcessRef {
        let p = self.procs.create().unwrap();
        self.procs.execve(&p, path, argv, envp).unwrap();
        p
    }
}
