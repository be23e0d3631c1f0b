pub mod context;
pub mod task;

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

pub use context::UserContext;
pub use task::{Thread, ThreadId, ThreadKind, ThreadRef, ThreadState, WaitReason, MAX_SIGNAL_HANDLERS};

use crate::process::Pid;

/// Upper bound on live threads.
pub const MAX_THREADS: usize = 65536;

/// All threads plus the run queue and per-CPU current slots.
pub struct ThreadList {
    threads: Vec<ThreadRef>,
    ready: VecDeque<ThreadRef>,
    current: Vec<Option<ThreadRef>>,
    next_tid: u64,
}

impl ThreadList {
    pub fn find(&self, tid: ThreadId) -> Option<ThreadRef> {
        self.threads.iter().find(|t| t.lock().id == tid).cloned()
    }

    pub fn threads_of(&self, pid: Pid) -> Vec<ThreadRef> {
        self.threads
            .iter()
            .filter(|t| t.lock().process == Some(pid))
            .cloned()
            .collect()
    }

    fn detach(&mut self, thread: &ThreadRef) {
        self.threads.retain(|t| !Arc::ptr_eq(t, thread));
        self.ready.retain(|t| !Arc::ptr_eq(t, thread));
        for slot in self.current.iter_mut() {
            if slot.as_ref().is_some_and(|t| Arc::ptr_eq(t, thread)) {
                *slot = None;
            }
        }
    }

    /// Drop every per-CPU current reference to a thread of `pid`.
    pub fn clear_current_of(&mut self, pid: Pid) -> usize {
        let mut cleared = 0;
        for slot in self.current.iter_mut() {
            if slot.as_ref().is_some_and(|t| t.lock().process == Some(pid)) {
                *slot = None;
                cleared += 1;
            }
        }
        cleared
    }

    /// Terminate and forget every thread of `pid`.
    pub fn destroy_threads_of(&mut self, pid: Pid) -> usize {
        let doomed = self.threads_of(pid);
        for thread in &doomed {
            thread.lock().state = ThreadState::Terminated;
            self.detach(thread);
        }
        doomed.len()
    }

    /// Make runnable any thread of `pid` that is blocked waiting for a child.
    pub fn wake_child_waiters(&mut self, pid: Pid) {
        for thread in self.threads_of(pid) {
            let woke = {
                let mut t = thread.lock();
                if t.state == ThreadState::Blocked && t.wait_reason == WaitReason::Child {
                    t.state = ThreadState::Ready;
                    t.wait_reason = WaitReason::None;
                    true
                } else {
                    false
                }
            };
            if woke && !self.ready.iter().any(|r| Arc::ptr_eq(r, &thread)) {
                self.ready.push_back(thread);
            }
        }
    }
}

/// Thread lifecycle, run queue and tick source.
pub struct ThreadManager {
    list: Mutex<ThreadList>,
    ticks: AtomicU64,
    cpu_id: fn() -> usize,
    switch_hook: fn(),
}

impl ThreadManager {
    /// `cpu_id` names the executing CPU; `switch_hook` runs after every
    /// yield and is where a real context switch happens.
    pub fn new(cpus: usize, cpu_id: fn() -> usize, switch_hook: fn()) -> Self {
        let mut current = Vec::with_capacity(cpus);
        current.resize_with(cpus.max(1), || None);
        ThreadManager {
            list: Mutex::new(ThreadList {
                threads: Vec::new(),
                ready: VecDeque::new(),
                current,
                next_tid: 1,
            }),
            ticks: AtomicU64::new(0),
            cpu_id,
            switch_hook,
        }
    }

    fn cpu(&self, list: &ThreadList) -> usize {
        (self.cpu_id)().min(list.current.len() - 1)
    }

    pub fn create_thread(&self, kind: ThreadKind, entry: u64, arg: u64, priority: u8) -> Option<ThreadRef> {
        let mut list = self.list.lock();
        if list.threads.len() >= MAX_THREADS {
            crate::log_warn!("sched: thread limit reached");
            return None;
        }
        let id = ThreadId(list.next_tid);
        list.next_tid += 1;
        let thread = Arc::new(Mutex::new(Thread::new(id, kind, entry, arg, priority)));
        list.threads.push(thread.clone());
        crate::log_debug!("sched: created thread {} entry={:#x}", id.0, entry);
        Some(thread)
    }

    pub fn destroy_thread(&self, thread: &ThreadRef) {
        thread.lock().state = ThreadState::Terminated;
        self.list.lock().detach(thread);
    }

    /// Mark `thread` ready and queue it if it is not queued already.
    pub fn execute(&self, thread: &ThreadRef) {
        let mut list = self.list.lock();
        thread.lock().state = ThreadState::Ready;
        if !list.ready.iter().any(|t| Arc::ptr_eq(t, thread)) {
            list.ready.push_back(thread.clone());
        }
    }

    /// Rotate the run queue by one and hand the CPU to the switch hook.
    pub fn yield_now(&self) {
        {
            let mut list = self.list.lock();
            if let Some(front) = list.ready.pop_front() {
                list.ready.push_back(front);
            }
        }
        (self.switch_hook)();
    }

    /// Take the next ready thread and make it current on this CPU.
    pub fn schedule(&self) -> Option<ThreadRef> {
        let mut list = self.list.lock();
        let next = loop {
            let candidate = list.ready.pop_front()?;
            if candidate.lock().state == ThreadState::Ready {
                break candidate;
            }
        };
        let cpu = self.cpu(&list);
        if let Some(prev) = list.current[cpu].take() {
            let mut prev_t = prev.lock();
            if prev_t.state == ThreadState::Running {
                prev_t.state = ThreadState::Ready;
                drop(prev_t);
                list.ready.push_back(prev);
            }
        }
        next.lock().state = ThreadState::Running;
        list.current[cpu] = Some(next.clone());
        Some(next)
    }

    /// Whether `thread` occupies the current slot of any CPU.
    pub fn is_current(&self, thread: &ThreadRef) -> bool {
        let list = self.list.lock();
        list.current.iter().flatten().any(|t| Arc::ptr_eq(t, thread))
    }

    /// Put a thread that was blocked in a wait back to Running and take it
    /// off the ready queue a wakeup may have put it on. Threads already
    /// terminated are left alone.
    pub fn resume(&self, thread: &ThreadRef) {
        let mut list = self.list.lock();
        {
            let mut t = thread.lock();
            if !t.is_reusable() {
                return;
            }
            t.state = ThreadState::Running;
            t.wait_reason = WaitReason::None;
        }
        list.ready.retain(|r| !Arc::ptr_eq(r, thread));
    }

    pub fn current_thread(&self) -> Option<ThreadRef> {
        let list = self.list.lock();
        list.current[self.cpu(&list)].clone()
    }

    /// Install `thread` as current on this CPU without touching the queue.
    pub fn set_current(&self, thread: Option<ThreadRef>) {
        let mut list = self.list.lock();
        let cpu = self.cpu(&list);
        if let Some(t) = &thread {
            t.lock().state = ThreadState::Running;
            list.ready.retain(|r| !Arc::ptr_eq(r, t));
        }
        list.current[cpu] = thread;
    }

    pub fn find_thread(&self, tid: ThreadId) -> Option<ThreadRef> {
        self.list.lock().find(tid)
    }

    pub fn thread_count(&self) -> usize {
        self.list.lock().threads.len()
    }

    pub fn ready_count(&self) -> usize {
        self.list.lock().ready.len()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Timer interrupt hook.
    pub fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// The thread-list lock, for bulk passes such as process exit.
    pub fn lock(&self) -> MutexGuard<'_, ThreadList> {
        self.list.lock()
    }

    /// Run ready user threads on this CPU forever.
    pub fn run(&self) -> ! {
        loop {
            let Some(thread) = self.schedule() else {
                x86_64::instructions::interrupts::enable_and_hlt();
                continue;
            };
            let (ctx, cr3) = {
                let t = thread.lock();
                (t.context, t.page_table)
            };
            drop(thread);
            unsafe {
                Cr3::write(PhysFrame::containing_address(PhysAddr::new(cr3)), Cr3Flags::empty());
                context::enter_user(&ctx);
            }
        }
    }
}
