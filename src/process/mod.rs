//! Process records and the manager that owns them.
//!
//! Lock order: process table, then a process (`inner`, then `fds`), then the
//! scheduler's thread list, then individual threads. The pending-signal word
//! is atomic so exit can post `SIGCHLD` to a parent while holding only the
//! thread-list lock.

pub mod lifecycle;
pub mod ops;
pub mod signal;
pub mod table;
pub mod types;

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, MutexGuard};
use x86_64::PhysAddr;

use crate::config::{ProcConfig, CMDLINE_CAP, ENVIRON_CAP};
use crate::fs::{FdTable, Vfs};
use crate::loader::LoaderRegistry;
use crate::memory::{AddressSpace, PhysMemory};
use crate::scheduler::{ThreadManager, ThreadRef};

pub use table::{PidAllocator, ProcessTable};
pub use types::{ArgBlob, Credentials, Pid, Reaped, Rusage, Times, WaitOptions};

/// Fields guarded by the per-process lock.
pub struct ProcessInner {
    pub ppid: Pid,
    pub pgrp: Pid,
    pub sid: Pid,
    pub tty_fd: Option<usize>,
    pub tty_name: Option<String>,
    pub space: Option<AddressSpace>,
    pub main_thread: Option<ThreadRef>,
    pub cred: Credentials,
    pub cwd: String,
    pub root: String,
    pub zombie: bool,
    pub exit_code: i32,
    pub sig_mask: u64,
    pub times: Times,
    pub comm: String,
    pub cmdline: ArgBlob,
    pub environ: ArgBlob,
}

impl ProcessInner {
    fn new(pid: Pid, ppid: Pid, space: AddressSpace, start_tick: u64) -> Self {
        ProcessInner {
            ppid,
            pgrp: pid,
            sid: pid,
            tty_fd: None,
            tty_name: None,
            space: Some(space),
            main_thread: None,
            cred: Credentials::root(),
            cwd: String::from("/"),
            root: String::from("/"),
            zombie: false,
            exit_code: 0,
            sig_mask: 0,
            times: Times { start_tick, ..Times::default() },
            comm: String::new(),
            cmdline: ArgBlob::new(CMDLINE_CAP),
            environ: ArgBlob::new(ENVIRON_CAP),
        }
    }
}

pub struct Process {
    pid: Pid,
    pending: AtomicU64,
    inner: Mutex<ProcessInner>,
    fds: Mutex<FdTable>,
}

pub type ProcessRef = Arc<Process>;

impl Process {
    fn new(pid: Pid, inner: ProcessInner, fds: FdTable) -> Self {
        Process {
            pid,
            pending: AtomicU64::new(0),
            inner: Mutex::new(inner),
            fds: Mutex::new(fds),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    pub fn fds(&self) -> MutexGuard<'_, FdTable> {
        self.fds.lock()
    }

    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn main_thread(&self) -> Option<ThreadRef> {
        self.inner.lock().main_thread.clone()
    }

    pub fn is_zombie(&self) -> bool {
        self.inner.lock().zombie
    }

    pub fn exit_code(&self) -> i32 {
        self.inner.lock().exit_code
    }
}

/// Notified when processes enter and leave the table (a `/proc` view).
pub trait ProcObserver: Send + Sync {
    fn process_added(&self, pid: Pid);
    fn process_removed(&self, pid: Pid);
}

/// Owner of the process table and every lifecycle operation.
pub struct ProcessManager {
    config: ProcConfig,
    table: Mutex<ProcessTable>,
    pids: Mutex<PidAllocator>,
    memory: Arc<dyn PhysMemory>,
    vfs: Arc<dyn Vfs>,
    loaders: LoaderRegistry,
    sched: Arc<ThreadManager>,
    observer: Option<Arc<dyn ProcObserver>>,
    kernel_root: Option<PhysAddr>,
}

impl ProcessManager {
    pub fn new(
        config: ProcConfig,
        memory: Arc<dyn PhysMemory>,
        vfs: Arc<dyn Vfs>,
        sched: Arc<ThreadManager>,
    ) -> Self {
        ProcessManager {
            table: Mutex::new(ProcessTable::new(config.max_procs)),
            pids: Mutex::new(PidAllocator::new(config.pid_max)),
            config,
            memory,
            vfs,
            loaders: LoaderRegistry::with_defaults(),
            sched,
            observer: None,
            kernel_root: None,
        }
    }

    pub fn with_loaders(mut self, loaders: LoaderRegistry) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProcObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// P4 table whose upper half every new address space shares.
    pub fn with_kernel_root(mut self, root: PhysAddr) -> Self {
        self.kernel_root = Some(root);
        self
    }

    pub fn config(&self) -> &ProcConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<ThreadManager> {
        &self.sched
    }

    pub fn vfs(&self) -> &Arc<dyn Vfs> {
        &self.vfs
    }

    pub fn find(&self, pid: Pid) -> Option<ProcessRef> {
        self.table.lock().find(pid)
    }

    /// Process owning the thread current on this CPU.
    pub fn current(&self) -> Option<ProcessRef> {
        let thread = self.sched.current_thread()?;
        let pid = thread.lock().process?;
        self.find(pid)
    }

    pub fn process_count(&self) -> usize {
        self.table.lock().len()
    }

    /// PIDs in table order.
    pub fn pids(&self) -> alloc::vec::Vec<Pid> {
        self.table.lock().iter().map(|p| p.pid()).collect()
    }

    fn notify_added(&self, pid: Pid) {
        if let Some(observer) = &self.observer {
            observer.process_added(pid);
        }
    }

    fn notify_removed(&self, pid: Pid) {
        if let Some(observer) = &self.observer {
            observer.process_removed(pid);
        }
    }
}
