//! System call table, dispatcher and the global kernel handle handlers use.

pub mod entry;
pub mod handlers;

use alloc::sync::Arc;
use lazy_static::lazy_static;
use spin::{Mutex, Once};

use crate::error::{ProcError, ProcResult, ENOSYS};
use crate::process::ProcessManager;

/// Six-argument handler in the raw register convention.
pub type SyscallFn = fn(u64, u64, u64, u64, u64, u64) -> i64;

pub const SYSCALL_SLOTS: usize = 512;

#[derive(Clone, Copy)]
pub struct SyscallEntry {
    pub handler: SyscallFn,
    pub name: &'static str,
}

/// Fixed-size table indexed by syscall number.
pub struct SyscallTable {
    slots: [Option<SyscallEntry>; SYSCALL_SLOTS],
}

impl SyscallTable {
    pub const fn new() -> Self {
        SyscallTable { slots: [None; SYSCALL_SLOTS] }
    }

    pub fn register(&mut self, nr: usize, name: &'static str, handler: SyscallFn) -> ProcResult<()> {
        let slot = self.slots.get_mut(nr).ok_or(ProcError::InvalidArgument)?;
        if let Some(old) = slot {
            crate::log_warn!("syscall: {} replaces {} at {}", name, old.name, nr);
        }
        *slot = Some(SyscallEntry { handler, name });
        Ok(())
    }

    pub fn get(&self, nr: u64) -> Option<SyscallEntry> {
        let idx = usize::try_from(nr).ok()?;
        *self.slots.get(idx)?
    }

    pub fn name(&self, nr: usize) -> Option<&'static str> {
        self.get(nr as u64).map(|e| e.name)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispatch(&self, nr: u64, args: [u64; 6]) -> i64 {
        match self.get(nr) {
            Some(entry) => (entry.handler)(args[0], args[1], args[2], args[3], args[4], args[5]),
            None => {
                crate::log_warn!("syscall: unknown number {}", nr);
                -ENOSYS
            }
        }
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref SYSCALLS: Mutex<SyscallTable> = {
        let mut table = SyscallTable::new();
        handlers::register_all(&mut table);
        Mutex::new(table)
    };
}

static KERNEL: Once<Arc<ProcessManager>> = Once::new();

/// Publish the process manager the handlers run against. Later calls keep
/// the first manager.
pub fn init(manager: Arc<ProcessManager>) -> &'static Arc<ProcessManager> {
    let kernel = KERNEL.call_once(|| manager);
    crate::log_info!("syscall: {} handlers registered", SYSCALLS.lock().len());
    kernel
}

pub fn kernel() -> Option<&'static Arc<ProcessManager>> {
    KERNEL.get()
}

/// Install an extra handler in the global table.
pub fn register(nr: usize, name: &'static str, handler: SyscallFn) -> ProcResult<()> {
    SYSCALLS.lock().register(nr, name, handler)
}

/// Look up `nr` and run its handler; the table lock is not held while the
/// handler runs.
pub fn dispatch(nr: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
    let entry = SYSCALLS.lock().get(nr);
    match entry {
        Some(entry) => {
            crate::log_debug!("syscall: {} ({})", entry.name, nr);
            (entry.handler)(a1, a2, a3, a4, a5, a6)
        }
        None => {
            crate::log_warn!("syscall: unknown number {}", nr);
            -ENOSYS
        }
    }
}
