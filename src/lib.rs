#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod serial;
pub mod config;
pub mod error;
pub mod memory;
pub mod fs;
pub mod loader;
pub mod scheduler;
pub mod process;
pub mod syscalls;

#[cfg(test)]
mod testing;

use alloc::sync::Arc;
use x86_64::structures::idt::InterruptDescriptorTable;

use crate::process::ProcessManager;

/// Bring up logging, publish `manager` to the syscall layer and route the
/// syscall vector in `idt`. The caller loads the IDT afterwards.
pub fn init(manager: Arc<ProcessManager>, idt: &mut InterruptDescriptorTable) -> &'static Arc<ProcessManager> {
    serial::init();
    let kernel = syscalls::init(manager);
    syscalls::entry::install(idt);
    log_info!("atomic_proc: process core up, max {} processes", kernel.config().max_procs);
    kernel
}
