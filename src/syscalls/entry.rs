//! `int 0x80` entry from ring 3.

use core::arch::naked_asm;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::{PrivilegeLevel, VirtAddr};

use crate::process::ProcessManager;
use crate::scheduler::{ThreadState, UserContext};

/// Vector user code traps through.
pub const SYSCALL_VECTOR: usize = 0x80;

/// Registers as laid out on the kernel stack by [`syscall_entry`]: the pushed
/// general-purpose registers followed by the CPU's interrupt frame.
pub type TrapFrame = UserContext;

/// What the trampoline does after a syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Return to the (possibly retargeted) user context in the frame.
    User,
    /// The calling thread is gone or blocked; pick another one.
    Reschedule,
}

/// Save the caller's context, dispatch the call and load the context to
/// resume with back into `frame`.
pub fn service(k: &ProcessManager, frame: &mut TrapFrame) -> Resume {
    let thread = k.scheduler().current_thread();
    if let Some(t) = &thread {
        t.lock().context = *frame;
    }

    let result = super::dispatch(frame.rax, frame.rdi, frame.rsi, frame.rdx, frame.r10, frame.r8, frame.r9);

    let Some(thread) = thread else {
        frame.rax = result as u64;
        return Resume::User;
    };
    let mut t = thread.lock();
    if !t.is_reusable() || t.state == ThreadState::Blocked {
        t.context.rax = result as u64;
        return Resume::Reschedule;
    }
    t.context.rax = result as u64;
    *frame = t.context;
    Resume::User
}

extern "C" fn handle_trap(frame: *mut TrapFrame) {
    let frame = unsafe { &mut *frame };
    let Some(k) = super::kernel() else {
        frame.rax = (-crate::error::ENOSYS) as u64;
        return;
    };
    if service(k, frame) == Resume::Reschedule {
        k.scheduler().run();
    }
}

/// Trap trampoline. Builds a [`TrapFrame`] on the kernel stack, hands its
/// address to `handle_trap` and returns with every register taken from the
/// frame.
#[unsafe(naked)]
pub unsafe extern "C" fn syscall_entry() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // 15 pushes + 5-word CPU frame keep rsp 16-byte aligned
        "mov rdi, rsp",
        "cld",
        "call {handle}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handle = sym handle_trap,
    );
}

/// Route [`SYSCALL_VECTOR`] to the trampoline, callable from ring 3.
pub fn install(idt: &mut InterruptDescriptorTable) {
    let addr = VirtAddr::new(syscall_entry as unsafe extern "C" fn() as usize as u64);
    unsafe {
        idt[SYSCALL_VECTOR]
            .set_handler_addr(addr)
            .set_privilege_level(PrivilegeLevel::Ring3);
    }
}
