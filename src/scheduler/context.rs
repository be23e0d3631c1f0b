use core::arch::naked_asm;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

// GDT layout: null, kernel code, kernel data, user data, user code, TSS.
pub const USER_DATA_SELECTOR: SegmentSelector = SegmentSelector::new(3, PrivilegeLevel::Ring3);
pub const USER_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(4, PrivilegeLevel::Ring3);

/// RFLAGS for fresh user threads: IF set, reserved bit 1 set.
pub const USER_RFLAGS: u64 = 0x202;

/// Full user-mode register state, in the exact order the syscall
/// trampoline pushes it. The last five fields are the CPU's interrupt frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct UserContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl UserContext {
    /// Context that starts executing at `entry` with `rsp = stack`.
    pub fn new_user(entry: u64, stack: u64) -> Self {
        let mut ctx = UserContext {
            rip: entry,
            rsp: stack,
            ..Default::default()
        };
        ctx.set_user_segments();
        ctx
    }

    pub fn set_user_segments(&mut self) {
        self.cs = USER_CODE_SELECTOR.0 as u64;
        self.ss = USER_DATA_SELECTOR.0 as u64;
        self.rflags = USER_RFLAGS;
    }
}

/// Load every register from `ctx` and `iretq` into ring 3.
///
/// # Safety
/// `ctx` must describe a valid user context and the active page tables
/// must map its RIP and RSP.
#[unsafe(naked)]
pub unsafe extern "C" fn enter_user(ctx: *const UserContext) -> ! {
    naked_asm!(
        // rdi = ctx; the struct is laid out exactly like a trap frame
        "mov rsp, rdi",
        "mov ax, 0x1B",
        "mov ds, ax",
        "mov es, ax",
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
    );
}
