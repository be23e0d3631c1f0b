//! Kernel tunables for the process core.
//!
//! The limits here are part of the user-visible contract (argv caps, blob
//! sizes, address layout); change them together with userland.

use crate::process::Pid;

/// Capacity of the global process table.
pub const MAX_PROCS: usize = 32768;

/// Descriptor slots per process.
pub const MAX_FDS_DEFAULT: usize = 256;

/// Longest cwd/root path kept per process, NUL excluded.
pub const MAX_PATH_LEN: usize = 255;

/// Command name length (Linux `TASK_COMM_LEN` minus the terminator).
pub const COMM_LEN: usize = 15;

/// NUL-separated argument blob exposed as `/proc/<pid>/cmdline`.
pub const CMDLINE_CAP: usize = 4096;

/// NUL-separated environment blob exposed as `/proc/<pid>/environ`.
pub const ENVIRON_CAP: usize = 8192;

/// Maximum argv entries and envp entries copied onto a new stack.
pub const MAX_ARGS: usize = 128;

pub const DEFAULT_UMASK: u32 = 0o022;

/// Lowest user-mode address a saved RIP/RSP may hold.
pub const USER_VA_BASE: u64 = 0x0000_0000_0000_1000;

/// First address past the lower canonical half.
pub const USER_VA_END: u64 = 0x0000_8000_0000_0000;

/// Device opened for stdio when a terminal exists.
pub const TTY_PATH: &str = "/dev/tty0";
pub const TTY_NAME: &str = "tty0";
pub const NULL_PATH: &str = "/dev/null";

/// Ticks are accounted as milliseconds.
pub const USEC_PER_TICK: u64 = 1000;

/// Reported max RSS until real accounting exists.
pub const RUSAGE_MAX_RSS: u64 = 64 * 1024 * 1024;

pub fn is_user_va(va: u64) -> bool {
    (USER_VA_BASE..USER_VA_END).contains(&va)
}

/// Per-instance settings for a [`ProcessManager`](crate::process::ProcessManager).
#[derive(Debug, Clone, Copy)]
pub struct ProcConfig {
    pub max_procs: usize,
    pub max_fds: usize,
    /// Largest PID handed out before allocation wraps back to 1.
    pub pid_max: Pid,
    /// Map the initial stack and argument area non-executable.
    pub nx_stack: bool,
}

impl Default for ProcConfig {
    fn default() -> Self {
        ProcConfig {
            max_procs: MAX_PROCS,
            max_fds: MAX_FDS_DEFAULT,
            pid_max: i32::MAX as Pid,
            nx_stack: true,
        }
    }
}
