use alloc::vec::Vec;
use bitflags::bitflags;

use crate::config::DEFAULT_UMASK;

/// Process identifier. Always positive for a live process.
pub type Pid = i64;

/// POSIX credentials plus the file-creation mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub ruid: u32,
    pub euid: u32,
    pub suid: u32,
    pub rgid: u32,
    pub egid: u32,
    pub sgid: u32,
    pub umask: u32,
}

impl Credentials {
    pub fn root() -> Self {
        Credentials {
            ruid: 0,
            euid: 0,
            suid: 0,
            rgid: 0,
            egid: 0,
            sgid: 0,
            umask: DEFAULT_UMASK,
        }
    }
}

/// CPU accounting in microseconds plus the tick the process started at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Times {
    pub user_usec: u64,
    pub sys_usec: u64,
    pub start_tick: u64,
}

/// Bounded NUL-separated string list (`/proc/<pid>/cmdline` style).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgBlob {
    data: Vec<u8>,
    cap: usize,
}

impl ArgBlob {
    pub fn new(cap: usize) -> Self {
        ArgBlob { data: Vec::new(), cap }
    }

    /// Whole strings only: the first string that would overflow `cap`
    /// and everything after it is dropped.
    pub fn from_strings(strings: &[&[u8]], cap: usize) -> Self {
        let mut data = Vec::new();
        for s in strings {
            if data.len() + s.len() + 1 > cap {
                break;
            }
            data.extend_from_slice(s);
            data.push(0);
        }
        ArgBlob { data, cap }
    }

    /// Byte copy cut at `cap`.
    pub fn copy_truncated(&self, cap: usize) -> Self {
        let len = self.data.len().min(cap);
        ArgBlob { data: self.data[..len].to_vec(), cap }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn entries(&self) -> impl Iterator<Item = &[u8]> {
        self.data.split(|&b| b == 0).filter(|s| !s.is_empty())
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// Resource usage reported to a reaping parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rusage {
    pub utime_usec: u64,
    pub stime_usec: u64,
    /// Kilobytes.
    pub maxrss: u64,
    pub minflt: u64,
    pub majflt: u64,
    pub nvcsw: u64,
    pub nivcsw: u64,
}

impl Rusage {
    pub const WORDS: usize = 18;

    /// Linux `struct rusage` as 18 machine words.
    pub fn to_words(&self) -> [u64; Self::WORDS] {
        let mut w = [0u64; Self::WORDS];
        w[0] = self.utime_usec / 1_000_000;
        w[1] = self.utime_usec % 1_000_000;
        w[2] = self.stime_usec / 1_000_000;
        w[3] = self.stime_usec % 1_000_000;
        w[4] = self.maxrss;
        w[8] = self.minflt;
        w[9] = self.majflt;
        w[16] = self.nvcsw;
        w[17] = self.nivcsw;
        w
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitOptions: u32 {
        const WNOHANG = 1;
        const WUNTRACED = 2;
        const WCONTINUED = 8;
    }
}

/// A child collected by `wait4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub pid: Pid,
    pub exit_code: i32,
    pub usage: Rusage,
}

impl Reaped {
    /// `wait4` status word for a normal exit.
    pub fn status_word(&self) -> i32 {
        (self.exit_code & 0xFF) << 8
    }
}
