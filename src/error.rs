use core::fmt;

use crate::fs::error::FsError;
use crate::loader::ExecError;

/// Failure taxonomy of the process core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    InvalidArgument,
    TableFull,
    PidSpaceExhausted,
    OutOfMemory,
    NotFound,
    NoEntry,
    NotADirectory,
    NoChild,
    StateConflict,
    AbiViolation,
    BadDescriptor,
    DescriptorsExhausted,
    NotPermitted,
    BadAddress,
    NoExec,
    Interrupted,
}

pub type ProcResult<T> = Result<T, ProcError>;

pub const EPERM: i64 = 1;
pub const ENOENT: i64 = 2;
pub const ESRCH: i64 = 3;
pub const EINTR: i64 = 4;
pub const ENOEXEC: i64 = 8;
pub const EBADF: i64 = 9;
pub const ECHILD: i64 = 10;
pub const EAGAIN: i64 = 11;
pub const ENOMEM: i64 = 12;
pub const EFAULT: i64 = 14;
pub const EBUSY: i64 = 16;
pub const ENOTDIR: i64 = 20;
pub const EINVAL: i64 = 22;
pub const EMFILE: i64 = 24;
pub const ENOSYS: i64 = 38;

impl ProcError {
    /// Negative errno returned to user mode.
    pub fn errno(self) -> i64 {
        -match self {
            ProcError::InvalidArgument => EINVAL,
            ProcError::TableFull => EAGAIN,
            ProcError::PidSpaceExhausted => EAGAIN,
            ProcError::OutOfMemory => ENOMEM,
            ProcError::NotFound => ESRCH,
            ProcError::NoEntry => ENOENT,
            ProcError::NotADirectory => ENOTDIR,
            ProcError::NoChild => ECHILD,
            ProcError::StateConflict => EBUSY,
            ProcError::AbiViolation => EFAULT,
            ProcError::BadDescriptor => EBADF,
            ProcError::DescriptorsExhausted => EMFILE,
            ProcError::NotPermitted => EPERM,
            ProcError::BadAddress => EFAULT,
            ProcError::NoExec => ENOEXEC,
            ProcError::Interrupted => EINTR,
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcError::InvalidArgument   => write!(f, "Invalid argument"),
            ProcError::TableFull         => write!(f, "Process table full"),
            ProcError::PidSpaceExhausted => write!(f, "No free PID"),
            ProcError::OutOfMemory       => write!(f, "Out of memory"),
            ProcError::NotFound          => write!(f, "No such process"),
            ProcError::NoEntry           => write!(f, "No such file or directory"),
            ProcError::NotADirectory     => write!(f, "Not a directory"),
            ProcError::NoChild           => write!(f, "No matching child"),
            ProcError::StateConflict     => write!(f, "Operation not allowed in current state"),
            ProcError::AbiViolation      => write!(f, "Stack ABI invariant violated"),
            ProcError::BadDescriptor     => write!(f, "Bad file descriptor"),
            ProcError::DescriptorsExhausted => write!(f, "Too many open files"),
            ProcError::NotPermitted      => write!(f, "Operation not permitted"),
            ProcError::BadAddress        => write!(f, "Bad address"),
            ProcError::NoExec            => write!(f, "Exec format error"),
            ProcError::Interrupted       => write!(f, "Interrupted"),
        }
    }
}

impl From<FsError> for ProcError {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound | FsError::NotMounted => ProcError::NoEntry,
            FsError::NotADirectory => ProcError::NotADirectory,
            FsError::NoSpace => ProcError::OutOfMemory,
            FsError::BadDescriptor | FsError::PermissionDenied => ProcError::BadDescriptor,
            FsError::TableFull => ProcError::DescriptorsExhausted,
            _ => ProcError::InvalidArgument,
        }
    }
}

impl From<ExecError> for ProcError {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::FileNotFound => ProcError::NoEntry,
            ExecError::MemoryError => ProcError::OutOfMemory,
            ExecError::StackAbi => ProcError::AbiViolation,
            ExecError::InvalidSpace => ProcError::StateConflict,
            ExecError::InvalidFormat
            | ExecError::UnsupportedArch
            | ExecError::UnsupportedType
            | ExecError::NoLoader
            | ExecError::ReadError => ProcError::NoExec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative_and_distinct_for_core_failures() {
        assert_eq!(ProcError::NoChild.errno(), -ECHILD);
        assert_eq!(ProcError::NotFound.errno(), -ESRCH);
        assert_eq!(ProcError::NoExec.errno(), -ENOEXEC);
        assert!(ProcError::AbiViolation.errno() < 0);
    }

    #[test]
    fn exec_errors_collapse_into_proc_errors() {
        assert_eq!(ProcError::from(ExecError::NoLoader), ProcError::NoExec);
        assert_eq!(ProcError::from(ExecError::StackAbi), ProcError::AbiViolation);
        assert_eq!(ProcError::from(FsError::NotFound), ProcError::NoEntry);
        assert_eq!(ProcError::NoEntry.errno(), -ENOENT);
    }
}
