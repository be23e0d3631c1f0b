//! System call implementations.
//!
//! Each `sys_*` function works on an explicit manager and calling process so
//! it can be driven directly; the `syscall!` wrappers bind them to the
//! current process for the raw six-register table.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{SyscallFn, SyscallTable};
use crate::config::{is_user_va, MAX_ARGS, MAX_PATH_LEN};
use crate::error::{ProcError, ProcResult};
use crate::fs::OpenFlags;
use crate::memory::{AddressSpace, PAGE_SIZE};
use crate::process::signal::{SigAction, SIG_MAX};
use crate::process::{Process, ProcessManager, ProcessRef, Rusage, WaitOptions};
use crate::scheduler::ThreadId;

pub const SYS_READ: usize = 0;
pub const SYS_WRITE: usize = 1;
pub const SYS_OPEN: usize = 2;
pub const SYS_CLOSE: usize = 3;
pub const SYS_RT_SIGACTION: usize = 13;
pub const SYS_RT_SIGPROCMASK: usize = 14;
pub const SYS_SCHED_YIELD: usize = 24;
pub const SYS_DUP: usize = 32;
pub const SYS_DUP2: usize = 33;
pub const SYS_GETPID: usize = 39;
pub const SYS_FORK: usize = 57;
pub const SYS_EXECVE: usize = 59;
pub const SYS_EXIT: usize = 60;
pub const SYS_WAIT4: usize = 61;
pub const SYS_KILL: usize = 62;
pub const SYS_GETCWD: usize = 79;
pub const SYS_CHDIR: usize = 80;
pub const SYS_FCHDIR: usize = 81;
pub const SYS_UMASK: usize = 95;
pub const SYS_SETPGID: usize = 109;
pub const SYS_GETPPID: usize = 110;
pub const SYS_GETPGRP: usize = 111;
pub const SYS_SETSID: usize = 112;
pub const SYS_GETSID: usize = 124;
pub const SYS_RT_SIGPENDING: usize = 127;
pub const SYS_RT_SIGQUEUEINFO: usize = 129;
pub const SYS_RT_SIGSUSPEND: usize = 130;
pub const SYS_GETTID: usize = 186;
pub const SYS_TKILL: usize = 200;
pub const SYS_EXIT_GROUP: usize = 231;

/// Largest transfer a single read or write performs.
const IO_MAX: usize = 64 * 1024;

/// Linux `struct sigaction`: handler, flags, restorer, mask.
const SIGACTION_SIZE: usize = 32;

pub type Args = [u64; 6];
type Typed = fn(&ProcessManager, &ProcessRef, &Args) -> ProcResult<i64>;

fn invoke(f: Typed, args: Args) -> i64 {
    let Some(k) = super::kernel() else {
        return -crate::error::ENOSYS;
    };
    let Some(caller) = k.current() else {
        return ProcError::NotFound.errno();
    };
    match f(k, &caller, &args) {
        Ok(value) => value,
        Err(err) => err.errno(),
    }
}

macro_rules! syscall {
    ($raw:ident => $typed:path) => {
        fn $raw(a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> i64 {
            invoke($typed, [a1, a2, a3, a4, a5, a6])
        }
    };
}

// ── user memory ──

fn check_user(va: u64, len: usize) -> ProcResult<()> {
    if len == 0 {
        return Ok(());
    }
    let last = va.checked_add(len as u64 - 1).ok_or(ProcError::BadAddress)?;
    if !is_user_va(va) || !is_user_va(last) {
        return Err(ProcError::BadAddress);
    }
    Ok(())
}

fn with_space<T>(p: &Process, f: impl FnOnce(&AddressSpace) -> ProcResult<T>) -> ProcResult<T> {
    let inner = p.lock();
    let space = inner.space.as_ref().ok_or(ProcError::BadAddress)?;
    f(space)
}

fn copy_in(p: &Process, va: u64, len: usize) -> ProcResult<Vec<u8>> {
    check_user(va, len)?;
    let mut buf = vec![0u8; len];
    with_space(p, |s| s.read_bytes(va, &mut buf))?;
    Ok(buf)
}

fn copy_out(p: &Process, va: u64, data: &[u8]) -> ProcResult<()> {
    check_user(va, data.len())?;
    with_space(p, |s| s.write_bytes(va, data))
}

fn read_word(p: &Process, va: u64) -> ProcResult<u64> {
    check_user(va, 8)?;
    with_space(p, |s| s.read_u64(va))
}

fn write_word(p: &Process, va: u64, value: u64) -> ProcResult<()> {
    copy_out(p, va, &value.to_le_bytes())
}

fn read_string(p: &Process, va: u64, max: usize) -> ProcResult<Vec<u8>> {
    check_user(va, 1)?;
    with_space(p, |s| s.read_cstr(va, max))
}

fn read_path(p: &Process, va: u64) -> ProcResult<String> {
    let raw = read_string(p, va, MAX_PATH_LEN)?;
    String::from_utf8(raw).map_err(|_| ProcError::InvalidArgument)
}

/// NULL-terminated pointer array of strings; stops after `MAX_ARGS`.
fn read_string_array(p: &Process, va: u64) -> ProcResult<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    if va == 0 {
        return Ok(out);
    }
    for i in 0..MAX_ARGS as u64 {
        let ptr = read_word(p, va + i * 8)?;
        if ptr == 0 {
            break;
        }
        out.push(read_string(p, ptr, PAGE_SIZE as usize)?);
    }
    Ok(out)
}

fn fd_arg(raw: u64) -> ProcResult<usize> {
    usize::try_from(raw as i64).map_err(|_| ProcError::BadDescriptor)
}

fn signal_arg(raw: u64) -> ProcResult<u32> {
    match u32::try_from(raw) {
        Ok(sig) if sig <= SIG_MAX => Ok(sig),
        _ => Err(ProcError::InvalidArgument),
    }
}

// ── descriptors ──

pub fn sys_read(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let len = (a[2] as usize).min(IO_MAX);
    check_user(a[1], len)?;
    let mut buf = vec![0u8; len];
    let n = k.read(p, fd_arg(a[0])?, &mut buf)?;
    copy_out(p, a[1], &buf[..n])?;
    Ok(n as i64)
}

pub fn sys_write(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let len = (a[2] as usize).min(IO_MAX);
    let data = copy_in(p, a[1], len)?;
    Ok(k.write(p, fd_arg(a[0])?, &data)? as i64)
}

pub fn sys_open(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let path = read_path(p, a[0])?;
    let flags = OpenFlags::from_bits_truncate(a[1] as u32);
    Ok(k.open(p, &path, flags)? as i64)
}

pub fn sys_close(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.close(p, fd_arg(a[0])?)?;
    Ok(0)
}

pub fn sys_dup(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    Ok(k.dup(p, fd_arg(a[0])?)? as i64)
}

pub fn sys_dup2(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    Ok(k.dup2(p, fd_arg(a[0])?, fd_arg(a[1])?)? as i64)
}

// ── processes ──

pub fn sys_getpid(_k: &ProcessManager, p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    Ok(p.pid())
}

pub fn sys_gettid(k: &ProcessManager, _p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    let thread = k.scheduler().current_thread().ok_or(ProcError::NotFound)?;
    let id = thread.lock().id;
    Ok(id.0 as i64)
}

pub fn sys_getppid(_k: &ProcessManager, p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    Ok(p.ppid())
}

pub fn sys_getpgrp(_k: &ProcessManager, p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    Ok(p.pgrp())
}

pub fn sys_getsid(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let pid = a[0] as i64;
    if pid == 0 {
        return Ok(p.sid());
    }
    Ok(k.find(pid).ok_or(ProcError::NotFound)?.sid())
}

pub fn sys_setsid(_k: &ProcessManager, p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    Ok(p.setsid())
}

pub fn sys_setpgid(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.setpgid(p, a[0] as i64, a[1] as i64)?;
    Ok(0)
}

pub fn sys_sched_yield(k: &ProcessManager, _p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    k.scheduler().yield_now();
    Ok(0)
}

pub fn sys_fork(k: &ProcessManager, p: &ProcessRef, _a: &Args) -> ProcResult<i64> {
    k.fork(p)
}

pub fn sys_execve(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let path = read_path(p, a[0])?;
    let argv = read_string_array(p, a[1])?;
    let envp = read_string_array(p, a[2])?;
    let argv: Vec<&[u8]> = argv.iter().map(|s| s.as_slice()).collect();
    let envp: Vec<&[u8]> = envp.iter().map(|s| s.as_slice()).collect();
    k.execve(p, &path, &argv, &envp)?;
    Ok(0)
}

pub fn sys_exit(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.exit(p, a[0] as i32)?;
    Ok(0)
}

pub fn sys_wait4(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let options = WaitOptions::from_bits_truncate(a[2] as u32);
    let Some(reaped) = k.wait4(p, a[0] as i64, options)? else {
        return Ok(0);
    };
    if a[1] != 0 {
        copy_out(p, a[1], &reaped.status_word().to_le_bytes())?;
    }
    if a[3] != 0 {
        let words = reaped.usage.to_words();
        let mut raw = Vec::with_capacity(Rusage::WORDS * 8);
        for w in words {
            raw.extend_from_slice(&w.to_le_bytes());
        }
        copy_out(p, a[3], &raw)?;
    }
    Ok(reaped.pid)
}

pub fn sys_getcwd(_k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let mut cwd = p.cwd().into_bytes();
    cwd.push(0);
    if (a[1] as usize) < cwd.len() {
        return Err(ProcError::InvalidArgument);
    }
    copy_out(p, a[0], &cwd)?;
    Ok(cwd.len() as i64)
}

pub fn sys_chdir(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let path = read_path(p, a[0])?;
    k.chdir(p, &path)?;
    Ok(0)
}

pub fn sys_fchdir(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.fchdir(p, fd_arg(a[0])?)?;
    Ok(0)
}

pub fn sys_umask(_k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    Ok(p.umask(a[0] as u32) as i64)
}

// ── signals ──

pub fn sys_kill(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let pid = a[0] as i64;
    let sig = signal_arg(a[1])?;
    match pid {
        0 => k.kill_group(p.pgrp(), sig)?,
        -1 => {
            for target in k.pids() {
                if target != 1 && target != p.pid() {
                    k.kill(target, sig)?;
                }
            }
        }
        pid if pid < 0 => k.kill_group(-pid, sig)?,
        pid => k.kill(pid, sig)?,
    }
    Ok(0)
}

pub fn sys_tkill(k: &ProcessManager, _p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.tkill(ThreadId(a[0]), signal_arg(a[1])?)?;
    Ok(0)
}

pub fn sys_rt_sigqueueinfo(k: &ProcessManager, _p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    k.sigqueue(a[0] as i64, signal_arg(a[1])?)?;
    Ok(0)
}

pub fn sys_rt_sigaction(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let sig = signal_arg(a[0])?;
    let new = if a[1] != 0 {
        let raw = copy_in(p, a[1], SIGACTION_SIZE)?;
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&raw[i * 8..i * 8 + 8]);
            u64::from_le_bytes(w)
        };
        Some(SigAction { handler: word(0), mask: word(3) })
    } else {
        None
    };
    let old = k.sigaction(p, sig, new)?;
    if a[2] != 0 {
        let mut raw = [0u8; SIGACTION_SIZE];
        raw[..8].copy_from_slice(&old.handler.to_le_bytes());
        raw[24..].copy_from_slice(&old.mask.to_le_bytes());
        copy_out(p, a[2], &raw)?;
    }
    Ok(0)
}

pub fn sys_rt_sigprocmask(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let set = if a[1] != 0 { Some(read_word(p, a[1])?) } else { None };
    let old = k.sigprocmask(p, a[0] as u32, set)?;
    if a[2] != 0 {
        write_word(p, a[2], old)?;
    }
    Ok(0)
}

pub fn sys_rt_sigpending(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    write_word(p, a[0], k.sigpending(p))?;
    Ok(0)
}

pub fn sys_rt_sigsuspend(k: &ProcessManager, p: &ProcessRef, a: &Args) -> ProcResult<i64> {
    let mask = read_word(p, a[0])?;
    Err(k.sigsuspend(p, mask))
}

syscall!(raw_read => sys_read);
syscall!(raw_write => sys_write);
syscall!(raw_open => sys_open);
syscall!(raw_close => sys_close);
syscall!(raw_rt_sigaction => sys_rt_sigaction);
syscall!(raw_rt_sigprocmask => sys_rt_sigprocmask);
syscall!(raw_sched_yield => sys_sched_yield);
syscall!(raw_dup => sys_dup);
syscall!(raw_dup2 => sys_dup2);
syscall!(raw_getpid => sys_getpid);
syscall!(raw_fork => sys_fork);
syscall!(raw_execve => sys_execve);
syscall!(raw_exit => sys_exit);
syscall!(raw_wait4 => sys_wait4);
syscall!(raw_kill => sys_kill);
syscall!(raw_getcwd => sys_getcwd);
syscall!(raw_chdir => sys_chdir);
syscall!(raw_fchdir => sys_fchdir);
syscall!(raw_umask => sys_umask);
syscall!(raw_setpgid => sys_setpgid);
syscall!(raw_getppid => sys_getppid);
syscall!(raw_getpgrp => sys_getpgrp);
syscall!(raw_setsid => sys_setsid);
syscall!(raw_getsid => sys_getsid);
syscall!(raw_rt_sigpending => sys_rt_sigpending);
syscall!(raw_rt_sigqueueinfo => sys_rt_sigqueueinfo);
syscall!(raw_rt_sigsuspend => sys_rt_sigsuspend);
syscall!(raw_gettid => sys_gettid);
syscall!(raw_tkill => sys_tkill);

/// Every syscall this kernel implements.
pub const SYSCALLS: &[(usize, &str, SyscallFn)] = &[
    (SYS_READ, "read", raw_read),
    (SYS_WRITE, "write", raw_write),
    (SYS_OPEN, "open", raw_open),
    (SYS_CLOSE, "close", raw_close),
    (SYS_RT_SIGACTION, "rt_sigaction", raw_rt_sigaction),
    (SYS_RT_SIGPROCMASK, "rt_sigprocmask", raw_rt_sigprocmask),
    (SYS_SCHED_YIELD, "sched_yield", raw_sched_yield),
    (SYS_DUP, "dup", raw_dup),
    (SYS_DUP2, "dup2", raw_dup2),
    (SYS_GETPID, "getpid", raw_getpid),
    (SYS_FORK, "fork", raw_fork),
    (SYS_EXECVE, "execve", raw_execve),
    (SYS_EXIT, "exit", raw_exit),
    (SYS_WAIT4, "wait4", raw_wait4),
    (SYS_KILL, "kill", raw_kill),
    (SYS_GETCWD, "getcwd", raw_getcwd),
    (SYS_CHDIR, "chdir", raw_chdir),
    (SYS_FCHDIR, "fchdir", raw_fchdir),
    (SYS_UMASK, "umask", raw_umask),
    (SYS_SETPGID, "setpgid", raw_setpgid),
    (SYS_GETPPID, "getppid", raw_getppid),
    (SYS_GETPGRP, "getpgrp", raw_getpgrp),
    (SYS_SETSID, "setsid", raw_setsid),
    (SYS_GETSID, "getsid", raw_getsid),
    (SYS_RT_SIGPENDING, "rt_sigpending", raw_rt_sigpending),
    (SYS_RT_SIGQUEUEINFO, "rt_sigqueueinfo", raw_rt_sigqueueinfo),
    (SYS_RT_SIGSUSPEND, "rt_sigsuspend", raw_rt_sigsuspend),
    (SYS_GETTID, "gettid", raw_gettid),
    (SYS_TKILL, "tkill", raw_tkill),
    (SYS_EXIT_GROUP, "exit_group", raw_exit),
];

pub fn register_all(table: &mut SyscallTable) {
    for &(nr, name, handler) in SYSCALLS {
        if table.register(nr, name, handler).is_err() {
            crate::log_error!("syscall: cannot register {} at {}", name, nr);
        }
    }
}
