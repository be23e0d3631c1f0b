//! Identity, working-directory and descriptor operations on a process.

use alloc::string::String;

use super::{Pid, Process, ProcessManager, ProcessRef};
use crate::config::COMM_LEN;
use crate::error::{ProcError, ProcResult};
use crate::fs::{basename, join_path, NodeKind, OpenFlags};
use crate::scheduler::ThreadState;

/// Short command name: basename of `argv[0]`, else of `path`.
pub fn command_name(argv: &[&[u8]], path: &[u8]) -> String {
    let from_argv = argv.first().map(|a| basename(a)).filter(|b| !b.is_empty());
    let name = from_argv
        .or_else(|| Some(basename(path)).filter(|b| !b.is_empty()))
        .unwrap_or(b"unknown");
    let name = &name[..name.len().min(COMM_LEN)];
    String::from_utf8_lossy(name).into_owned()
}

impl Process {
    pub fn ppid(&self) -> Pid {
        self.lock().ppid
    }

    pub fn pgrp(&self) -> Pid {
        self.lock().pgrp
    }

    pub fn sid(&self) -> Pid {
        self.lock().sid
    }

    /// Start a new session led by this process.
    pub fn setsid(&self) -> Pid {
        let mut inner = self.lock();
        inner.sid = self.pid;
        inner.pgrp = self.pid;
        self.pid
    }

    pub fn cwd(&self) -> String {
        self.lock().cwd.clone()
    }

    /// Replace the file-creation mask and return the previous one.
    pub fn umask(&self, mask: u32) -> u32 {
        let mut inner = self.lock();
        core::mem::replace(&mut inner.cred.umask, mask & 0o777)
    }

    pub fn tty_name(&self) -> String {
        self.lock().tty_name.clone().unwrap_or_else(|| String::from("notty"))
    }

    pub fn comm(&self) -> String {
        self.lock().comm.clone()
    }

    /// Single-letter state as shown in `/proc/<pid>/stat`.
    pub fn state_code(&self) -> char {
        let thread = {
            let inner = self.lock();
            if inner.zombie {
                return 'Z';
            }
            inner.main_thread.clone()
        };
        let Some(thread) = thread else {
            return 'X';
        };
        let state = thread.lock().state;
        match state {
            ThreadState::Running | ThreadState::Ready => 'R',
            ThreadState::Sleeping => 'S',
            ThreadState::Blocked => 'D',
            ThreadState::Zombie => 'Z',
            ThreadState::Terminated => 'X',
        }
    }
}

impl ProcessManager {
    /// Move `pid` (0 for the caller) into group `pgid` (0 for its own PID).
    pub fn setpgid(&self, caller: &ProcessRef, pid: Pid, pgid: Pid) -> ProcResult<()> {
        if pid < 0 || pgid < 0 {
            return Err(ProcError::InvalidArgument);
        }
        let target = if pid == 0 || pid == caller.pid() {
            caller.clone()
        } else {
            let target = self.find(pid).ok_or(ProcError::NotFound)?;
            if target.ppid() != caller.pid() {
                return Err(ProcError::NotFound);
            }
            target
        };
        let pgid = if pgid == 0 { target.pid() } else { pgid };
        target.lock().pgrp = pgid;
        Ok(())
    }

    pub fn chdir(&self, process: &ProcessRef, path: &str) -> ProcResult<()> {
        if path.is_empty() {
            return Err(ProcError::NoEntry);
        }
        let full = join_path(&process.cwd(), path);
        if !self.vfs.exists(&full) {
            return Err(ProcError::NoEntry);
        }
        if !self.vfs.is_dir(&full) {
            return Err(ProcError::NotADirectory);
        }
        process.lock().cwd = full;
        Ok(())
    }

    /// Change directory to the one open on `fd`.
    pub fn fchdir(&self, process: &ProcessRef, fd: usize) -> ProcResult<()> {
        let object = process.fds().get(fd)?.object();
        if object.kind() != NodeKind::Directory {
            return Err(ProcError::NotADirectory);
        }
        process.lock().cwd = String::from(object.path());
        Ok(())
    }

    pub fn open(&self, process: &ProcessRef, path: &str, flags: OpenFlags) -> ProcResult<usize> {
        let full = join_path(&process.cwd(), path);
        let fd = process.fds().open(&*self.vfs, &full, flags)?;
        crate::log_debug!("fd: pid {} opened {} as {}", process.pid(), full, fd);
        Ok(fd)
    }

    pub fn close(&self, process: &ProcessRef, fd: usize) -> ProcResult<()> {
        Ok(process.fds().close(fd)?)
    }

    pub fn read(&self, process: &ProcessRef, fd: usize, buf: &mut [u8]) -> ProcResult<usize> {
        Ok(process.fds().read(fd, buf)?)
    }

    pub fn write(&self, process: &ProcessRef, fd: usize, data: &[u8]) -> ProcResult<usize> {
        Ok(process.fds().write(fd, data)?)
    }

    pub fn dup(&self, process: &ProcessRef, fd: usize) -> ProcResult<usize> {
        Ok(process.fds().dup(fd)?)
    }

    pub fn dup2(&self, process: &ProcessRef, old: usize, new: usize) -> ProcResult<usize> {
        Ok(process.fds().dup2(old, new)?)
    }
}
