//! Signal bits, handler installation and the polling delivery pass.

use bit_field::BitField;
use core::sync::atomic::Ordering;

use super::{Pid, Process, ProcessManager, ProcessRef};
use crate::error::{ProcError, ProcResult};
use crate::scheduler::{ThreadId, ThreadState, WaitReason};

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGUSR2: u32 = 12;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;

/// Highest valid signal number.
pub const SIG_MAX: u32 = 31;

/// Handler values with a fixed meaning.
pub const SIG_DFL: u64 = 0;
pub const SIG_IGN: u64 = 1;

/// `how` argument of `sigprocmask`.
pub const SIG_BLOCK: u32 = 0;
pub const SIG_UNBLOCK: u32 = 1;
pub const SIG_SETMASK: u32 = 2;

/// Terminating signals checked after the handler pass, in priority order.
const DEFAULT_FATAL: [u32; 3] = [SIGTERM, SIGKILL, SIGINT];

pub fn sig_bit(sig: u32) -> u64 {
    let mut word = 0u64;
    word.set_bit(sig as usize, true);
    word
}

/// Bits that can never be blocked.
fn unblockable() -> u64 {
    sig_bit(SIGKILL) | sig_bit(SIGSTOP)
}

fn check_signal(sig: u32) -> ProcResult<()> {
    if sig == 0 || sig > SIG_MAX {
        return Err(ProcError::InvalidArgument);
    }
    Ok(())
}

/// Handler and mask as seen through `sigaction`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SigAction {
    pub handler: u64,
    pub mask: u64,
}

impl Process {
    /// Mark `sig` pending.
    pub fn raise(&self, sig: u32) {
        self.pending.fetch_or(sig_bit(sig), Ordering::SeqCst);
    }

    fn clear_pending(&self, bits: u64) {
        self.pending.fetch_and(!bits, Ordering::SeqCst);
    }
}

impl ProcessManager {
    /// Post `sig` to one process. Signal 0 only checks that `pid` exists.
    pub fn kill(&self, pid: Pid, sig: u32) -> ProcResult<()> {
        if sig != 0 {
            check_signal(sig)?;
        }
        let target = self.find(pid).ok_or(ProcError::NotFound)?;
        if sig != 0 {
            target.raise(sig);
            crate::log_debug!("signal: {} -> pid {}", sig, pid);
        }
        Ok(())
    }

    /// Post `sig` to every member of process group `pgrp`.
    pub fn kill_group(&self, pgrp: Pid, sig: u32) -> ProcResult<()> {
        if sig != 0 {
            check_signal(sig)?;
        }
        let mut hit = false;
        for p in self.table.lock().iter() {
            if p.lock().pgrp == pgrp {
                hit = true;
                if sig != 0 {
                    p.raise(sig);
                }
            }
        }
        if hit {
            Ok(())
        } else {
            Err(ProcError::NotFound)
        }
    }

    /// Post `sig` to the process owning thread `tid`.
    pub fn tkill(&self, tid: ThreadId, sig: u32) -> ProcResult<()> {
        check_signal(sig)?;
        let thread = self.sched.find_thread(tid).ok_or(ProcError::NotFound)?;
        let pid = thread.lock().process.ok_or(ProcError::NotFound)?;
        self.kill(pid, sig)
    }

    /// Queued signals carry no payload here; only the bit is recorded.
    pub fn sigqueue(&self, pid: Pid, sig: u32) -> ProcResult<()> {
        check_signal(sig)?;
        self.kill(pid, sig)
    }

    /// Read and optionally replace the action for `sig`.
    pub fn sigaction(&self, process: &ProcessRef, sig: u32, new: Option<SigAction>) -> ProcResult<SigAction> {
        check_signal(sig)?;
        if new.is_some() && unblockable().get_bit(sig as usize) {
            return Err(ProcError::InvalidArgument);
        }
        let thread = process.main_thread().ok_or(ProcError::StateConflict)?;
        let mut inner = process.lock();
        let mut t = thread.lock();
        let old = SigAction {
            handler: t.signal_handlers[sig as usize],
            mask: inner.sig_mask,
        };
        if let Some(act) = new {
            t.signal_handlers[sig as usize] = act.handler;
            inner.sig_mask = act.mask & !unblockable();
        }
        Ok(old)
    }

    /// Block, unblock or replace the mask; returns the previous mask.
    pub fn sigprocmask(&self, process: &ProcessRef, how: u32, set: Option<u64>) -> ProcResult<u64> {
        let mut inner = process.lock();
        let old = inner.sig_mask;
        if let Some(set) = set {
            let mask = match how {
                SIG_BLOCK => old | set,
                SIG_UNBLOCK => old & !set,
                SIG_SETMASK => set,
                _ => return Err(ProcError::InvalidArgument),
            };
            inner.sig_mask = mask & !unblockable();
        }
        Ok(old)
    }

    /// Pending signals held back by the mask.
    pub fn sigpending(&self, process: &ProcessRef) -> u64 {
        process.pending() & process.lock().sig_mask
    }

    /// Swap in `mask`, give up the CPU once, then restore the old mask.
    /// Always reports interruption.
    pub fn sigsuspend(&self, process: &ProcessRef, mask: u64) -> ProcError {
        let old = {
            let mut inner = process.lock();
            core::mem::replace(&mut inner.sig_mask, mask & !unblockable())
        };
        self.sched.yield_now();
        process.lock().sig_mask = old;
        ProcError::Interrupted
    }

    /// One delivery pass over a single process.
    pub fn deliver_pending(&self, process: &ProcessRef) {
        let mask = {
            let inner = process.lock();
            if inner.zombie {
                return;
            }
            inner.sig_mask
        };
        let pending = process.pending();
        let deliverable = pending & !mask;
        if deliverable == 0 {
            return;
        }
        let Some(thread) = process.main_thread() else {
            return;
        };

        if deliverable.get_bit(SIGCONT as usize) {
            process.clear_pending(sig_bit(SIGCONT) | sig_bit(SIGSTOP));
            let resumed = {
                let mut t = thread.lock();
                if t.state == ThreadState::Blocked && t.wait_reason == WaitReason::Stopped {
                    t.wait_reason = WaitReason::None;
                    true
                } else {
                    false
                }
            };
            if resumed {
                self.sched.execute(&thread);
                crate::log_debug!("signal: pid {} continued", process.pid());
            }
        } else if deliverable.get_bit(SIGSTOP as usize) {
            process.clear_pending(sig_bit(SIGSTOP));
            let mut t = thread.lock();
            t.state = ThreadState::Blocked;
            t.wait_reason = WaitReason::Stopped;
            crate::log_debug!("signal: pid {} stopped", process.pid());
            return;
        }

        let mut handled = 0u64;
        {
            let mut t = thread.lock();
            for sig in 1..=SIG_MAX {
                if !deliverable.get_bit(sig as usize) || matches!(sig, SIGKILL | SIGSTOP | SIGCONT) {
                    continue;
                }
                match t.signal_handlers[sig as usize] {
                    SIG_DFL => {}
                    SIG_IGN => handled |= sig_bit(sig),
                    handler => {
                        // a later handler in the same pass overwrites the redirect
                        t.context.rip = handler;
                        t.context.rdi = sig as u64;
                        handled |= sig_bit(sig);
                        crate::log_debug!("signal: pid {} entering handler {:#x} for {}", process.pid(), handler, sig);
                    }
                }
            }
        }
        process.clear_pending(handled);

        let remaining = process.pending() & !mask;
        let handlers = thread.lock().signal_handlers;
        for sig in DEFAULT_FATAL {
            let defaulted = sig == SIGKILL || handlers[sig as usize] == SIG_DFL;
            if remaining.get_bit(sig as usize) && defaulted {
                process.clear_pending(sig_bit(sig));
                crate::log_info!("signal: pid {} killed by signal {}", process.pid(), sig);
                if let Err(err) = self.exit(process, 128 + sig as i32) {
                    crate::log_error!("signal: exit of pid {} on signal {} failed: {}", process.pid(), sig, err);
                }
                return;
            }
        }

        // Whatever the pass saw and did not act on is dropped, masked bits included.
        process.clear_pending(pending);
    }

    /// Run the delivery pass over every live process.
    pub fn deliver_signals(&self) {
        let procs = self.table.lock().snapshot();
        for p in procs {
            self.deliver_pending(&p);
        }
    }
}
