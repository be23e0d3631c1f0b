use alloc::vec::Vec;

use super::{Pid, ProcessRef};
use crate::error::{ProcError, ProcResult};

/// Fixed-capacity, insertion-ordered set of live processes. Removal moves
/// the last entry into the vacated slot.
pub struct ProcessTable {
    entries: Vec<ProcessRef>,
    capacity: usize,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        ProcessTable {
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn insert(&mut self, process: ProcessRef) -> ProcResult<()> {
        if self.is_full() {
            return Err(ProcError::TableFull);
        }
        self.entries.push(process);
        Ok(())
    }

    pub fn remove(&mut self, pid: Pid) -> Option<ProcessRef> {
        let idx = self.entries.iter().position(|p| p.pid() == pid)?;
        Some(self.entries.swap_remove(idx))
    }

    pub fn find(&self, pid: Pid) -> Option<ProcessRef> {
        self.entries.iter().find(|p| p.pid() == pid).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessRef> {
        self.entries.iter()
    }

    /// Owned copy of every entry, for passes that must not hold the lock.
    pub fn snapshot(&self) -> Vec<ProcessRef> {
        self.entries.clone()
    }
}

/// Monotonic PID source that wraps back to 1 after `max`.
///
/// Wrapping does not skip PIDs still in use.
pub struct PidAllocator {
    next: Pid,
    max: Pid,
}

impl PidAllocator {
    pub fn new(max: Pid) -> Self {
        PidAllocator { next: 1, max }
    }

    pub fn next(&mut self) -> ProcResult<Pid> {
        if self.max < 1 {
            return Err(ProcError::PidSpaceExhausted);
        }
        if self.next <= 0 || self.next > self.max {
            crate::log_warn!("proc: PID space wrapped at {}", self.max);
            self.next = 1;
        }
        let pid = self.next;
        self.next = pid.wrapping_add(1);
        Ok(pid)
    }
}
