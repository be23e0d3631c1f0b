use alloc::sync::Arc;
use spin::Mutex;

use super::context::UserContext;
use crate::process::Pid;

/// Unique thread identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

/// Thread state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping,
    Blocked,
    Zombie,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadKind {
    Kernel,
    User,
}

/// Why a blocked thread is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    None,
    Child,
    Stopped,
}

pub const MAX_SIGNAL_HANDLERS: usize = 32;

/// A single thread of execution.
pub struct Thread {
    pub id: ThreadId,
    pub kind: ThreadKind,
    pub state: ThreadState,
    pub wait_reason: WaitReason,
    pub priority: u8,
    pub entry: u64,
    pub arg: u64,
    /// Saved user registers; reloaded on the way back to ring 3.
    pub context: UserContext,
    /// CR3 value of the owning address space.
    pub page_table: u64,
    pub process: Option<Pid>,
    /// User handler address per signal number; 0 means default action.
    pub signal_handlers: [u64; MAX_SIGNAL_HANDLERS],
}

impl Thread {
    pub(super) fn new(id: ThreadId, kind: ThreadKind, entry: u64, arg: u64, priority: u8) -> Self {
        Thread {
            id,
            kind,
            state: ThreadState::Ready,
            wait_reason: WaitReason::None,
            priority,
            entry,
            arg,
            context: UserContext::default(),
            page_table: 0,
            process: None,
            signal_handlers: [0; MAX_SIGNAL_HANDLERS],
        }
    }

    /// Whether exec may retarget this thread in place.
    pub fn is_reusable(&self) -> bool {
        !matches!(self.state, ThreadState::Zombie | ThreadState::Terminated)
    }
}

pub type ThreadRef = Arc<Mutex<Thread>>;
