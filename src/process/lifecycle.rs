use alloc::string::String;
use alloc::sync::Arc;

use super::ops::command_name;
use super::signal::SIGCHLD;
use super::{ArgBlob, Pid, Process, ProcessInner, ProcessManager, ProcessRef, Reaped, Rusage, WaitOptions};
use crate::config::{
    is_user_va, CMDLINE_CAP, ENVIRON_CAP, MAX_PATH_LEN, NULL_PATH, RUSAGE_MAX_RSS, TTY_NAME, TTY_PATH,
    USEC_PER_TICK,
};
use crate::error::{ProcError, ProcResult};
use crate::fs::{join_path, FdTable, FileRef, OpenFlags, Vfs, VfsFile};
use crate::loader::{self, VirtRequest};
use crate::memory::AddressSpace;
use crate::scheduler::{ThreadKind, ThreadState, UserContext, WaitReason, MAX_SIGNAL_HANDLERS};

/// PID that orphans are handed to.
pub const INIT_PID: Pid = 1;

/// Returns an executable handle to the VFS on every exit path.
struct FileGuard<'a> {
    vfs: &'a dyn Vfs,
    file: FileRef,
}

impl FileGuard<'_> {
    fn get(&self) -> &dyn VfsFile {
        self.file.as_ref()
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        self.vfs.close(self.file.clone());
    }
}

impl ProcessManager {
    /// Standard streams on the terminal if there is one, else on the null device.
    fn default_fds(&self) -> ProcResult<(FdTable, Option<String>)> {
        let (path, tty) = if self.vfs.exists(TTY_PATH) {
            (TTY_PATH, Some(String::from(TTY_NAME)))
        } else {
            (NULL_PATH, None)
        };
        let mut fds = FdTable::new(self.config.max_fds);
        fds.stdin = Some(fds.open(&*self.vfs, path, OpenFlags::RDONLY)?);
        fds.stdout = Some(fds.open(&*self.vfs, path, OpenFlags::WRONLY)?);
        fds.stderr = Some(fds.open(&*self.vfs, path, OpenFlags::WRONLY)?);
        Ok((fds, tty))
    }

    fn current_pid(&self) -> Pid {
        self.current().map(|p| p.pid()).unwrap_or(0)
    }

    /// Create an empty process: fresh address space, default descriptors,
    /// no thread.
    pub fn create(&self) -> ProcResult<ProcessRef> {
        if self.table.lock().is_full() {
            crate::log_warn!("proc: create failed, table full");
            return Err(ProcError::TableFull);
        }
        let space = AddressSpace::new(self.memory.clone(), self.kernel_root).ok_or_else(|| {
            crate::log_error!("proc: create failed, no page for address space root");
            ProcError::OutOfMemory
        })?;
        let (fds, tty_name) = self.default_fds().map_err(|err| {
            crate::log_error!("proc: create failed opening default descriptors");
            ProcError::from(err)
        })?;
        let pid = self.pids.lock().next()?;

        let mut inner = ProcessInner::new(pid, self.current_pid(), space, self.sched.ticks());
        inner.tty_fd = fds.stdin;
        inner.tty_name = tty_name;
        let process = Arc::new(Process::new(pid, inner, fds));

        self.table.lock().insert(process.clone()).map_err(|err| {
            crate::log_warn!("proc: create of pid {} lost the last table slot", pid);
            err
        })?;
        self.notify_added(pid);
        crate::log_info!("proc: created pid {}", pid);
        Ok(process)
    }

    /// Replace the image of `process` with the executable at `path`.
    ///
    /// Process fields are only touched once the load has succeeded.
    pub fn execve(&self, process: &ProcessRef, path: &str, argv: &[&[u8]], envp: &[&[u8]]) -> ProcResult<()> {
        if path.is_empty() || path.len() > MAX_PATH_LEN {
            return Err(ProcError::InvalidArgument);
        }
        let full = join_path(&process.lock().cwd, path);
        let file = self.vfs.open(&full, OpenFlags::RDONLY).map_err(|err| {
            crate::log_error!("exec: cannot open {}: {}", full, err);
            ProcError::from(err)
        })?;
        let file = FileGuard { vfs: &*self.vfs, file };

        if self.loaders.select(file.get()).is_none() {
            crate::log_error!("exec: {} is not a recognised executable", full);
            return Err(ProcError::NoExec);
        }
        if let Some(thread) = process.main_thread() {
            let t = thread.lock();
            if !t.is_reusable() {
                crate::log_error!("exec: pid {} thread {} is {:?}", process.pid(), t.id.0, t.state);
                return Err(ProcError::StateConflict);
            }
        }

        let mut inner = process.lock();
        let Some(space) = inner.space.as_mut() else {
            crate::log_error!("exec: pid {} has no address space", process.pid());
            return Err(ProcError::StateConflict);
        };
        let req = VirtRequest { path: &full, file: file.get(), argv, envp };
        let image = loader::load(&self.loaders, &req, space, self.config.nx_stack)?;
        let cr3 = space.physical_base().as_u64();

        let (thread, fresh) = match inner.main_thread.clone() {
            Some(thread) => (thread, false),
            None => {
                let thread = self
                    .sched
                    .create_thread(ThreadKind::User, image.entry, 0, 0)
                    .ok_or(ProcError::OutOfMemory)?;
                (thread, true)
            }
        };
        // A thread exec'ing from its own syscall is already on a CPU.
        let running = !fresh && self.sched.is_current(&thread);
        {
            let mut t = thread.lock();
            if !t.is_reusable() {
                crate::log_error!("exec: pid {} thread {} died during load", process.pid(), t.id.0);
                return Err(ProcError::StateConflict);
            }
            t.entry = image.entry;
            t.context = UserContext::new_user(image.entry, image.user_sp);
            t.page_table = cr3;
            t.process = Some(process.pid());
            t.signal_handlers = [0; MAX_SIGNAL_HANDLERS];
        }

        inner.main_thread = Some(thread.clone());
        inner.comm = command_name(argv, full.as_bytes());
        inner.cmdline = ArgBlob::from_strings(argv, CMDLINE_CAP);
        inner.environ = ArgBlob::from_strings(envp, ENVIRON_CAP);
        inner.zombie = false;
        inner.exit_code = 0;
        drop(inner);

        if !running {
            self.sched.execute(&thread);
        }
        crate::log_info!("exec: pid {} now running {} (entry={:#x})", process.pid(), full, image.entry);
        Ok(())
    }

    /// Clone `parent` into a new process and return the child's PID.
    ///
    /// The child resumes at the parent's saved RIP with RAX = 0.
    pub fn fork(&self, parent: &ProcessRef) -> ProcResult<Pid> {
        let parent_thread = parent.main_thread().ok_or_else(|| {
            crate::log_error!("fork: pid {} has no thread", parent.pid());
            ProcError::StateConflict
        })?;
        let (ctx, handlers, priority) = {
            let t = parent_thread.lock();
            (t.context, t.signal_handlers, t.priority)
        };
        if !is_user_va(ctx.rip) || !is_user_va(ctx.rsp) {
            crate::log_error!("fork: pid {} is not in user mode (rip={:#x} rsp={:#x})", parent.pid(), ctx.rip, ctx.rsp);
            return Err(ProcError::StateConflict);
        }
        if self.table.lock().is_full() {
            crate::log_warn!("fork: table full");
            return Err(ProcError::TableFull);
        }

        let pid = self.pids.lock().next()?;
        let mut inner = {
            let p = parent.lock();
            let Some(space) = p.space.as_ref() else {
                return Err(ProcError::StateConflict);
            };
            let space = space.duplicate().map_err(|err| {
                crate::log_error!("fork: duplicating pid {} failed: {}", parent.pid(), err);
                err
            })?;
            let mut child = ProcessInner::new(pid, parent.pid(), space, self.sched.ticks());
            child.pgrp = p.pgrp;
            child.sid = p.sid;
            child.tty_fd = p.tty_fd;
            child.tty_name = p.tty_name.clone();
            child.cred = p.cred;
            child.cwd = p.cwd.clone();
            child.root = p.root.clone();
            child.sig_mask = p.sig_mask;
            child.comm = p.comm.clone();
            child.cmdline = p.cmdline.copy_truncated(CMDLINE_CAP);
            child.environ = p.environ.copy_truncated(ENVIRON_CAP);
            child
        };
        // TODO: hold the parent's descriptor lock across the whole fork once
        // sibling threads can share a process.
        let fds = parent.fds().duplicate();

        let thread = self
            .sched
            .create_thread(ThreadKind::User, ctx.rip, 0, priority)
            .ok_or(ProcError::OutOfMemory)?;
        let cr3 = inner.space.as_ref().map_or(0, |s| s.physical_base().as_u64());
        {
            let mut t = thread.lock();
            t.context = ctx;
            t.context.rax = 0;
            t.context.set_user_segments();
            t.page_table = cr3;
            t.process = Some(pid);
            t.signal_handlers = handlers;
        }
        inner.main_thread = Some(thread.clone());
        let child = Arc::new(Process::new(pid, inner, fds));

        if let Err(err) = self.table.lock().insert(child.clone()) {
            self.sched.destroy_thread(&thread);
            return Err(err);
        }
        self.notify_added(pid);
        self.sched.execute(&thread);
        crate::log_info!("fork: pid {} -> child {}", parent.pid(), pid);
        Ok(pid)
    }

    /// Turn `process` into a zombie carrying `status`.
    pub fn exit(&self, process: &ProcessRef, status: i32) -> ProcResult<()> {
        let pid = process.pid();
        let ppid = process.lock().ppid;
        let parent = if ppid > 0 { self.find(ppid) } else { None };
        let now = self.sched.ticks();

        {
            let mut inner = process.lock();
            if inner.zombie {
                return Err(ProcError::StateConflict);
            }
            inner.exit_code = status;
            let elapsed = now.saturating_sub(inner.times.start_tick);
            inner.times.sys_usec += elapsed * USEC_PER_TICK;

            let mut threads = self.sched.lock();
            threads.clear_current_of(pid);
            threads.destroy_threads_of(pid);
            inner.main_thread = None;
            inner.zombie = true;
            if let Some(parent) = &parent {
                parent.raise(SIGCHLD);
                threads.wake_child_waiters(parent.pid());
            }
        }

        if pid != INIT_PID {
            for orphan in self.table.lock().iter() {
                let mut o = orphan.lock();
                if o.ppid == pid {
                    o.ppid = INIT_PID;
                }
            }
        }
        crate::log_info!("proc: pid {} exited with status {}", pid, status);
        Ok(())
    }

    /// Reap a zombie child of `parent`.
    ///
    /// `target <= 0` matches any child. With `WNOHANG`, `Ok(None)` means no
    /// matching zombie was found; without it, `NoChild` ends a wait that
    /// could never finish.
    ///
    /// The waiter is marked blocked before every scan, so a child exiting
    /// between a scan and the next yield still finds it to wake.
    pub fn wait4(&self, parent: &ProcessRef, target: Pid, options: WaitOptions) -> ProcResult<Option<Reaped>> {
        let nohang = options.contains(WaitOptions::WNOHANG);
        let waiter = if nohang { None } else { parent.main_thread() };
        let result = loop {
            if let Some(thread) = &waiter {
                let _threads = self.sched.lock();
                let mut t = thread.lock();
                if t.is_reusable() {
                    t.state = ThreadState::Blocked;
                    t.wait_reason = WaitReason::Child;
                }
            }
            match self.claim_zombie(parent.pid(), target) {
                Claim::Reaped(child) => break Ok(Some(self.reap(child))),
                Claim::NoChild if nohang => break Ok(None),
                Claim::NoChild => break Err(ProcError::NoChild),
                Claim::Alive if nohang => break Ok(None),
                Claim::Alive => {}
            }
            self.sched.yield_now();
        };
        if let Some(thread) = &waiter {
            self.sched.resume(thread);
        }
        result
    }

    /// Find and unlink the first zombie child in table order.
    fn claim_zombie(&self, parent: Pid, target: Pid) -> Claim {
        let mut table = self.table.lock();
        let mut alive = false;
        let mut hit = None;
        for p in table.iter() {
            if target > 0 && p.pid() != target {
                continue;
            }
            let inner = p.lock();
            if inner.ppid != parent {
                continue;
            }
            if inner.zombie {
                hit = Some(p.pid());
                break;
            }
            alive = true;
        }
        match hit.and_then(|pid| table.remove(pid)) {
            Some(child) => Claim::Reaped(child),
            None if alive => Claim::Alive,
            None => Claim::NoChild,
        }
    }

    /// Release everything an unlinked zombie still owns.
    fn reap(&self, child: ProcessRef) -> Reaped {
        let pid = child.pid();
        child.fds().close_all();
        let (exit_code, usage) = {
            let mut inner = child.lock();
            let usage = Rusage {
                utime_usec: inner.times.user_usec,
                stime_usec: inner.times.sys_usec,
                maxrss: RUSAGE_MAX_RSS / 1024,
                ..Rusage::default()
            };
            inner.space = None;
            inner.comm.clear();
            inner.cmdline.clear();
            inner.environ.clear();
            (inner.exit_code, usage)
        };
        self.notify_removed(pid);
        crate::log_info!("proc: reaped pid {} (status {})", pid, exit_code);
        Reaped { pid, exit_code, usage }
    }
}

enum Claim {
    Reaped(ProcessRef),
    Alive,
    NoChild,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcConfig;
    use crate::loader::stack::STACK_BASE;
    use crate::loader::{BinaryLoader, ElfLoader, ExecError, LoaderRegistry, LoaderScratch};
    use crate::scheduler::ThreadRef;
    use alloc::boxed::Box;
    use crate::testing::{TestKernel, PROG};

    #[test]
    fn created_pids_are_strictly_increasing() {
        let k = TestKernel::new();
        let pids: alloc::vec::Vec<Pid> = (0..5).map(|_| k.procs.create().unwrap().pid()).collect();
        assert!(pids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(k.observer.added(), 5);
    }

    #[test]
    fn pid_wrap_never_yields_zero() {
        let k = TestKernel::with_pid_max(3);
        let pids: alloc::vec::Vec<Pid> = (0..5).map(|_| k.procs.create().unwrap().pid()).collect();
        assert_eq!(pids, [1, 2, 3, 1, 2]);
    }

    #[test]
    fn create_opens_standard_streams_on_the_terminal() {
        let k = TestKernel::new();
        let p = k.procs.create().unwrap();
        let fds = p.fds();
        assert_eq!((fds.stdin, fds.stdout, fds.stderr), (Some(0), Some(1), Some(2)));
        assert_eq!(fds.get(1).unwrap().object().path(), TTY_PATH);
        assert_eq!(p.lock().tty_name.as_deref(), Some("tty0"));
        assert!(p.main_thread().is_none());
    }

    #[test]
    fn create_falls_back_to_the_null_device() {
        let k = TestKernel::without_tty();
        let p = k.procs.create().unwrap();
        assert_eq!(p.fds().get(0).unwrap().object().path(), NULL_PATH);
        assert!(p.lock().tty_name.is_none());
    }

    #[test]
    fn full_table_rejects_create_and_keeps_memory() {
        let k = TestKernel::with_max_procs(1);
        k.procs.create().unwrap();
        let free = k.arena.free_frames();
        assert_eq!(k.procs.create().err(), Some(ProcError::TableFull));
        assert_eq!(k.arena.free_frames(), free);
    }

    #[test]
    fn execve_attaches_a_ready_thread() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog", b"-v"], &[b"HOME=/"]);
        let thread = p.main_thread().unwrap();
        let t = thread.lock();
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(t.context.rip, 0x40_1000);
        assert!(t.context.rsp > STACK_BASE);
        assert_eq!(t.context.rsp % 16, 8);
        assert_eq!(t.process, Some(p.pid()));
        drop(t);
        let inner = p.lock();
        assert_eq!(inner.comm, "prog");
        assert_eq!(inner.cmdline.as_bytes(), b"prog\0-v\0");
        assert_eq!(inner.environ.as_bytes(), b"HOME=/\0");
    }

    #[test]
    fn repeated_execve_retargets_the_same_thread() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        let first = p.main_thread().unwrap();
        first.lock().signal_handlers[10] = 0x40_2000;
        k.procs.execve(&p, PROG, &[b"again"], &[]).unwrap();
        let second = p.main_thread().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().signal_handlers[10], 0);
        assert_eq!(p.lock().comm, "again");
        assert_eq!(k.sched.thread_count(), 1);
    }

    #[test]
    fn failed_execve_leaves_the_process_untouched() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        let handles = k.fs.open_handles();
        assert_eq!(k.procs.execve(&p, "/bin/missing", &[b"x"], &[]), Err(ProcError::NoEntry));
        assert_eq!(k.procs.execve(&p, "/etc/motd", &[b"x"], &[]), Err(ProcError::NoExec));
        assert_eq!(k.fs.open_handles(), handles);
        assert_eq!(p.lock().comm, "prog");
    }

    #[test]
    fn execve_rejects_a_terminated_thread() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        p.main_thread().unwrap().lock().state = ThreadState::Terminated;
        assert_eq!(k.procs.execve(&p, PROG, &[b"prog"], &[]), Err(ProcError::StateConflict));
    }

    /// ELF loader that terminates a thread while the image is being loaded.
    struct KillDuringLoad {
        victim: Arc<spin::Mutex<Option<ThreadRef>>>,
    }

    impl BinaryLoader for KillDuringLoad {
        fn name(&self) -> &'static str {
            "elf-kill"
        }

        fn probe(&self, file: &dyn VfsFile) -> bool {
            ElfLoader.probe(file)
        }

        fn load(&self, file: &dyn VfsFile, space: &mut AddressSpace, scratch: &mut LoaderScratch) -> Result<(), ExecError> {
            if let Some(thread) = self.victim.lock().take() {
                thread.lock().state = ThreadState::Terminated;
            }
            ElfLoader.load(file, space, scratch)
        }
    }

    #[test]
    fn execve_does_not_revive_a_thread_terminated_mid_load() {
        let k = TestKernel::new();
        let victim = Arc::new(spin::Mutex::new(None));
        let mut loaders = LoaderRegistry::new();
        loaders.register(Box::new(KillDuringLoad { victim: victim.clone() }));
        let procs = ProcessManager::new(ProcConfig::default(), k.arena.memory(), k.fs.clone(), k.sched.clone())
            .with_loaders(loaders);

        let p = procs.create().unwrap();
        procs.execve(&p, PROG, &[b"prog"], &[]).unwrap();
        let thread = p.main_thread().unwrap();
        *victim.lock() = Some(thread.clone());
        let ready = k.sched.ready_count();

        assert_eq!(procs.execve(&p, PROG, &[b"again"], &[]), Err(ProcError::StateConflict));
        assert_eq!(thread.lock().state, ThreadState::Terminated);
        assert_eq!(k.sched.ready_count(), ready);
        assert_eq!(p.lock().comm, "prog");
    }

    #[test]
    fn execve_from_the_running_thread_does_not_requeue_it() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        let thread = p.main_thread().unwrap();
        k.sched.set_current(Some(thread.clone()));
        assert_eq!(k.sched.ready_count(), 0);

        k.procs.execve(&p, PROG, &[b"again"], &[]).unwrap();
        assert!(k.sched.is_current(&thread));
        assert_eq!(thread.lock().state, ThreadState::Running);
        assert_eq!(thread.lock().context.rip, 0x40_1000);
        assert_eq!(k.sched.ready_count(), 0);
        assert!(k.sched.schedule().is_none());
    }

    #[test]
    fn fork_copies_context_with_zero_return() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let parent_ctx = {
            let thread = parent.main_thread().unwrap();
            let mut t = thread.lock();
            t.context.rax = 57;
            t.context.rbx = 0xdead;
            t.context
        };
        let pid = k.procs.fork(&parent).unwrap();
        let child = k.procs.find(pid).unwrap();
        let thread = child.main_thread().unwrap();
        let t = thread.lock();
        assert_eq!(t.context.rip, parent_ctx.rip);
        assert_eq!(t.context.rsp, parent_ctx.rsp);
        assert_eq!(t.context.rbx, 0xdead);
        assert_eq!(t.context.rax, 0);
        assert_eq!(t.state, ThreadState::Ready);
        assert_eq!(child.lock().ppid, parent.pid());
    }

    #[test]
    fn fork_isolates_user_memory() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let pid = k.procs.fork(&parent).unwrap();
        let child = k.procs.find(pid).unwrap();

        let pages = parent.lock().space.as_ref().unwrap().user_pages();
        assert!(!pages.is_empty());
        for va in pages {
            let before = parent.lock().space.as_ref().unwrap().read_u64(va).unwrap();
            child.lock().space.as_ref().unwrap().write_u64(va, !before).unwrap();
            assert_eq!(parent.lock().space.as_ref().unwrap().read_u64(va).unwrap(), before);
        }
    }

    #[test]
    fn fork_requires_a_user_mode_context() {
        let k = TestKernel::new();
        let p = k.procs.create().unwrap();
        assert_eq!(k.procs.fork(&p), Err(ProcError::StateConflict));
        let p = k.spawn(PROG, &[b"prog"], &[]);
        p.main_thread().unwrap().lock().context.rip = 0xFFFF_8000_0000_1000;
        assert_eq!(k.procs.fork(&p), Err(ProcError::StateConflict));
        assert_eq!(k.procs.process_count(), 2);
    }

    #[test]
    fn fork_copies_identity_and_resets_times() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog", b"x"], &[b"A=1"]);
        {
            let mut p = parent.lock();
            p.cwd = String::from("/bin");
            p.sig_mask = 1 << 10;
            p.times.sys_usec = 5000;
        }
        parent.raise(10);
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        let c = child.lock();
        assert_eq!(c.cwd, "/bin");
        assert_eq!(c.sig_mask, 1 << 10);
        assert_eq!(c.times.sys_usec, 0);
        assert_eq!(c.cmdline.as_bytes(), b"prog\0x\0");
        assert_eq!(c.tty_name.as_deref(), Some("tty0"));
        assert_eq!(child.pending(), 0);
    }

    #[test]
    fn failed_fork_discards_the_partial_child() {
        let k = TestKernel::with_arena_pages(48);
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let count = k.procs.process_count();
        let threads = k.sched.thread_count();
        let free = k.arena.free_frames();
        assert_eq!(k.procs.fork(&parent), Err(ProcError::OutOfMemory));
        assert_eq!(k.procs.process_count(), count);
        assert_eq!(k.sched.thread_count(), threads);
        assert_eq!(k.arena.free_frames(), free);
    }

    #[test]
    fn descriptors_survive_a_close_in_the_child() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let fd = k.procs.open(&parent, "/etc/motd", OpenFlags::RDONLY).unwrap();
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        assert_eq!(parent.fds().get(fd).unwrap().refcount(), 2);

        k.procs.close(&child, fd).unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(k.procs.read(&parent, fd, &mut buf), Ok(5));
        assert_eq!(&buf, b"hello");
        assert_eq!(parent.fds().get(fd).unwrap().refcount(), 1);
    }

    #[test]
    fn exit_makes_a_zombie_and_signals_the_parent() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        let threads = k.sched.thread_count();
        k.sched.set_current(child.main_thread());

        k.procs.exit(&child, 3).unwrap();
        assert!(child.is_zombie());
        assert!(child.main_thread().is_none());
        assert!(k.sched.current_thread().is_none());
        assert_eq!(k.sched.thread_count(), threads - 1);
        assert_ne!(parent.pending() & super::super::signal::sig_bit(SIGCHLD), 0);
        assert!(k.procs.find(child.pid()).is_some());
        assert_eq!(k.procs.exit(&child, 4), Err(ProcError::StateConflict));
    }

    #[test]
    fn exit_accounts_system_time_in_ticks() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        for _ in 0..7 {
            k.sched.tick();
        }
        k.procs.exit(&p, 0).unwrap();
        assert_eq!(p.lock().times.sys_usec, 7 * USEC_PER_TICK);
    }

    #[test]
    fn exit_wakes_a_parent_blocked_in_wait() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        let waiter = parent.main_thread().unwrap();
        {
            let mut t = waiter.lock();
            t.state = ThreadState::Blocked;
            t.wait_reason = WaitReason::Child;
        }
        k.procs.exit(&child, 0).unwrap();
        assert_eq!(waiter.lock().state, ThreadState::Ready);
    }

    #[test]
    fn orphans_are_reparented_to_init() {
        let k = TestKernel::new();
        let _init = k.spawn(PROG, &[b"init"], &[]);
        let mid = k.spawn(PROG, &[b"mid"], &[]);
        let grandchild = k.procs.find(k.procs.fork(&mid).unwrap()).unwrap();
        k.procs.exit(&mid, 0).unwrap();
        assert_eq!(grandchild.lock().ppid, INIT_PID);
    }

    #[test]
    fn zombie_is_reaped_exactly_once() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let pid = k.procs.fork(&parent).unwrap();
        let child = k.procs.find(pid).unwrap();
        k.procs.exit(&child, 42).unwrap();

        let reaped = k.procs.wait4(&parent, pid, WaitOptions::empty()).unwrap().unwrap();
        assert_eq!(reaped.pid, pid);
        assert_eq!(reaped.exit_code, 42);
        assert_eq!(reaped.status_word(), 42 << 8);
        assert!(k.procs.find(pid).is_none());
        assert_eq!(k.observer.removed(), 1);
        assert!(child.lock().space.is_none());
        assert_eq!(child.fds().open_count(), 0);

        assert_eq!(k.procs.wait4(&parent, pid, WaitOptions::empty()), Err(ProcError::NoChild));
    }

    #[test]
    fn nonblocking_wait_returns_none_while_children_live() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        k.procs.fork(&parent).unwrap();
        assert_eq!(k.procs.wait4(&parent, -1, WaitOptions::WNOHANG), Ok(None));
        assert_eq!(parent.main_thread().unwrap().lock().state, ThreadState::Ready);
    }

    #[test]
    fn wait_without_children_fails() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        assert_eq!(k.procs.wait4(&p, 99, WaitOptions::empty()), Err(ProcError::NoChild));
        assert_eq!(k.procs.wait4(&p, -1, WaitOptions::empty()), Err(ProcError::NoChild));
        assert_eq!(p.main_thread().unwrap().lock().state, ThreadState::Running);
    }

    #[test]
    fn nonblocking_wait_without_children_returns_none() {
        let k = TestKernel::new();
        let p = k.spawn(PROG, &[b"prog"], &[]);
        assert_eq!(k.procs.wait4(&p, -1, WaitOptions::WNOHANG), Ok(None));
        assert_eq!(k.procs.wait4(&p, 99, WaitOptions::WNOHANG), Ok(None));
    }

    #[test]
    fn wait_rejects_zombies_of_other_parents() {
        let k = TestKernel::new();
        let a = k.spawn(PROG, &[b"a"], &[]);
        let b = k.spawn(PROG, &[b"b"], &[]);
        let child = k.procs.find(k.procs.fork(&a).unwrap()).unwrap();
        k.procs.exit(&child, 0).unwrap();
        assert_eq!(k.procs.wait4(&b, child.pid(), WaitOptions::empty()), Err(ProcError::NoChild));
        assert!(k.procs.wait4(&a, 0, WaitOptions::WNOHANG).unwrap().is_some());
    }

    #[test]
    fn blocking_wait_returns_once_the_child_exits() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        let procs = k.procs.clone();
        let exiter = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            procs.exit(&child, 9).unwrap();
        });
        let reaped = k.procs.wait4(&parent, -1, WaitOptions::empty()).unwrap().unwrap();
        exiter.join().unwrap();
        assert_eq!(reaped.exit_code, 9);
        assert_eq!(parent.main_thread().unwrap().lock().state, ThreadState::Running);
    }

    #[test]
    fn exit_while_the_waiter_is_blocked_is_not_lost() {
        let k = TestKernel::new();
        let parent = k.spawn(PROG, &[b"prog"], &[]);
        let child = k.procs.find(k.procs.fork(&parent).unwrap()).unwrap();
        let waiter = parent.main_thread().unwrap();
        let procs = k.procs.clone();
        let exiter = std::thread::spawn(move || {
            // exit only once the waiter has published itself as blocked
            let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
            let mut saw_blocked = false;
            while std::time::Instant::now() < deadline {
                let t = waiter.lock();
                if t.state == ThreadState::Blocked && t.wait_reason == WaitReason::Child {
                    saw_blocked = true;
                    break;
                }
                drop(t);
                std::thread::yield_now();
            }
            procs.exit(&child, 5).unwrap();
            saw_blocked
        });
        let reaped = k.procs.wait4(&parent, -1, WaitOptions::empty()).unwrap().unwrap();
        assert!(exiter.join().unwrap());
        assert_eq!(reaped.exit_code, 5);
        let thread = parent.main_thread().unwrap();
        assert_eq!(thread.lock().state, ThreadState::Running);
        assert_eq!(thread.lock().wait_reason, WaitReason::None);
        assert_eq!(k.sched.ready_count(), 0);
    }
}
