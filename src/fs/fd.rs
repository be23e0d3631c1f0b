use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::{FileRef, NodeKind, OpenFlags, Vfs};

/// Kind tag of a descriptor entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    File,
    Char,
    Block,
}

impl From<NodeKind> for FdKind {
    fn from(kind: NodeKind) -> Self {
        match kind {
            NodeKind::CharDevice => FdKind::Char,
            NodeKind::BlockDevice => FdKind::Block,
            NodeKind::Regular | NodeKind::Directory => FdKind::File,
        }
    }
}

/// Open file description shared by every descriptor duplicated from it.
pub struct OpenFile {
    pub object: FileRef,
    pub flags: OpenFlags,
    pub offset: usize,
}

#[derive(Clone)]
pub struct FdEntry {
    pub kind: FdKind,
    pub open: Arc<Mutex<OpenFile>>,
}

impl FdEntry {
    pub fn new(object: FileRef, flags: OpenFlags) -> Self {
        FdEntry {
            kind: object.kind().into(),
            open: Arc::new(Mutex::new(OpenFile { object, flags, offset: 0 })),
        }
    }

    /// Descriptors (in any table) sharing this open file.
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.open)
    }

    pub fn object(&self) -> FileRef {
        self.open.lock().object.clone()
    }
}

/// Per-process descriptor table with a fixed slot count.
pub struct FdTable {
    slots: Vec<Option<FdEntry>>,
    pub stdin: Option<usize>,
    pub stdout: Option<usize>,
    pub stderr: Option<usize>,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        FdTable {
            slots,
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Place `entry` in the lowest free slot.
    pub fn install(&mut self, entry: FdEntry) -> FsResult<usize> {
        let fd = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(FsError::TableFull)?;
        self.slots[fd] = Some(entry);
        Ok(fd)
    }

    pub fn open(&mut self, vfs: &dyn Vfs, path: &str, flags: OpenFlags) -> FsResult<usize> {
        if self.slots.iter().all(|s| s.is_some()) {
            return Err(FsError::TableFull);
        }
        let object = vfs.open(path, flags)?;
        self.install(FdEntry::new(object, flags))
    }

    pub fn get(&self, fd: usize) -> FsResult<&FdEntry> {
        self.slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .ok_or(FsError::BadDescriptor)
    }

    pub fn close(&mut self, fd: usize) -> FsResult<()> {
        let slot = self.slots.get_mut(fd).ok_or(FsError::BadDescriptor)?;
        slot.take().ok_or(FsError::BadDescriptor)?;
        for stream in [&mut self.stdin, &mut self.stdout, &mut self.stderr] {
            if *stream == Some(fd) {
                *stream = None;
            }
        }
        Ok(())
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> FsResult<usize> {
        let entry = self.get(fd)?;
        let mut open = entry.open.lock();
        if !open.flags.readable() {
            return Err(FsError::PermissionDenied);
        }
        let offset = open.offset;
        let n = open.object.read_at(offset, buf)?;
        open.offset += n;
        Ok(n)
    }

    pub fn write(&self, fd: usize, data: &[u8]) -> FsResult<usize> {
        let entry = self.get(fd)?;
        let mut open = entry.open.lock();
        if !open.flags.writable() {
            return Err(FsError::PermissionDenied);
        }
        if open.flags.contains(OpenFlags::APPEND) {
            let end = open.object.size();
            open.offset = end;
        }
        let offset = open.offset;
        let n = open.object.write_at(offset, data)?;
        open.offset += n;
        Ok(n)
    }

    pub fn dup(&mut self, fd: usize) -> FsResult<usize> {
        let entry = self.get(fd)?.clone();
        self.install(entry)
    }

    pub fn dup2(&mut self, old: usize, new: usize) -> FsResult<usize> {
        let entry = self.get(old)?.clone();
        if old == new {
            return Ok(new);
        }
        let slot = self.slots.get_mut(new).ok_or(FsError::BadDescriptor)?;
        *slot = Some(entry);
        Ok(new)
    }

    /// Copy for a forked child: same capacity, every occupied entry shared
    /// with the parent, standard stream indices preserved.
    pub fn duplicate(&self) -> FdTable {
        let mut child = FdTable::new(self.capacity());
        for (fd, entry) in self.slots.iter().enumerate() {
            if let Some(entry) = entry {
                child.slots[fd] = Some(entry.clone());
            }
        }
        child.stdin = self.stdin;
        child.stdout = self.stdout;
        child.stderr = self.stderr;
        child
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.take();
        }
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;
    }
}
