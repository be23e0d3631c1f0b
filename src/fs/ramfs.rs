use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::error::{FsError, FsResult};
use super::{FileRef, NodeKind, OpenFlags, Vfs, VfsFile};

/// Character devices a RAMFS node can stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharDevice {
    /// Reads hit EOF, writes are discarded.
    Null,
    /// Writes go to the serial console.
    Tty,
}

// ──────────────────────────────────────────────────────────────
//  Internal tree node, stored in an arena (Vec<RamNode>)
// ──────────────────────────────────────────────────────────────

struct RamNode {
    id: u64,
    name: String,
    kind: NodeKind,
    device: Option<CharDevice>,
    parent: Option<u64>,
    children: Vec<u64>,
    data: Vec<u8>,
}

impl RamNode {
    fn size(&self) -> usize {
        match self.kind {
            NodeKind::Regular => self.data.len(),
            NodeKind::Directory => self.children.len(),
            NodeKind::CharDevice | NodeKind::BlockDevice => 0,
        }
    }
}

struct RamFsInner {
    nodes: Vec<RamNode>,
    next_id: u64,
}

impl RamFsInner {
    fn new() -> Self {
        let root = RamNode {
            id: 0,
            name: String::from("/"),
            kind: NodeKind::Directory,
            device: None,
            parent: None,
            children: Vec::new(),
            data: Vec::new(),
        };
        RamFsInner {
            nodes: alloc::vec![root],
            next_id: 1,
        }
    }

    fn find_by_id(&self, id: u64) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }

    fn node(&self, id: u64) -> FsResult<&RamNode> {
        self.find_by_id(id).map(|i| &self.nodes[i]).ok_or(FsError::NotFound)
    }

    fn node_mut(&mut self, id: u64) -> FsResult<&mut RamNode> {
        let idx = self.find_by_id(id).ok_or(FsError::NotFound)?;
        Ok(&mut self.nodes[idx])
    }

    /// Walk an absolute path from root to the inode id of the target.
    fn resolve_path(&self, path: &str) -> FsResult<u64> {
        if !path.starts_with('/') {
            return Err(FsError::InvalidPath);
        }
        let mut current_id: u64 = 0;
        for seg in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            let node = self.node(current_id)?;
            if node.kind != NodeKind::Directory {
                return Err(FsError::NotADirectory);
            }
            if seg == ".." {
                current_id = node.parent.unwrap_or(0);
                continue;
            }
            current_id = node
                .children
                .iter()
                .copied()
                .find(|&cid| self.node(cid).map(|c| c.name == seg).unwrap_or(false))
                .ok_or(FsError::NotFound)?;
        }
        Ok(current_id)
    }

    /// Resolve parent path and return (parent_inode_id, child_name).
    fn resolve_parent(&self, path: &str) -> FsResult<(u64, String)> {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Err(FsError::InvalidPath);
        }
        let last_slash = path.rfind('/').ok_or(FsError::InvalidPath)?;
        let parent_path = if last_slash == 0 { "/" } else { &path[..last_slash] };
        let child_name = &path[last_slash + 1..];
        if child_name.is_empty() {
            return Err(FsError::InvalidPath);
        }

        let parent_id = self.resolve_path(parent_path)?;
        let parent = self.node(parent_id)?;
        if parent.kind != NodeKind::Directory {
            return Err(FsError::NotADirectory);
        }
        if parent
            .children
            .iter()
            .any(|&cid| self.node(cid).map(|c| c.name == child_name).unwrap_or(false))
        {
            return Err(FsError::AlreadyExists);
        }
        Ok((parent_id, String::from(child_name)))
    }

    fn insert_node(&mut self, path: &str, kind: NodeKind, device: Option<CharDevice>) -> FsResult<u64> {
        let (parent_id, name) = self.resolve_parent(path)?;
        let id = self.next_id;
        self.next_id += 1;
        self.nodes.push(RamNode {
            id,
            name,
            kind,
            device,
            parent: Some(parent_id),
            children: Vec::new(),
            data: Vec::new(),
        });
        self.node_mut(parent_id)?.children.push(id);
        Ok(id)
    }
}

// ──────────────────────────────────────────────────────────────
//  Public RamFs struct
// ──────────────────────────────────────────────────────────────

/// Tree-structured in-memory filesystem.
pub struct RamFs {
    label: &'static str,
    inner: Arc<Mutex<RamFsInner>>,
    open_handles: Arc<AtomicUsize>,
}

impl RamFs {
    pub fn new(label: &'static str) -> Self {
        RamFs {
            label,
            inner: Arc::new(Mutex::new(RamFsInner::new())),
            open_handles: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        self.label
    }

    pub fn mkdir(&self, path: &str) -> FsResult<()> {
        self.inner.lock().insert_node(path, NodeKind::Directory, None).map(|_| ())
    }

    pub fn create(&self, path: &str) -> FsResult<()> {
        self.inner.lock().insert_node(path, NodeKind::Regular, None).map(|_| ())
    }

    pub fn mknod(&self, path: &str, device: CharDevice) -> FsResult<()> {
        self.inner
            .lock()
            .insert_node(path, NodeKind::CharDevice, Some(device))
            .map(|_| ())
    }

    /// Create (if needed) and overwrite a regular file.
    pub fn write_file(&self, path: &str, data: &[u8]) -> FsResult<()> {
        let mut inner = self.inner.lock();
        let id = match inner.resolve_path(path) {
            Ok(id) => id,
            Err(FsError::NotFound) => inner.insert_node(path, NodeKind::Regular, None)?,
            Err(e) => return Err(e),
        };
        let node = inner.node_mut(id)?;
        if node.kind != NodeKind::Regular {
            return Err(FsError::IsADirectory);
        }
        node.data.clear();
        node.data.extend_from_slice(data);
        Ok(())
    }

    /// Handles returned by `open` that have not been dropped yet.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Lay out `/dev` with a null device and, if asked, a terminal.
    pub fn with_devices(label: &'static str, tty: bool) -> Self {
        let fs = RamFs::new(label);
        let mut nodes = vec![("/dev/null", CharDevice::Null)];
        if tty {
            nodes.push(("/dev/tty0", CharDevice::Tty));
        }
        if let Err(err) = fs.mkdir("/dev") {
            crate::log_error!("ramfs: cannot create /dev: {}", err);
            return fs;
        }
        for (path, device) in nodes {
            if let Err(err) = fs.mknod(path, device) {
                crate::log_error!("ramfs: cannot create {}: {}", path, err);
            }
        }
        fs
    }
}

impl Vfs for RamFs {
    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<FileRef> {
        let mut inner = self.inner.lock();
        let id = match inner.resolve_path(path) {
            Ok(id) => id,
            Err(FsError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                inner.insert_node(path, NodeKind::Regular, None)?
            }
            Err(e) => return Err(e),
        };
        let node = inner.node_mut(id)?;
        if node.kind == NodeKind::Directory && flags.writable() {
            return Err(FsError::IsADirectory);
        }
        if node.kind == NodeKind::Regular && flags.contains(OpenFlags::TRUNC) && flags.writable() {
            node.data.clear();
        }
        let file = RamFile {
            fs: self.inner.clone(),
            handles: self.open_handles.clone(),
            id,
            path: String::from(path),
            kind: node.kind,
            device: node.device,
        };
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(file))
    }

    fn exists(&self, path: &str) -> bool {
        self.inner.lock().resolve_path(path).is_ok()
    }

    fn is_dir(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .resolve_path(path)
            .and_then(|id| inner.node(id).map(|n| n.kind == NodeKind::Directory))
            .unwrap_or(false)
    }
}

/// Open handle onto a RAMFS node.
struct RamFile {
    fs: Arc<Mutex<RamFsInner>>,
    handles: Arc<AtomicUsize>,
    id: u64,
    path: String,
    kind: NodeKind,
    device: Option<CharDevice>,
}

impl VfsFile for RamFile {
    fn path(&self) -> &str {
        &self.path
    }

    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn size(&self) -> usize {
        self.fs.lock().node(self.id).map(|n| n.size()).unwrap_or(0)
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize> {
        match self.device {
            Some(CharDevice::Null) | Some(CharDevice::Tty) => return Ok(0),
            None => {}
        }
        let inner = self.fs.lock();
        let node = inner.node(self.id)?;
        if node.kind == NodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        if offset >= node.data.len() {
            return Ok(0);
        }
        let available = &node.data[offset..];
        let to_read = buf.len().min(available.len());
        buf[..to_read].copy_from_slice(&available[..to_read]);
        Ok(to_read)
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> FsResult<usize> {
        match self.device {
            Some(CharDevice::Null) => return Ok(data.len()),
            Some(CharDevice::Tty) => {
                crate::serial::_print(format_args!("{}", String::from_utf8_lossy(data)));
                return Ok(data.len());
            }
            None => {}
        }
        let mut inner = self.fs.lock();
        let node = inner.node_mut(self.id)?;
        if node.kind == NodeKind::Directory {
            return Err(FsError::IsADirectory);
        }
        let end = offset + data.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[offset..end].copy_from_slice(data);
        Ok(data.len())
    }
}

impl Drop for RamFile {
    fn drop(&mut self) {
        self.handles.fetch_sub(1, Ordering::SeqCst);
    }
}
