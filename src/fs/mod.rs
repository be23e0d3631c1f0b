pub mod error;
pub mod fd;
pub mod ramfs;

use alloc::sync::Arc;
use bitflags::bitflags;

pub use error::{FsError, FsResult};
pub use fd::{FdEntry, FdKind, FdTable};
pub use ramfs::RamFs;

bitflags! {
    /// `open(2)` flags understood by the VFS. No access bits means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0o1;
        const RDWR = 0o2;
        const CREAT = 0o100;
        const TRUNC = 0o1000;
        const APPEND = 0o2000;
    }
}

impl OpenFlags {
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY) || self.contains(OpenFlags::RDWR)
    }

    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Type of filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    Regular,
    CharDevice,
    BlockDevice,
}

/// An open file as seen by the process core and the binary loaders.
pub trait VfsFile: Send + Sync {
    /// Absolute path the file was opened by.
    fn path(&self) -> &str;

    fn kind(&self) -> NodeKind;

    fn size(&self) -> usize;

    /// Read up to `buf.len()` bytes starting at `offset`; 0 means EOF.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> FsResult<usize>;

    fn write_at(&self, offset: usize, data: &[u8]) -> FsResult<usize>;
}

pub type FileRef = Arc<dyn VfsFile>;

/// The virtual file system the process core resolves paths against.
pub trait Vfs: Send + Sync {
    fn open(&self, path: &str, flags: OpenFlags) -> FsResult<FileRef>;

    /// Give a handle back. The handle must not be used afterwards.
    fn close(&self, file: FileRef) {
        drop(file);
    }

    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;
}

/// Read the whole file into memory.
pub fn read_all(file: &dyn VfsFile) -> FsResult<alloc::vec::Vec<u8>> {
    let mut data = alloc::vec![0u8; file.size()];
    let mut done = 0;
    while done < data.len() {
        let n = file.read_at(done, &mut data[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    data.truncate(done);
    Ok(data)
}

/// Last component of a slash-separated path.
pub fn basename(path: &[u8]) -> &[u8] {
    let trimmed = match path.iter().rposition(|&b| b != b'/') {
        Some(end) => &path[..=end],
        None => return path,
    };
    match trimmed.iter().rposition(|&b| b == b'/') {
        Some(slash) => &trimmed[slash + 1..],
        None => trimmed,
    }
}

/// Resolve `path` against `cwd` into a normalized absolute path.
pub fn join_path(cwd: &str, path: &str) -> alloc::string::String {
    let mut parts: alloc::vec::Vec<&str> = alloc::vec::Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for seg in base.split('/').chain(path.split('/')) {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = alloc::string::String::from("/");
    out.push_str(&parts.join("/"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_mode_bits() {
        assert!(OpenFlags::RDONLY.readable());
        assert!(!OpenFlags::RDONLY.writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::RDWR.readable() && OpenFlags::RDWR.writable());
    }

    #[test]
    fn basename_strips_directories_and_trailing_slashes() {
        assert_eq!(basename(b"/bin/sh"), b"sh");
        assert_eq!(basename(b"prog"), b"prog");
        assert_eq!(basename(b"/usr/bin/"), b"bin");
        assert_eq!(basename(b"/"), b"/");
    }

    #[test]
    fn join_path_normalizes() {
        assert_eq!(join_path("/home", "user"), "/home/user");
        assert_eq!(join_path("/home/user", "../tmp/./x"), "/home/tmp/x");
        assert_eq!(join_path("/home", "/etc/"), "/etc");
        assert_eq!(join_path("/", ".."), "/");
    }
}
