//! Executable image loading.
//!
//! [`load`] picks a format loader for an open file, lets it map the image
//! into a target [`AddressSpace`], collects its auxiliary vector and then
//! builds the initial user stack in the same space.

pub mod elf;
pub mod stack;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use crate::fs::VfsFile;
use crate::memory::AddressSpace;

pub use elf::ElfLoader;

pub const AT_NULL: u64 = 0;
pub const AT_PHDR: u64 = 3;
pub const AT_PHENT: u64 = 4;
pub const AT_PHNUM: u64 = 5;
pub const AT_PAGESZ: u64 = 6;
pub const AT_ENTRY: u64 = 9;
pub const AT_EXECFN: u64 = 31;

/// Words available to a loader's auxiliary-vector builder.
pub const AUXV_WORDS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecError {
    FileNotFound,
    InvalidFormat,
    UnsupportedArch,
    UnsupportedType,
    MemoryError,
    ReadError,
    NoLoader,
    StackAbi,
    InvalidSpace,
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecError::FileNotFound    => write!(f, "File not found"),
            ExecError::InvalidFormat   => write!(f, "Invalid executable format"),
            ExecError::UnsupportedArch => write!(f, "Unsupported architecture"),
            ExecError::UnsupportedType => write!(f, "Unsupported ELF type (need ET_EXEC)"),
            ExecError::MemoryError     => write!(f, "Memory allocation error"),
            ExecError::ReadError       => write!(f, "File read error"),
            ExecError::NoLoader        => write!(f, "No loader recognizes the file"),
            ExecError::StackAbi        => write!(f, "Initial stack violates the entry ABI"),
            ExecError::InvalidSpace    => write!(f, "Target address space is not usable"),
        }
    }
}

/// State a loader hands from `load` to `build_auxv`.
#[derive(Debug, Default, Clone)]
pub struct LoaderScratch {
    pub entry: u64,
    pub load_base: u64,
    pub phdr: u64,
    pub phent: u64,
    pub phnum: u64,
}

/// One executable format.
pub trait BinaryLoader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Cheap check whether this loader understands `file`.
    fn probe(&self, file: &dyn VfsFile) -> bool;

    /// Map the image into `space` and record entry and load base.
    fn load(&self, file: &dyn VfsFile, space: &mut AddressSpace, scratch: &mut LoaderScratch) -> Result<(), ExecError>;

    /// Write key/value pairs ending with `AT_NULL` into `out` and return the
    /// number of words used. `None` means this format has no auxv.
    fn build_auxv(&self, _file: &dyn VfsFile, _scratch: &LoaderScratch, _out: &mut [u64]) -> Option<usize> {
        None
    }
}

/// Registered loaders, probed in registration order.
pub struct LoaderRegistry {
    loaders: Vec<Box<dyn BinaryLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        LoaderRegistry { loaders: Vec::new() }
    }

    /// Registry with every built-in format.
    pub fn with_defaults() -> Self {
        let mut registry = LoaderRegistry::new();
        registry.register(Box::new(ElfLoader));
        registry
    }

    pub fn register(&mut self, loader: Box<dyn BinaryLoader>) {
        crate::log_debug!("loader: registered '{}'", loader.name());
        self.loaders.push(loader);
    }

    pub fn select(&self, file: &dyn VfsFile) -> Option<&dyn BinaryLoader> {
        self.loaders.iter().find(|l| l.probe(file)).map(|l| l.as_ref())
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct VirtRequest<'a> {
    pub path: &'a str,
    pub file: &'a dyn VfsFile,
    pub argv: &'a [&'a [u8]],
    pub envp: &'a [&'a [u8]],
}

/// Result of loading one executable.
#[derive(Debug, Default)]
pub struct VirtImage {
    pub entry: u64,
    pub load_base: u64,
    pub user_sp: u64,
    pub loader_private: Option<Box<LoaderScratch>>,
    pub auxv: Option<Vec<u64>>,
}

/// Load `req.file` into `space` and build its initial stack.
pub fn load(
    registry: &LoaderRegistry,
    req: &VirtRequest,
    space: &mut AddressSpace,
    nx_stack: bool,
) -> Result<VirtImage, ExecError> {
    let mut image = VirtImage::default();

    let loader = registry.select(req.file).ok_or_else(|| {
        crate::log_error!("loader: no loader matched {}", req.path);
        ExecError::NoLoader
    })?;

    let mut scratch = Box::new(LoaderScratch::default());
    if let Err(err) = loader.load(req.file, space, &mut scratch) {
        crate::log_error!("loader: {} failed for {}: {}", loader.name(), req.path, err);
        return Err(err);
    }
    image.entry = scratch.entry;
    image.load_base = scratch.load_base;

    let mut aux = [0u64; AUXV_WORDS];
    match loader.build_auxv(req.file, &scratch, &mut aux) {
        Some(len) if len <= AUXV_WORDS => image.auxv = Some(aux[..len].to_vec()),
        Some(_) => crate::log_warn!("loader: auxv for {} overflowed, omitted", req.path),
        None => {}
    }
    image.loader_private = Some(scratch);

    image.user_sp = stack::setup_stack(space, req.argv, req.envp, nx_stack).map_err(|err| {
        crate::log_error!("loader: stack setup failed for {}: {}", req.path, err);
        err
    })?;

    crate::log_info!(
        "loader: {} loaded (entry={:#x} base={:#x} sp={:#x} pml4={:#x})",
        req.path,
        image.entry,
        image.load_base,
        image.user_sp,
        space.physical_base().as_u64()
    );
    Ok(image)
}
