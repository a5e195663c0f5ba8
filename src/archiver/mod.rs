//! The archiver contract and registry.
//!
//! Every backend — directory, ZIP, the unpacked flat formats, tar, vdf,
//! iso9660, 7z — implements [`Archiver`] and is looked up by the registry
//! keyed on a lowercase extension string.

pub mod directory;
pub mod flat_legacy;
pub mod iso9660;
pub mod sevenzip;
pub mod tar;
pub mod unpacked;
pub mod vdf;
pub mod zip;

use crate::error::{Error, Result};
use crate::io::Io;

/// Metadata about a single named entry, mirroring the wire concept of a
/// directory-entry `stat(2)` call but restricted to what every backend can
/// report cheaply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub filesize: i64,
    pub modtime: i64,
    pub createtime: i64,
    pub accesstime: i64,
    pub filetype: FileType,
    pub readonly: bool,
}

impl Stat {
    pub const UNKNOWN_TIME: i64 = -1;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// A callback invoked once per immediate child of an enumerated directory.
pub type EnumerateCallback<'a> = dyn FnMut(&str) + 'a;

/// The contract every archive backend satisfies.
///
/// `open_archive` is the backend's sole entry point from the mount engine.
/// The stream it receives is always positioned at byte 0; on success the
/// backend takes ownership of it, on failure it must not touch it again.
/// Identification is bytewise: a backend that does not recognize the stream
/// must return [`Error::Unsupported`] so the mount engine can try the next
/// registered archiver.
pub trait Archiver: Send + Sync {
    /// The extension this archiver registers under (empty for the directory
    /// archiver, which is only ever selected explicitly).
    fn extension(&self) -> &'static str;

    fn open_archive(&self, io: Box<dyn Io>, name: &str, for_writing: bool)
    -> Result<Box<dyn ArchiveHandle>>;
}

/// The opaque per-mount state returned by `open_archive`.
pub trait ArchiveHandle: Send + Sync {
    fn open_read(&self, path: &str) -> Result<(Box<dyn Io>, bool)>;

    fn open_write(&self, _path: &str, _append: bool) -> Result<Box<dyn Io>> {
        Err(Error::ReadOnly)
    }

    fn enumerate_files(
        &self,
        dir: &str,
        omit_symlinks: bool,
        cb: &mut EnumerateCallback<'_>,
    ) -> Result<()>;

    fn stat(&self, path: &str) -> Result<(Stat, bool)>;

    fn remove(&self, _path: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }

    fn mkdir(&self, _path: &str) -> Result<()> {
        Err(Error::ReadOnly)
    }
}

/// Registry of archivers keyed by lowercase extension, consulted by the
/// mount engine's best-extension-match-first, then all-others probing order.
#[derive(Default)]
pub struct Registry {
    by_extension: Vec<(&'static str, std::sync::Arc<dyn Archiver>)>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the full built-in backend set, matching physvfs's
    /// auto-registration on init.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(std::sync::Arc::new(directory::DirectoryArchiver)).unwrap();
        reg.register(std::sync::Arc::new(zip::ZipArchiver)).unwrap();
        reg.register(std::sync::Arc::new(tar::TarArchiver)).unwrap();
        reg.register(std::sync::Arc::new(vdf::VdfArchiver)).unwrap();
        reg.register(std::sync::Arc::new(iso9660::Iso9660Archiver)).unwrap();
        reg.register(std::sync::Arc::new(sevenzip::SevenZipArchiver)).unwrap();
        for backend in flat_legacy::all_unpacked_backends() {
            reg.register(backend).unwrap();
        }
        for backend in unpacked::classic_backends() {
            reg.register(backend).unwrap();
        }
        reg
    }

    /// Registers `archiver`, rejecting a duplicate extension.
    pub fn register(&mut self, archiver: std::sync::Arc<dyn Archiver>) -> Result<()> {
        let ext = archiver.extension();
        if self.by_extension.iter().any(|(e, _)| *e == ext) {
            return Err(Error::Duplicate);
        }
        self.by_extension.push((ext, archiver));
        Ok(())
    }

    pub fn deregister(&mut self, extension: &str) -> bool {
        let ext = extension.to_ascii_lowercase();
        let before = self.by_extension.len();
        self.by_extension.retain(|(e, _)| *e != ext);
        self.by_extension.len() != before
    }

    /// Iterates backends extension-match-first: `preferred_ext` (if any and
    /// registered) comes first, then every other registered backend in
    /// registration order.
    pub fn probe_order(
        &self,
        preferred_ext: Option<&str>,
    ) -> impl Iterator<Item = &std::sync::Arc<dyn Archiver>> {
        let preferred_ext = preferred_ext.map(|e| e.to_ascii_lowercase());
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .by_extension
            .iter()
            .partition(|(e, _)| Some(e.to_string()) == preferred_ext);
        matching
            .into_iter()
            .chain(rest)
            .map(|(_, a)| a)
            .collect::<Vec<_>>()
            .into_iter()
    }
}
