//! physvfs — a virtual file system over a writable directory and an
//! ordered stack of read-only archives.
//!
//! A [`Vfs`] owns a search path: an ordered list of mounts, each an archive
//! (ZIP, tar, 7z, iso9660, vdf, and the classic flat formats in
//! [`archiver`]) or a plain directory, optionally namespaced under a mount
//! point. Reads resolve head-to-tail across the search path; writes go to a
//! single designated write directory. See [`archiver`], [`io`], [`path`],
//! and [`error`] for the layers this builds on.

#![warn(missing_debug_implementations, rust_2018_idioms, unreachable_pub)]

pub mod archiver;
pub mod error;
pub mod io;
pub mod path;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

pub use crate::archiver::{ArchiveHandle, Archiver, FileType, Registry, Stat};
pub use crate::error::{Error, Result};
use crate::io::{Io, MemoryIo, NativeFileIo};

const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;
const MIN_BUFFER_SIZE: usize = 0;
const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

struct Mount {
    /// The path or name this was mounted from.
    source: String,
    /// Canonical mount point with no leading/trailing slash; `""` is root.
    mount_point: String,
    archive: Arc<dyn ArchiveHandle>,
}

impl Mount {
    /// Strips this mount's point off `canonical`, returning the path to
    /// hand the archive, or `None` if `canonical` doesn't live under it.
    fn strip(&self, canonical: &str) -> Option<&str> {
        if self.mount_point.is_empty() {
            return Some(canonical);
        }
        if canonical == self.mount_point {
            return Some("");
        }
        canonical
            .strip_prefix(self.mount_point.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// If `canonical` is a strict ancestor of this mount's point, the next
    /// path segment below `canonical` — the synthetic directory the mount
    /// point itself projects into the merged tree.
    fn synthetic_child(&self, canonical: &str) -> Option<&str> {
        if self.mount_point.is_empty() {
            return None;
        }
        let rest = if canonical.is_empty() {
            Some(self.mount_point.as_str())
        } else {
            self.mount_point
                .strip_prefix(canonical)
                .and_then(|r| r.strip_prefix('/'))
        }?;
        if rest.is_empty() {
            return None;
        }
        let end = memchr::memchr(b'/', rest.as_bytes()).unwrap_or(rest.len());
        Some(&rest[..end])
    }
}

struct State {
    registry: Registry,
    search_path: Vec<Mount>,
    write_mount: Option<Mount>,
    allow_symlinks: bool,
    open_read_handles: usize,
    open_write_handles: usize,
}

struct Inner {
    state: Mutex<State>,
}

/// A virtual file system instance.
///
/// Cheap to clone (an `Arc` internally); clones share the same mount state,
/// so dropping one clone does not tear anything down. Each `Vfs::new()`
/// call, on the other hand, produces a fully independent instance — this
/// crate has no process-wide global, so tests (and multi-instance
/// embedders) get isolation for free.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Vfs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Vfs")
            .field("mounts", &state.search_path.len())
            .field("write_dir", &state.write_mount.as_ref().map(|m| &m.source))
            .finish()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// Builds a fresh instance with the built-in archiver set registered
    /// and an empty search path.
    pub fn new() -> Self {
        Vfs {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry: Registry::with_builtins(),
                    search_path: Vec::new(),
                    write_mount: None,
                    allow_symlinks: false,
                    open_read_handles: 0,
                    open_write_handles: 0,
                }),
            }),
        }
    }

    /// Tears down the mount state. Refuses while any write handle is open.
    ///
    /// Open read handles do not block this: every backend's `open_read`
    /// hands back an independent duplicated [`Io`], not a reference into
    /// the archive's own state, so clearing the search path can't leave a
    /// dangling read behind the way it could in an implementation where
    /// handles alias the archive's buffers directly.
    pub fn deinit(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open_write_handles > 0 {
            return Err(Error::FilesStillOpen);
        }
        log::debug!("deinit: clearing {} mount(s)", state.search_path.len());
        state.search_path.clear();
        state.write_mount = None;
        Ok(())
    }

    /// Registers an additional archiver, rejecting a duplicate extension.
    pub fn register_archiver(&self, archiver: Arc<dyn Archiver>) -> Result<()> {
        self.inner.state.lock().registry.register(archiver)
    }

    /// Deregisters the archiver for `extension`, if one is registered.
    pub fn deregister_archiver(&self, extension: &str) -> bool {
        self.inner.state.lock().registry.deregister(extension)
    }

    /// Whether symlinks found inside archives are followed (`true`) or
    /// rejected with [`Error::SymlinkForbidden`] (`false`, the default —
    /// matching the upstream project's conservative default).
    pub fn allow_symlinks(&self) -> bool {
        self.inner.state.lock().allow_symlinks
    }

    pub fn set_allow_symlinks(&self, allow: bool) {
        self.inner.state.lock().allow_symlinks = allow;
    }

    /// Mounts `source_path` (a directory or an archive file) onto
    /// `mount_point` ("" for root), at the head of the search path unless
    /// `append` is set.
    ///
    /// A no-op, returning `Ok(())`, if `source_path` is already mounted.
    pub fn mount(&self, source_path: impl AsRef<Path>, mount_point: &str, append: bool) -> Result<()> {
        self.mount_with_ext(source_path, mount_point, None, append)
    }

    /// Like [`Vfs::mount`], but forces the archiver probe to try
    /// `archive_ext` first regardless of `source_path`'s own extension.
    pub fn mount_with_ext(
        &self,
        source_path: impl AsRef<Path>,
        mount_point: &str,
        archive_ext: Option<&str>,
        append: bool,
    ) -> Result<()> {
        let source_path = source_path.as_ref();
        let source = source_path.to_string_lossy().into_owned();
        let canon_mp = path::sanitize(mount_point)?;

        let mut state = self.inner.state.lock();
        if state.search_path.iter().any(|m| m.source == source) {
            return Ok(());
        }

        let archive = open_path_source(&state.registry, source_path, archive_ext)?;
        log::debug!("mounted '{source}' at /{canon_mp}");
        let mount = Mount {
            source,
            mount_point: canon_mp,
            archive,
        };
        if append {
            state.search_path.push(mount);
        } else {
            state.search_path.insert(0, mount);
        }
        Ok(())
    }

    /// Mounts an in-memory archive image under `name` (used only for
    /// logging and extension sniffing — there is no backing path).
    pub fn mount_memory(&self, bytes: Vec<u8>, name: &str, mount_point: &str, append: bool) -> Result<()> {
        let canon_mp = path::sanitize(mount_point)?;
        let mut state = self.inner.state.lock();
        if state.search_path.iter().any(|m| m.source == name) {
            return Ok(());
        }

        let seed: Box<dyn Io> = Box::new(MemoryIo::new(bytes, None));
        let ext = name.rsplit('.').next().map(|s| s.to_ascii_lowercase());
        let archive = probe_registry(&state.registry, seed.as_ref(), name, ext.as_deref())?;
        log::debug!("mounted in-memory archive '{name}' at /{canon_mp}");
        let mount = Mount {
            source: name.to_string(),
            mount_point: canon_mp,
            archive: Arc::from(archive),
        };
        if append {
            state.search_path.push(mount);
        } else {
            state.search_path.insert(0, mount);
        }
        Ok(())
    }

    /// Removes `source` from the search path.
    pub fn unmount(&self, source: impl AsRef<Path>) -> Result<()> {
        let source = source.as_ref().to_string_lossy();
        let mut state = self.inner.state.lock();
        let idx = state
            .search_path
            .iter()
            .position(|m| m.source == source)
            .ok_or(Error::NotMounted)?;
        state.search_path.remove(idx);
        Ok(())
    }

    /// The current search path, in resolution order, as their mount sources.
    pub fn search_path(&self) -> Vec<String> {
        self.inner.state.lock().search_path.iter().map(|m| m.source.clone()).collect()
    }

    /// Sets (or, with `None`, clears) the single directory writes go to.
    /// Refuses while any write handle is open.
    pub fn set_write_dir(&self, dir: Option<impl AsRef<Path>>) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.open_write_handles > 0 {
            return Err(Error::FilesStillOpen);
        }
        match dir {
            None => {
                state.write_mount = None;
                Ok(())
            }
            Some(dir) => {
                let dir = dir.as_ref();
                let dummy: Box<dyn Io> = Box::new(MemoryIo::new(Vec::new(), None));
                let handle = archiver::directory::DirectoryArchiver
                    .open_archive(dummy, &dir.to_string_lossy(), true)?;
                state.write_mount = Some(Mount {
                    source: dir.to_string_lossy().into_owned(),
                    mount_point: String::new(),
                    archive: Arc::from(handle),
                });
                Ok(())
            }
        }
    }

    /// The current write directory's source path, if one is set.
    pub fn write_dir(&self) -> Option<String> {
        self.inner.state.lock().write_mount.as_ref().map(|m| m.source.clone())
    }

    /// Opens `vpath` for reading, resolving it against the search path
    /// head-to-tail.
    pub fn open_read(&self, vpath: &str) -> Result<FileHandle> {
        let canon = path::sanitize(vpath)?;
        let mut state = self.inner.state.lock();
        let allow_symlinks = state.allow_symlinks;

        for mount in &state.search_path {
            let Some(archive_path) = mount.strip(&canon) else { continue };
            if !allow_symlinks {
                reject_symlink_segments(mount.archive.as_ref(), archive_path)?;
            }
            match mount.archive.open_read(archive_path) {
                Ok((io, _exists)) => {
                    state.open_read_handles += 1;
                    return Ok(FileHandle::new(Arc::clone(&self.inner), io, true));
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    /// Opens `vpath` in the write directory, truncating if it exists.
    pub fn open_write(&self, vpath: &str) -> Result<FileHandle> {
        self.open_write_internal(vpath, false)
    }

    /// Opens `vpath` in the write directory, appending if it exists.
    pub fn open_append(&self, vpath: &str) -> Result<FileHandle> {
        self.open_write_internal(vpath, true)
    }

    fn open_write_internal(&self, vpath: &str, append: bool) -> Result<FileHandle> {
        let canon = path::sanitize(vpath)?;
        let mut state = self.inner.state.lock();
        let io = {
            let mount = state.write_mount.as_ref().ok_or(Error::NoWriteDir)?;
            mount.archive.open_write(&canon, append)?
        };
        state.open_write_handles += 1;
        Ok(FileHandle::new(Arc::clone(&self.inner), io, false))
    }

    /// Removes the file or empty directory at `vpath` from the write
    /// directory.
    pub fn remove(&self, vpath: &str) -> Result<()> {
        let canon = path::sanitize(vpath)?;
        let state = self.inner.state.lock();
        let mount = state.write_mount.as_ref().ok_or(Error::NoWriteDir)?;
        mount.archive.remove(&canon)
    }

    /// Creates directory `vpath` in the write directory. The parent must
    /// already exist.
    pub fn mkdir(&self, vpath: &str) -> Result<()> {
        let canon = path::sanitize(vpath)?;
        let state = self.inner.state.lock();
        let mount = state.write_mount.as_ref().ok_or(Error::NoWriteDir)?;
        mount.archive.mkdir(&canon)
    }

    /// Stats `vpath`, resolving it against the search path head-to-tail.
    pub fn stat(&self, vpath: &str) -> Result<Stat> {
        let canon = path::sanitize(vpath)?;
        let state = self.inner.state.lock();
        for mount in &state.search_path {
            if mount.synthetic_child(&canon).is_some() {
                return Ok(Stat {
                    filesize: 0,
                    modtime: Stat::UNKNOWN_TIME,
                    createtime: Stat::UNKNOWN_TIME,
                    accesstime: Stat::UNKNOWN_TIME,
                    filetype: FileType::Directory,
                    readonly: true,
                });
            }
            let Some(archive_path) = mount.strip(&canon) else { continue };
            if !state.allow_symlinks {
                reject_symlink_segments(mount.archive.as_ref(), archive_path)?;
            }
            match mount.archive.stat(archive_path) {
                Ok((stat, true)) => return Ok(stat),
                Ok((_, false)) => continue,
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::NotFound)
    }

    /// True if `vpath` resolves to something on the search path or is a
    /// mount point's synthetic parent directory.
    pub fn exists(&self, vpath: &str) -> bool {
        self.stat(vpath).is_ok()
    }

    /// The mount `vpath` would currently resolve from, or `None` if it
    /// doesn't resolve to anything.
    pub fn real_dir(&self, vpath: &str) -> Option<String> {
        let canon = path::sanitize(vpath).ok()?;
        let state = self.inner.state.lock();
        for mount in &state.search_path {
            if mount.synthetic_child(&canon).is_some() {
                return None;
            }
            let archive_path = mount.strip(&canon)?;
            if mount.archive.stat(archive_path).is_ok() {
                return Some(mount.source.clone());
            }
        }
        None
    }

    /// Invokes `cb` once per immediate child of `vdir`, merged across every
    /// mount that contributes to it, each name reported at most once.
    pub fn enumerate(&self, vdir: &str, mut cb: impl FnMut(&str)) -> Result<()> {
        let canon = path::sanitize(vdir)?;
        let state = self.inner.state.lock();
        let mut reported = std::collections::HashSet::new();

        for mount in &state.search_path {
            if let Some(child) = mount.synthetic_child(&canon) {
                if reported.insert(child.to_string()) {
                    cb(child);
                }
                continue;
            }
            let Some(archive_path) = mount.strip(&canon) else { continue };
            let omit_symlinks = !state.allow_symlinks;
            let result = mount.archive.enumerate_files(archive_path, omit_symlinks, &mut |name| {
                if reported.insert(name.to_string()) {
                    cb(name);
                }
            });
            match result {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Applies `cfg`'s policy: sets `write_dir` as both the write directory
    /// and a search-path entry, mounts `base_dir`, and mounts every archive
    /// file directly inside `base_dir` matching `cfg`'s extension filter.
    pub fn set_sane_config(
        &self,
        cfg: &SaneConfig,
        base_dir: impl AsRef<Path>,
        write_dir: impl AsRef<Path>,
    ) -> Result<()> {
        let base_dir = base_dir.as_ref();
        self.set_write_dir(Some(write_dir.as_ref()))?;
        self.mount(write_dir.as_ref(), "", false)?;

        if cfg.include_cd_roms {
            log::debug!(
                "sane config requested CD-ROM drive discovery; out of scope for this crate, ignored"
            );
        }

        let mut archive_files = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(base_dir) {
            for entry in read_dir.flatten() {
                let candidate = entry.path();
                if !candidate.is_file() {
                    continue;
                }
                let matches = match (&cfg.archive_ext, candidate.extension().and_then(|e| e.to_str())) {
                    (Some(want), Some(got)) => want.eq_ignore_ascii_case(got),
                    (None, _) => true,
                    (Some(_), None) => false,
                };
                if matches {
                    archive_files.push(candidate);
                }
            }
        }
        archive_files.sort();

        let mount_archives = |vfs: &Vfs| -> Result<()> {
            for f in &archive_files {
                match vfs.mount(f, "", !cfg.prepend_archives) {
                    Ok(()) | Err(Error::Unsupported) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        };

        if cfg.archives_first {
            mount_archives(self)?;
            self.mount(base_dir, "", !cfg.prepend_archives)?;
        } else {
            self.mount(base_dir, "", !cfg.prepend_archives)?;
            mount_archives(self)?;
        }
        log::debug!("applied sane config for {}/{}", cfg.organization, cfg.app_name);
        Ok(())
    }
}

/// Rejects a read when any ancestor segment of `archive_path` is itself a
/// symlink inside `archive`, walking shallowest-first so a loop several
/// levels down is caught at its first offending segment rather than only
/// at the leaf.
///
/// Boundaries are tracked as byte offsets rather than rebuilt strings —
/// cheap for the common case of a handful of path segments.
fn reject_symlink_segments(archive: &dyn ArchiveHandle, archive_path: &str) -> Result<()> {
    let mut boundaries: smallvec::SmallVec<[usize; 8]> = smallvec::SmallVec::new();
    for (i, b) in archive_path.bytes().enumerate() {
        if b == b'/' {
            boundaries.push(i);
        }
    }
    if !archive_path.is_empty() {
        boundaries.push(archive_path.len());
    }
    for &end in &boundaries {
        let prefix = &archive_path[..end];
        if prefix.is_empty() {
            continue;
        }
        if let Ok((stat, true)) = archive.stat(prefix) {
            if stat.filetype == FileType::Symlink {
                return Err(Error::SymlinkForbidden);
            }
        }
    }
    Ok(())
}

/// Opens `path` (a directory or archive file) via the directory archiver
/// directly when it's a directory, otherwise by probing `registry` in
/// extension-preferred order.
fn open_path_source(
    registry: &Registry,
    path: &Path,
    preferred_ext: Option<&str>,
) -> Result<Arc<dyn ArchiveHandle>> {
    let path_str = path.to_str().ok_or(Error::InvalidArgument)?;

    if path.is_dir() {
        let dummy: Box<dyn Io> = Box::new(MemoryIo::new(Vec::new(), None));
        let handle = archiver::directory::DirectoryArchiver.open_archive(dummy, path_str, false)?;
        return Ok(Arc::from(handle));
    }

    let seed: Box<dyn Io> = Box::new(NativeFileIo::open_read(path)?);
    let ext = preferred_ext.map(str::to_string).or_else(|| {
        path.extension().and_then(|e| e.to_str()).map(|s| s.to_ascii_lowercase())
    });
    let handle = probe_registry(registry, seed.as_ref(), path_str, ext.as_deref())?;
    Ok(Arc::from(handle))
}

/// Tries each archiver `registry` knows about, extension-preferred first,
/// against independent duplicates of `seed` until one claims the stream.
fn probe_registry(
    registry: &Registry,
    seed: &dyn Io,
    name: &str,
    preferred_ext: Option<&str>,
) -> Result<Box<dyn ArchiveHandle>> {
    for archiver in registry.probe_order(preferred_ext) {
        if archiver.extension().is_empty() {
            continue; // the directory archiver never claims a byte stream
        }
        let attempt = seed.duplicate()?;
        match archiver.open_archive(attempt, name, false) {
            Ok(handle) => return Ok(handle),
            Err(Error::Unsupported) => {
                log::trace!("'{name}' is not a valid {} archive", archiver.extension());
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::Unsupported)
}

/// An open file, buffering reads and writes the way the upstream project's
/// handles do.
///
/// For a read handle, the buffer is a read-ahead window: `bufpos..buffill`
/// holds already-fetched bytes not yet returned to the caller. For a write
/// handle, `0..buffill` holds bytes accepted but not yet flushed to the
/// underlying [`Io`] (`bufpos` only moves as `flush` makes partial
/// progress). The invariant `bufpos <= buffill <= bufsize` holds across
/// every method.
pub struct FileHandle {
    inner: Arc<Inner>,
    io: Box<dyn Io>,
    for_reading: bool,
    buffer: Vec<u8>,
    bufsize: usize,
    buffill: usize,
    bufpos: usize,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("for_reading", &self.for_reading)
            .field("bufsize", &self.bufsize)
            .finish()
    }
}

impl FileHandle {
    fn new(inner: Arc<Inner>, io: Box<dyn Io>, for_reading: bool) -> Self {
        FileHandle {
            inner,
            io,
            for_reading,
            buffer: vec![0u8; DEFAULT_BUFFER_SIZE],
            bufsize: DEFAULT_BUFFER_SIZE,
            buffill: 0,
            bufpos: 0,
        }
    }

    /// Resizes the read-ahead/write-behind buffer, flushing any pending
    /// writes first.
    pub fn set_buffer(&mut self, size: usize) -> Result<()> {
        self.flush()?;
        self.buffer = vec![0u8; size];
        self.bufsize = size;
        self.buffill = 0;
        self.bufpos = 0;
        Ok(())
    }

    /// Reads up to `out.len()` bytes, returning the number actually read
    /// (`0` at end of file).
    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        if !self.for_reading {
            return Err(Error::OpenForWriting);
        }
        if out.is_empty() {
            return Ok(0);
        }
        if self.bufsize == 0 || out.len() > self.bufsize {
            let mut written = 0;
            if self.bufpos < self.buffill {
                let avail = self.buffill - self.bufpos;
                let n = avail.min(out.len());
                out[..n].copy_from_slice(&self.buffer[self.bufpos..self.bufpos + n]);
                self.bufpos += n;
                written += n;
            }
            // The buffer no longer describes bytes ending at `io.tell()` once
            // we've either drained it above or are about to read straight
            // from the Io below — drop it so `seek`'s buffered-window fast
            // path can't mistake stale bytes for a live read-ahead window.
            self.buffill = 0;
            self.bufpos = 0;
            if written < out.len() {
                written += self.io.read(&mut out[written..])?;
            }
            return Ok(written);
        }

        let mut written = 0;
        while written < out.len() {
            if self.bufpos == self.buffill {
                self.buffill = self.io.read(&mut self.buffer[..self.bufsize])?;
                self.bufpos = 0;
                if self.buffill == 0 {
                    break;
                }
            }
            let avail = self.buffill - self.bufpos;
            let want = (out.len() - written).min(avail);
            out[written..written + want].copy_from_slice(&self.buffer[self.bufpos..self.bufpos + want]);
            self.bufpos += want;
            written += want;
        }
        Ok(written)
    }

    /// Writes `data`, returning the number of bytes accepted (always
    /// `data.len()` unless the underlying `Io` errors).
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.for_reading {
            return Err(Error::OpenForReading);
        }
        if self.bufsize == 0 || data.len() > self.bufsize {
            self.flush()?;
            return self.io.write(data);
        }
        if self.buffill + data.len() > self.bufsize {
            self.flush()?;
        }
        self.buffer[self.buffill..self.buffill + data.len()].copy_from_slice(data);
        self.buffill += data.len();
        Ok(data.len())
    }

    /// Flushes any buffered writes to the underlying `Io`. A no-op for
    /// read handles. On error, bytes already written to the `Io` are
    /// dropped from the buffer but the rest is left intact for a retry.
    pub fn flush(&mut self) -> Result<()> {
        if self.for_reading {
            return Ok(());
        }
        while self.bufpos < self.buffill {
            match self.io.write(&self.buffer[self.bufpos..self.buffill])? {
                0 => return Err(Error::Io),
                n => self.bufpos += n,
            }
        }
        self.bufpos = 0;
        self.buffill = 0;
        self.io.flush()
    }

    /// Seeks to an absolute byte offset, flushing first.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        self.flush()?;
        if self.for_reading {
            let window_end = self.io.tell()?;
            let window_start = window_end - self.buffill as u64;
            if pos >= window_start && pos <= window_end {
                self.bufpos = (pos - window_start) as usize;
                return Ok(());
            }
            self.buffill = 0;
            self.bufpos = 0;
        }
        self.io.seek(pos)
    }

    /// The handle's current logical byte offset.
    pub fn tell(&self) -> Result<u64> {
        if self.for_reading {
            Ok(self.io.tell()? - self.buffill as u64 + self.bufpos as u64)
        } else {
            Ok(self.io.tell()? + self.buffill as u64)
        }
    }

    /// The underlying file's total length in bytes.
    pub fn length(&self) -> Result<u64> {
        self.io.length()
    }

    /// Whether the handle's current position is at or past end of file.
    pub fn eof(&self) -> Result<bool> {
        Ok(self.tell()? >= self.io.length()?)
    }

    /// Duplicates this handle: a fresh, independently positioned handle
    /// over the same underlying stream, its own buffer starting empty.
    pub fn duplicate(&self) -> Result<FileHandle> {
        let dup_io = self.io.duplicate()?;
        let mut state = self.inner.state.lock();
        if self.for_reading {
            state.open_read_handles += 1;
        } else {
            state.open_write_handles += 1;
        }
        drop(state);
        Ok(FileHandle::new(Arc::clone(&self.inner), dup_io, self.for_reading))
    }

    /// Flushes (for write handles) and closes the handle. On flush
    /// failure, returns the handle back to the caller alongside the error
    /// so the write isn't silently lost — retry by calling `close` again.
    pub fn close(mut self) -> std::result::Result<(), (FileHandle, Error)> {
        if !self.for_reading {
            if let Err(e) = self.flush() {
                return Err((self, e));
            }
        }
        Ok(())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if self.for_reading {
            state.open_read_handles = state.open_read_handles.saturating_sub(1);
        } else {
            state.open_write_handles = state.open_write_handles.saturating_sub(1);
        }
    }
}

impl Io for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        FileHandle::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        FileHandle::write(self, buf)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        FileHandle::seek(self, pos)
    }

    fn tell(&self) -> Result<u64> {
        FileHandle::tell(self)
    }

    fn length(&self) -> Result<u64> {
        FileHandle::length(self)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        FileHandle::duplicate(self).map(|h| Box::new(h) as Box<dyn Io>)
    }

    fn flush(&mut self) -> Result<()> {
        FileHandle::flush(self)
    }
}

/// Convenience startup policy, mirroring the upstream project's "sane
/// config" helper: mount the application's base directory, find whatever
/// archives live alongside it, and set up a per-user write directory —
/// without the caller having to hand-write each `mount` call.
#[derive(Debug, Clone)]
pub struct SaneConfig {
    pub organization: String,
    pub app_name: String,
    pub archives_first: bool,
    pub include_cd_roms: bool,
    pub prepend_archives: bool,
    pub archive_ext: Option<String>,
    buffer_size: usize,
}

impl SaneConfig {
    pub fn new(organization: impl Into<String>, app_name: impl Into<String>) -> Self {
        SaneConfig {
            organization: organization.into(),
            app_name: app_name.into(),
            archives_first: true,
            include_cd_roms: false,
            prepend_archives: false,
            archive_ext: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn set_archives_first(&mut self, v: bool) {
        self.archives_first = v;
    }

    pub fn set_include_cd_roms(&mut self, v: bool) {
        self.include_cd_roms = v;
    }

    pub fn set_prepend_archives(&mut self, v: bool) {
        self.prepend_archives = v;
    }

    pub fn set_archive_ext(&mut self, ext: impl Into<String>) {
        self.archive_ext = Some(ext.into());
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Sets the default buffer size new file handles are opened with.
    /// Returns the *previous* value on success, or rejects `size` outside
    /// `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]` by applying and returning the
    /// nearest valid value instead, leaving the config in a valid state
    /// either way.
    pub fn set_buffer_size(&mut self, size: usize) -> std::result::Result<usize, usize> {
        let clamped = size.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
        let previous = self.buffer_size;
        self.buffer_size = clamped;
        if clamped == size {
            Ok(previous)
        } else {
            Err(clamped)
        }
    }
}

/// The directory containing the running executable, if it can be
/// determined.
pub fn base_dir() -> Option<PathBuf> {
    std::env::current_exe().ok()?.parent().map(PathBuf::from)
}

/// The current user's home directory.
pub fn user_dir() -> Option<PathBuf> {
    if cfg!(windows) {
        std::env::var_os("USERPROFILE").map(PathBuf::from)
    } else {
        std::env::var_os("HOME").map(PathBuf::from)
    }
}

/// A per-user, per-application preference directory, following each
/// platform's usual convention.
pub fn pref_dir(organization: &str, app_name: &str) -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        let appdata = std::env::var_os("APPDATA")?;
        Some(Path::new(&appdata).join(organization).join(app_name))
    } else if cfg!(target_os = "macos") {
        user_dir().map(|home| home.join("Library/Application Support").join(app_name))
    } else {
        let base = std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| user_dir().map(|h| h.join(".local/share")))?;
        Some(base.join(organization).join(app_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archiver::unpacked::{Comparator, Entry, UnpackedArchive};

    fn grp_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"KenSilverman");
        out.extend_from_slice(&(files.len() as u32).to_le_bytes());
        for (name, bytes) in files {
            let mut padded = [b' '; 12];
            padded[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&padded);
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        }
        for (_, bytes) in files {
            out.extend_from_slice(bytes);
        }
        out
    }

    #[test]
    fn mounting_a_directory_resolves_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        let vfs = Vfs::new();
        vfs.mount(dir.path(), "", false).unwrap();
        let mut fh = vfs.open_read("hello.txt").unwrap();
        let mut buf = [0u8; 8];
        let n = fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn mount_point_namespaces_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let grp_path = dir.path().join("data.grp");
        std::fs::write(&grp_path, grp_bytes(&[("a.txt", b"inside")])).unwrap();
        let vfs = Vfs::new();
        vfs.mount(&grp_path, "assets", false).unwrap();
        assert!(vfs.open_read("a.txt").is_err());
        let mut fh = vfs.open_read("assets/a.txt").unwrap();
        let mut buf = [0u8; 8];
        let n = fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"inside");
    }

    #[test]
    fn mount_order_controls_which_copy_wins() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        std::fs::write(one.path().join("f.txt"), b"one").unwrap();
        std::fs::write(two.path().join("f.txt"), b"two").unwrap();

        let vfs = Vfs::new();
        vfs.mount(one.path(), "", false).unwrap();
        vfs.mount(two.path(), "", false).unwrap(); // prepended, now wins
        let mut fh = vfs.open_read("f.txt").unwrap();
        let mut buf = [0u8; 8];
        let n = fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[test]
    fn write_dir_is_isolated_from_the_search_path() {
        let archive_dir = tempfile::tempdir().unwrap();
        let write_dir = tempfile::tempdir().unwrap();
        std::fs::write(archive_dir.path().join("ro.txt"), b"readonly").unwrap();

        let vfs = Vfs::new();
        vfs.mount(archive_dir.path(), "", false).unwrap();
        vfs.set_write_dir(Some(write_dir.path())).unwrap();

        let mut fh = vfs.open_write("ro.txt").unwrap();
        fh.write(b"mutated").unwrap();
        fh.close().unwrap();

        assert!(write_dir.path().join("ro.txt").exists());
        assert_eq!(std::fs::read(archive_dir.path().join("ro.txt")).unwrap(), b"readonly");
    }

    #[test]
    fn bad_filenames_are_rejected_before_touching_any_mount() {
        let vfs = Vfs::new();
        assert_eq!(vfs.open_read("../escape").err(), Some(Error::BadFilename));
        assert_eq!(vfs.open_read("a\\b").err(), Some(Error::BadFilename));
        assert_eq!(vfs.stat("a:b").err(), Some(Error::BadFilename));
    }

    #[test]
    fn deinit_refuses_while_a_write_handle_is_open() {
        let write_dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new();
        vfs.set_write_dir(Some(write_dir.path())).unwrap();
        let _fh = vfs.open_write("held.txt").unwrap();
        assert_eq!(vfs.deinit().err(), Some(Error::FilesStillOpen));
    }

    #[test]
    fn buffered_reads_survive_a_seek_outside_the_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.bin"), b"0123456789").unwrap();
        let vfs = Vfs::new();
        vfs.mount(dir.path(), "", false).unwrap();
        let mut fh = vfs.open_read("f.bin").unwrap();
        fh.set_buffer(4).unwrap();
        let mut buf = [0u8; 2];
        fh.read(&mut buf).unwrap();
        assert_eq!(&buf, b"01");
        fh.seek(8).unwrap();
        let n = fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"89");
    }

    #[test]
    fn enumerate_merges_a_mount_points_synthetic_parent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x.txt"), b"x").unwrap();
        let vfs = Vfs::new();
        vfs.mount(dir.path(), "nested/deep", false).unwrap();
        let mut top = Vec::new();
        vfs.enumerate("", |name| top.push(name.to_string())).unwrap();
        assert_eq!(top, vec!["nested"]);
        let mut children = Vec::new();
        vfs.enumerate("nested", |name| children.push(name.to_string())).unwrap();
        assert_eq!(children, vec!["deep"]);
        let mut leaves = Vec::new();
        vfs.enumerate("nested/deep", |name| leaves.push(name.to_string())).unwrap();
        assert_eq!(leaves, vec!["x.txt"]);
    }

    #[test]
    fn unmount_removes_a_source_from_the_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let vfs = Vfs::new();
        vfs.mount(dir.path(), "", false).unwrap();
        assert_eq!(vfs.search_path().len(), 1);
        vfs.unmount(dir.path()).unwrap();
        assert_eq!(vfs.search_path().len(), 0);
        assert_eq!(vfs.unmount(dir.path()).err(), Some(Error::NotMounted));
    }

    #[test]
    fn instances_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = Vfs::new();
        let b = Vfs::new();
        a.mount(dir.path(), "", false).unwrap();
        assert!(b.search_path().is_empty());
    }

    #[test]
    fn raw_unpacked_archive_round_trips_through_the_binary_search_lookup() {
        let io: Box<dyn Io> = Box::new(io::MemoryIo::new(b"abcdefgh".to_vec(), None));
        let archive = UnpackedArchive::new(
            io,
            vec![Entry { name: "f".into(), start: 2, size: 4 }],
            Comparator::CaseSensitive,
        );
        let (mut r, exists) = archive.open_read("f").unwrap();
        assert!(exists);
        let mut buf = [0u8; 4];
        r.read(&mut buf).unwrap();
        assert_eq!(&buf, b"cdef");
    }
}
