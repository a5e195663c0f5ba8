//! Archiver backed directly by a directory on the real filesystem.
//!
//! The only archiver that implements the write operations; every other
//! backend inherits the trait's default `Err(Error::ReadOnly)`.

use std::fs;
use std::path::PathBuf;

use super::{ArchiveHandle, Archiver, EnumerateCallback, FileType, Stat};
use crate::error::{Error, Result};
use crate::io::{Io, NativeFileIo};

pub struct DirectoryArchiver;

impl Archiver for DirectoryArchiver {
    fn extension(&self) -> &'static str {
        ""
    }

    fn open_archive(
        &self,
        _io: Box<dyn Io>,
        name: &str,
        _for_writing: bool,
    ) -> Result<Box<dyn ArchiveHandle>> {
        let base = PathBuf::from(name);
        let meta = fs::metadata(&base).map_err(Error::from)?;
        if !meta.is_dir() {
            return Err(Error::Unsupported);
        }
        Ok(Box::new(DirectoryHandle { base }))
    }
}

struct DirectoryHandle {
    base: PathBuf,
}

impl DirectoryHandle {
    fn real_path(&self, virtual_path: &str) -> PathBuf {
        let mut p = self.base.clone();
        for segment in crate::path::segments(virtual_path) {
            p.push(segment);
        }
        p
    }
}

impl ArchiveHandle for DirectoryHandle {
    fn open_read(&self, path: &str) -> Result<(Box<dyn Io>, bool)> {
        let real = self.real_path(path);
        let exists = real.exists();
        if !exists {
            return Err(Error::NotFound);
        }
        if real.is_dir() {
            return Err(Error::NotAFile);
        }
        Ok((Box::new(NativeFileIo::open_read(&real)?), true))
    }

    fn open_write(&self, path: &str, append: bool) -> Result<Box<dyn Io>> {
        let real = self.real_path(path);
        Ok(Box::new(NativeFileIo::open_write(&real, append)?))
    }

    fn enumerate_files(
        &self,
        dir: &str,
        omit_symlinks: bool,
        cb: &mut EnumerateCallback<'_>,
    ) -> Result<()> {
        let real = self.real_path(dir);
        let entries = match fs::read_dir(&real) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::from(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::from)?;
            if omit_symlinks {
                let meta = entry.path().symlink_metadata().map_err(Error::from)?;
                if meta.file_type().is_symlink() {
                    continue;
                }
            }
            if let Some(name) = entry.file_name().to_str() {
                cb(name);
            }
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<(Stat, bool)> {
        let real = self.real_path(path);
        let meta = match fs::symlink_metadata(&real) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound);
            }
            Err(e) => return Err(Error::from(e)),
        };
        let filetype = if meta.file_type().is_symlink() {
            FileType::Symlink
        } else if meta.is_dir() {
            FileType::Directory
        } else if meta.is_file() {
            FileType::Regular
        } else {
            FileType::Other
        };
        let to_secs = |t: std::io::Result<std::time::SystemTime>| {
            t.ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(Stat::UNKNOWN_TIME)
        };
        Ok((
            Stat {
                filesize: if filetype == FileType::Directory { 0 } else { meta.len() as i64 },
                modtime: to_secs(meta.modified()),
                createtime: to_secs(meta.created()),
                accesstime: to_secs(meta.accessed()),
                filetype,
                readonly: meta.permissions().readonly(),
            },
            true,
        ))
    }

    fn remove(&self, path: &str) -> Result<()> {
        let real = self.real_path(path);
        let meta = fs::symlink_metadata(&real).map_err(Error::from)?;
        if meta.is_dir() {
            match fs::remove_dir(&real) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => Err(Error::DirNotEmpty),
                Err(e) => Err(Error::from(e)),
            }
        } else {
            fs::remove_file(&real).map_err(Error::from)
        }
    }

    fn mkdir(&self, path: &str) -> Result<()> {
        let real = self.real_path(path);
        match fs::create_dir(&real) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if real.is_dir() {
                    Ok(())
                } else {
                    Err(Error::NotAFile)
                }
            }
            Err(e) => Err(Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    #[test]
    fn rejects_a_non_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("not_a_dir");
        std::fs::write(&file_path, b"x").unwrap();
        let archiver = DirectoryArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![], None));
        let result = archiver.open_archive(io, file_path.to_str().unwrap(), false);
        assert_eq!(result.err(), Some(Error::Unsupported));
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = DirectoryArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![], None));
        let handle = archiver
            .open_archive(io, dir.path().to_str().unwrap(), true)
            .unwrap();
        let mut w = handle.open_write("hello.txt", false).unwrap();
        w.write(b"hello").unwrap();
        w.flush().unwrap();
        drop(w);
        let (mut r, exists) = handle.open_read("hello.txt").unwrap();
        assert!(exists);
        let mut buf = Vec::new();
        let mut chunk = [0u8; 16];
        loop {
            let n = r.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn mkdir_on_existing_dir_succeeds_on_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = DirectoryArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![], None));
        let handle = archiver
            .open_archive(io, dir.path().to_str().unwrap(), true)
            .unwrap();
        handle.mkdir("sub").unwrap();
        assert!(handle.mkdir("sub").is_ok());
        let mut w = handle.open_write("afile", false).unwrap();
        w.write(b"x").unwrap();
        drop(w);
        assert_eq!(handle.mkdir("afile"), Err(Error::NotAFile));
    }
}
