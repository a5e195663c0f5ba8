//! Ustar/GNU tar archiver.
//!
//! Tar has no central directory: entries are discovered by walking 512-byte
//! header blocks sequentially, each followed by its data rounded up to the
//! next 512-byte boundary. The archive ends at two consecutive zeroed
//! blocks. Unlike the other flat backends this one does carry real
//! directories (tar headers record typeflag `5`), so `enumerate_files`
//! reports proper immediate children rather than a fully flat namespace.

use parking_lot::Mutex;

use super::{ArchiveHandle, Archiver, EnumerateCallback, FileType, Stat};
use crate::error::{Error, Result};
use crate::io::Io;

const BLOCK_SIZE: u64 = 512;

struct TarEntry {
    name: String,
    start: u64,
    size: u64,
    is_dir: bool,
}

pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn extension(&self) -> &'static str {
        "tar"
    }

    fn open_archive(
        &self,
        mut io: Box<dyn Io>,
        _name: &str,
        for_writing: bool,
    ) -> Result<Box<dyn ArchiveHandle>> {
        if for_writing {
            return Err(Error::ReadOnly);
        }
        let mut entries = Vec::new();
        io.seek(0)?;
        let mut block = [0u8; BLOCK_SIZE as usize];
        let mut zero_blocks_seen = 0;
        let mut saw_any = false;

        loop {
            let n = read_fully(&mut *io, &mut block)?;
            if n == 0 {
                break;
            }
            if n < BLOCK_SIZE as usize {
                return Err(if saw_any { Error::Corrupt } else { Error::Unsupported });
            }
            if block.iter().all(|&b| b == 0) {
                zero_blocks_seen += 1;
                if zero_blocks_seen >= 2 {
                    break;
                }
                continue;
            }
            zero_blocks_seen = 0;

            if !saw_any {
                // First header must look like ustar/gnu-tar or we're not a tar at all.
                if &block[257..263] != b"ustar\0" && &block[257..263] != b"ustar " {
                    return Err(Error::Unsupported);
                }
            }
            saw_any = true;

            let name = parse_name(&block);
            let size = parse_octal(&block[124..136]).ok_or(Error::Corrupt)?;
            let typeflag = block[156];
            let is_dir = typeflag == b'5' || name.ends_with('/');
            let data_start = io.tell()?;

            if typeflag == b'0' || typeflag == 0 || is_dir {
                entries.push(TarEntry {
                    name: name.trim_end_matches('/').to_string(),
                    start: data_start,
                    size: if is_dir { 0 } else { size },
                    is_dir,
                });
            }
            // Other typeflags (symlink, hardlink, device nodes) are skipped:
            // out of scope for this implementation.

            if !is_dir && size > 0 {
                let padded = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
                io.seek(data_start + padded)?;
            }
        }

        Ok(Box::new(TarHandle {
            io: Mutex::new(io),
            entries,
        }))
    }
}

fn read_fully(io: &mut dyn Io, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn parse_name(block: &[u8; 512]) -> String {
    let end = block[0..100].iter().position(|&b| b == 0).unwrap_or(100);
    let mut name = String::from_utf8_lossy(&block[0..end]).into_owned();
    let prefix_end = block[345..500].iter().position(|&b| b == 0).unwrap_or(500 - 345);
    if prefix_end > 0 {
        let prefix = String::from_utf8_lossy(&block[345..345 + prefix_end]).into_owned();
        name = format!("{prefix}/{name}");
    }
    name
}

fn parse_octal(field: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(field).ok()?;
    let trimmed = s.trim_matches(|c: char| c == '\0' || c == ' ');
    if trimmed.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(trimmed, 8).ok()
}

pub struct TarHandle {
    io: Mutex<Box<dyn Io>>,
    entries: Vec<TarEntry>,
}

impl TarHandle {
    fn find(&self, path: &str) -> Option<&TarEntry> {
        self.entries.iter().find(|e| e.name == path)
    }
}

impl ArchiveHandle for TarHandle {
    fn open_read(&self, path: &str) -> Result<(Box<dyn Io>, bool)> {
        match self.find(path) {
            Some(e) if !e.is_dir => {
                let dup = self.io.lock().duplicate()?;
                Ok((Box::new(crate::io::RangeIo::new(dup, e.start, e.size)?), true))
            }
            Some(_) => Err(Error::NotAFile),
            None => Err(Error::NotFound),
        }
    }

    fn enumerate_files(
        &self,
        dir: &str,
        _omit_symlinks: bool,
        cb: &mut EnumerateCallback<'_>,
    ) -> Result<()> {
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let mut reported = std::collections::HashSet::new();
        for e in &self.entries {
            let Some(rest) = e.name.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() {
                continue;
            }
            let child = match rest.find('/') {
                Some(slash) => &rest[..slash],
                None => rest,
            };
            if reported.insert(child) {
                cb(child);
            }
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<(Stat, bool)> {
        if let Some(e) = self.find(path) {
            return Ok((
                Stat {
                    filesize: e.size as i64,
                    modtime: Stat::UNKNOWN_TIME,
                    createtime: Stat::UNKNOWN_TIME,
                    accesstime: Stat::UNKNOWN_TIME,
                    filetype: if e.is_dir { FileType::Directory } else { FileType::Regular },
                    readonly: true,
                },
                true,
            ));
        }
        let prefix = format!("{path}/");
        let is_dir = self.entries.iter().any(|e| e.name.starts_with(&prefix));
        if is_dir {
            Ok((
                Stat {
                    filesize: 0,
                    modtime: Stat::UNKNOWN_TIME,
                    createtime: Stat::UNKNOWN_TIME,
                    accesstime: Stat::UNKNOWN_TIME,
                    filetype: FileType::Directory,
                    readonly: true,
                },
                true,
            ))
        } else {
            Err(Error::NotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    fn header(name: &str, size: u64, typeflag: u8) -> [u8; 512] {
        let mut block = [0u8; 512];
        block[..name.len()].copy_from_slice(name.as_bytes());
        let size_oct = format!("{size:011o}\0");
        block[124..124 + size_oct.len()].copy_from_slice(size_oct.as_bytes());
        block[156] = typeflag;
        block[257..263].copy_from_slice(b"ustar\0");
        block
    }

    fn build_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, data) in files {
            out.extend_from_slice(&header(name, data.len() as u64, b'0'));
            out.extend_from_slice(data);
            let pad = (BLOCK_SIZE as usize - data.len() % BLOCK_SIZE as usize) % BLOCK_SIZE as usize;
            out.extend(std::iter::repeat_n(0u8, pad));
        }
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[test]
    fn reads_back_a_stored_file() {
        let tar = build_tar(&[("hello.txt", b"hi there")]);
        let archiver = TarArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(tar, None));
        let handle = archiver.open_archive(io, "x.tar", false).unwrap();
        let (mut r, exists) = handle.open_read("hello.txt").unwrap();
        assert!(exists);
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi there");
    }

    #[test]
    fn rejects_a_non_ustar_first_block() {
        let archiver = TarArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![1u8; 1024], None));
        assert_eq!(
            archiver.open_archive(io, "x.tar", false).err(),
            Some(Error::Unsupported)
        );
    }
}
