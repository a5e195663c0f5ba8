//! Descent's MVL movie-library format.
//!
//! Layout: ASCII magic `"DMVL"`, `u32` LE entry count, then `count` records
//! of (13-byte null-padded name, `u32` LE size), then concatenated data.

use super::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

const MAGIC: &[u8; 4] = b"DMVL";
const NAME_LEN: usize = 13;

pub struct MvlArchiver;

impl Archiver for MvlArchiver {
    fn extension(&self) -> &'static str {
        "mvl"
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
        let mut header = [0u8; 8];
        read_exact(&mut *io, &mut header)?;
        if &header[..4] != MAGIC {
            return Err(Error::Unsupported);
        }
        let count = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

        let mut raw = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; NAME_LEN + 4];
            read_exact(&mut *io, &mut rec)?;
            let name = trim_nul(&rec[..NAME_LEN]);
            let size = u32::from_le_bytes(rec[NAME_LEN..].try_into().unwrap()) as u64;
            raw.push((name, size));
        }

        let mut offset = io.tell()?;
        let mut entries = Vec::with_capacity(count);
        for (name, size) in raw {
            entries.push(Entry { name, start: offset, size });
            offset += size;
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

/// MVL names are null-padded (not space-padded like GRP): trim `\0` only.
fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    #[test]
    fn parses_a_minimal_archive() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&1u32.to_le_bytes());
        let mut name = [0u8; NAME_LEN];
        name[..6].copy_from_slice(b"cut.mv");
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"xyz");

        let archiver = MvlArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        let handle = archiver.open_archive(io, "x.mvl", false).unwrap();
        let (_, exists) = handle.stat("cut.mv").unwrap();
        assert!(exists);
    }
}
