//! Doom's WAD format.
//!
//! Layout: ASCII magic `"IWAD"` or `"PWAD"`, `u32` LE lump count, `u32` LE
//! directory offset; the directory is `count` records of (`u32` LE offset,
//! `u32` LE size, 8-byte null-padded name).

use super::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

const NAME_LEN: usize = 8;

pub struct WadArchiver;

impl Archiver for WadArchiver {
    fn extension(&self) -> &'static str {
        "wad"
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
        let mut header = [0u8; 12];
        read_exact(&mut *io, &mut header)?;
        if &header[..4] != b"IWAD" && &header[..4] != b"PWAD" {
            return Err(Error::Unsupported);
        }
        let count = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let dir_offset = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64;

        io.seek(dir_offset)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; 8 + NAME_LEN];
            read_exact(&mut *io, &mut rec)?;
            let start = u32::from_le_bytes(rec[0..4].try_into().unwrap()) as u64;
            let size = u32::from_le_bytes(rec[4..8].try_into().unwrap()) as u64;
            let name = trim_nul(&rec[8..]);
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

/// WAD lump names are null-padded (8 bytes, never longer).
fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    #[test]
    fn rejects_missing_magic() {
        let archiver = WadArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![0u8; 12], None));
        assert_eq!(
            archiver.open_archive(io, "x", false).err(),
            Some(Error::Unsupported)
        );
    }

    #[test]
    fn parses_iwad_lumps() {
        let data = b"LEVELDATA".to_vec();
        let mut buf = Vec::new();
        buf.extend_from_slice(b"IWAD");
        buf.extend_from_slice(&1u32.to_le_bytes());
        let dir_offset = 12 + data.len() as u32;
        buf.extend_from_slice(&dir_offset.to_le_bytes());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        let mut name = [0u8; NAME_LEN];
        name[..3].copy_from_slice(b"E1M");
        buf.extend_from_slice(&name);

        let archiver = WadArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        let handle = archiver.open_archive(io, "doom.wad", false).unwrap();
        let (_, exists) = handle.stat("E1M").unwrap();
        assert!(exists);
    }
}
