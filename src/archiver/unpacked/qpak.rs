//! id Software's Quake PAK format.
//!
//! Layout: ASCII magic `"PACK"`, `u32` LE directory offset, `u32` LE
//! directory length; the directory is `length / 64` records of (56-byte
//! null-padded name, `u32` LE offset, `u32` LE size).

use super::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

const MAGIC: &[u8; 4] = b"PACK";
const NAME_LEN: usize = 56;
const RECORD_LEN: usize = NAME_LEN + 8;

pub struct QpakArchiver;

impl Archiver for QpakArchiver {
    fn extension(&self) -> &'static str {
        "pak"
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
        if &header[..4] != MAGIC {
            return Err(Error::Unsupported);
        }
        let dir_offset = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;
        let dir_len = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;
        if dir_len % RECORD_LEN != 0 {
            return Err(Error::Corrupt);
        }
        let count = dir_len / RECORD_LEN;

        io.seek(dir_offset)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; RECORD_LEN];
            read_exact(&mut *io, &mut rec)?;
            let name = trim_nul(&rec[..NAME_LEN]);
            let start = u32::from_le_bytes(rec[NAME_LEN..NAME_LEN + 4].try_into().unwrap()) as u64;
            let size =
                u32::from_le_bytes(rec[NAME_LEN + 4..].try_into().unwrap()) as u64;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    #[test]
    fn parses_a_minimal_pak() {
        let data = b"hi".to_vec();
        let mut rec_name = [0u8; NAME_LEN];
        rec_name[..9].copy_from_slice(b"greet.txt");

        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        let dir_offset = 12 + data.len() as u32;
        buf.extend_from_slice(&dir_offset.to_le_bytes());
        buf.extend_from_slice(&(RECORD_LEN as u32).to_le_bytes());
        buf.extend_from_slice(&data);
        buf.extend_from_slice(&rec_name);
        buf.extend_from_slice(&12u32.to_le_bytes());
        buf.extend_from_slice(&2u32.to_le_bytes());

        let archiver = QpakArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        let handle = archiver.open_archive(io, "x.pak", false).unwrap();
        let (mut r, exists) = handle.open_read("greet.txt").unwrap();
        assert!(exists);
        let mut out = [0u8; 2];
        r.read(&mut out).unwrap();
        assert_eq!(&out, b"hi");
    }
}
