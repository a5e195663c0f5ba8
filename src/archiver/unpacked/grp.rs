//! Ken Silverman's GRP format: `Build`-engine asset groups.
//!
//! Layout: 12-byte ASCII magic `"KenSilverman"`, `u32` LE entry count, then
//! `count` records of (12-byte space-padded name, `u32` LE size), then the
//! concatenated file data in the same order as the records.

use super::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

const MAGIC: &[u8; 12] = b"KenSilverman";
const NAME_LEN: usize = 12;

pub struct GrpArchiver;

impl Archiver for GrpArchiver {
    fn extension(&self) -> &'static str {
        "grp"
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
        let mut header = [0u8; 16];
        read_exact(&mut *io, &mut header)?;
        if &header[..12] != MAGIC {
            return Err(Error::Unsupported);
        }
        let count = u32::from_le_bytes(header[12..16].try_into().unwrap()) as usize;

        let mut raw = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; NAME_LEN + 4];
            read_exact(&mut *io, &mut rec)?;
            let name = trim_trailing(&rec[..NAME_LEN], b' ');
            let size = u32::from_le_bytes(rec[NAME_LEN..].try_into().unwrap()) as u64;
            raw.push((name, size));
        }

        let data_start = io.tell()?;
        let mut offset = data_start;
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

/// GRP names are space-padded; trim trailing padding bytes only.
fn trim_trailing(bytes: &[u8], pad: u8) -> String {
    let end = bytes.iter().rposition(|&b| b != pad).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    fn sample() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"A.TXT       ");
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(b"B.BIN       ");
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"hello\n");
        buf.extend_from_slice(&[0u8; 10]);
        buf
    }

    #[test]
    fn parses_the_spec_example_archive() {
        let archiver = GrpArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(sample(), None));
        let handle = archiver.open_archive(io, "game.grp", false).unwrap();

        let mut names = Vec::new();
        handle
            .enumerate_files("", false, &mut |n| names.push(n.to_string()))
            .unwrap();
        names.sort();
        assert_eq!(names, vec!["A.TXT", "B.BIN"]);

        let (stat, exists) = handle.stat("A.TXT").unwrap();
        assert!(exists);
        assert_eq!(stat.filesize, 5);

        let (mut r, _) = handle.open_read("A.TXT").unwrap();
        let mut buf = [0u8; 10];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
    }

    #[test]
    fn rejects_a_bad_magic() {
        let archiver = GrpArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![0u8; 16], None));
        assert_eq!(
            archiver.open_archive(io, "x", false).err(),
            Some(Error::Unsupported)
        );
    }
}
