//! Four more flat, uncompressed archive formats, grouped here because each
//! header/table-of-contents parser is a handful of lines once the unpacked
//! framework (`archiver::unpacked`) does the rest. All four use the
//! ASCII-case-insensitive comparator like the classic backends.

use std::sync::Arc;

use crate::archiver::unpacked::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

pub fn all_unpacked_backends() -> Vec<Arc<dyn Archiver>> {
    vec![
        Arc::new(HogArchiver),
        Arc::new(PodArchiver),
        Arc::new(RofsArchiver),
        Arc::new(SlbArchiver),
    ]
}

fn trim_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Descent's HOG format: ASCII magic `"DHF"` + a `0x00` pad byte, then
/// records of (13-byte null-padded name, `u32` LE size, data inline) until a
/// fully-zeroed record marks the end of the directory. Unlike GRP/MVL, the
/// directory and data are interleaved rather than listed up front.
pub struct HogArchiver;

impl Archiver for HogArchiver {
    fn extension(&self) -> &'static str {
        "hog"
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
        let mut magic = [0u8; 4];
        read_exact(&mut *io, &mut magic)?;
        if &magic != b"DHF\0" {
            return Err(Error::Unsupported);
        }

        let mut entries = Vec::new();
        loop {
            let mut rec = [0u8; 13 + 4];
            match read_exact_or_eof(&mut *io, &mut rec)? {
                None => break,
                Some(()) => {}
            }
            if rec.iter().all(|&b| b == 0) {
                break;
            }
            let name = trim_nul(&rec[..13]);
            let size = u32::from_le_bytes(rec[13..].try_into().unwrap()) as u64;
            let start = io.tell()?;
            io.seek(start + size)?;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

/// Reads `buf.len()` bytes, returning `Ok(None)` on a clean EOF before any
/// byte was read (used to detect the end of HOG's interleaved directory).
fn read_exact_or_eof(io: &mut dyn Io, buf: &mut [u8]) -> Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::Corrupt);
        }
        filled += n;
    }
    Ok(Some(()))
}

/// Terminal Reality's POD format.
///
/// Layout: `u32` LE entry count, 80-byte null-padded description, then
/// `count` records of (32-byte null-padded name, `u32` LE size, `u32` LE
/// offset).
pub struct PodArchiver;

impl Archiver for PodArchiver {
    fn extension(&self) -> &'static str {
        "pod"
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
        let mut count_buf = [0u8; 4];
        read_exact(&mut *io, &mut count_buf)?;
        let count = u32::from_le_bytes(count_buf) as usize;
        // Sanity: a POD with an absurd count is surely a misidentified file
        // of some other format probing first; bail so the next archiver can try.
        if count > 1_000_000 {
            return Err(Error::Unsupported);
        }
        let mut description = [0u8; 80];
        read_exact(&mut *io, &mut description)?;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; 32 + 8];
            read_exact(&mut *io, &mut rec)?;
            let name = trim_nul(&rec[..32]);
            let size = u32::from_le_bytes(rec[32..36].try_into().unwrap()) as u64;
            let start = u32::from_le_bytes(rec[36..40].try_into().unwrap()) as u64;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

/// ROFS format: ASCII magic `"ROFS"`, `u32` LE version, `u32` LE count, then
/// `count` records of (32-byte null-padded name, `u32` LE offset, `u32` LE
/// size).
pub struct RofsArchiver;

impl Archiver for RofsArchiver {
    fn extension(&self) -> &'static str {
        "rofs"
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
        if &header[..4] != b"ROFS" {
            return Err(Error::Unsupported);
        }
        let count = u32::from_le_bytes(header[8..12].try_into().unwrap()) as usize;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; 32 + 8];
            read_exact(&mut *io, &mut rec)?;
            let name = trim_nul(&rec[..32]);
            let start = u32::from_le_bytes(rec[32..36].try_into().unwrap()) as u64;
            let size = u32::from_le_bytes(rec[36..40].try_into().unwrap()) as u64;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

/// SLB format (used by some Lucasarts titles).
///
/// Layout: 4 zero bytes, `u32` LE entry count, `u32` LE table-of-contents
/// offset; the table is `count` records of (64-byte null-padded name
/// prefixed with a backslash, `u32` LE offset, `u32` LE size).
pub struct SlbArchiver;

impl Archiver for SlbArchiver {
    fn extension(&self) -> &'static str {
        "slb"
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
        if header[..4] != [0, 0, 0, 0] {
            return Err(Error::Unsupported);
        }
        let count = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let toc_offset = u32::from_le_bytes(header[8..12].try_into().unwrap()) as u64;

        io.seek(toc_offset)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let mut rec = [0u8; 64 + 8];
            read_exact(&mut *io, &mut rec)?;
            let mut name = trim_nul(&rec[..64]);
            if let Some(stripped) = name.strip_prefix('\\') {
                name = stripped.to_string();
            }
            let start = u32::from_le_bytes(rec[64..68].try_into().unwrap()) as u64;
            let size = u32::from_le_bytes(rec[68..72].try_into().unwrap()) as u64;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::AsciiCaseInsensitive,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    #[test]
    fn hog_stops_at_the_zeroed_terminator_record() {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"DHF\0");
        let mut rec_name = [0u8; 13];
        rec_name[..5].copy_from_slice(b"a.txt");
        buf.extend_from_slice(&rec_name);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[0u8; 17]);

        let archiver = HogArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        let handle = archiver.open_archive(io, "x.hog", false).unwrap();
        let mut names = Vec::new();
        handle.enumerate_files("", false, &mut |n| names.push(n.to_string())).unwrap();
        assert_eq!(names, vec!["a.txt"]);
    }

    #[test]
    fn slb_strips_the_leading_backslash() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0u8; 4]);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&20u32.to_le_bytes());
        buf.extend_from_slice(b"payload!");
        let mut rec_name = [0u8; 64];
        rec_name[..6].copy_from_slice(b"\\a.txt");
        buf.extend_from_slice(&rec_name);
        buf.extend_from_slice(&12u32.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());

        let archiver = SlbArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        let handle = archiver.open_archive(io, "x.slb", false).unwrap();
        let (_, exists) = handle.stat("a.txt").unwrap();
        assert!(exists);
    }
}
