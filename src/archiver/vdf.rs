//! Lucasarts VDF archiver.
//!
//! Layout: 256-byte comment (ignored), 16-byte signature
//! (`"PSVDSC_V2.00"` followed by a line-ending variant, either `\r\n` or
//! `\n\r`, then two filler bytes), a 8-byte header of `{total_entries: u32
//! LE, table_offset: u32 LE}`, then at `table_offset` a flat table of
//! `total_entries` 64-byte records: `{name: [u8; 56], start: u32 LE, size:
//! u32 LE}`.
//!
//! The real format buckets entries by hash for lookup; this implementation
//! folds that table into the unpacked framework's binary search instead
//! (same simplification recorded for the other flat backends in
//! `archiver::unpacked`), since nothing downstream depends on the bucket
//! layout itself, only on name -> range lookup.

use crate::archiver::unpacked::{read_exact, Comparator, Entry, UnpackedArchive};
use crate::archiver::{ArchiveHandle, Archiver};
use crate::error::{Error, Result};
use crate::io::Io;

const COMMENT_LEN: usize = 256;
const SIGNATURE_PREFIX: &[u8] = b"PSVDSC_V2.00";

pub struct VdfArchiver;

impl Archiver for VdfArchiver {
    fn extension(&self) -> &'static str {
        "vdf"
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

        let mut comment = vec![0u8; COMMENT_LEN];
        read_exact(&mut *io, &mut comment)?;

        let mut signature = [0u8; 16];
        read_exact(&mut *io, &mut signature)?;
        if &signature[..12] != SIGNATURE_PREFIX {
            return Err(Error::Unsupported);
        }
        let line_ending = &signature[12..14];
        if line_ending != b"\r\n" && line_ending != b"\n\r" {
            return Err(Error::Unsupported);
        }

        let mut header = [0u8; 8];
        read_exact(&mut *io, &mut header)?;
        let total_entries = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let table_offset = u32::from_le_bytes(header[4..8].try_into().unwrap()) as u64;

        io.seek(table_offset)?;
        let mut entries = Vec::with_capacity(total_entries);
        for _ in 0..total_entries {
            let mut rec = [0u8; 56 + 8];
            read_exact(&mut *io, &mut rec)?;
            let end = rec[..56].iter().position(|&b| b == 0).unwrap_or(56);
            let name = String::from_utf8_lossy(&rec[..end]).into_owned();
            let start = u32::from_le_bytes(rec[56..60].try_into().unwrap()) as u64;
            let size = u32::from_le_bytes(rec[60..64].try_into().unwrap()) as u64;
            entries.push(Entry { name, start, size });
        }

        Ok(Box::new(UnpackedArchive::new(
            io,
            entries,
            Comparator::CaseSensitive,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    fn build_vdf(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = vec![0u8; COMMENT_LEN];
        out.extend_from_slice(SIGNATURE_PREFIX);
        out.extend_from_slice(b"\r\n\x1a\0");

        let mut data = Vec::new();
        let mut records = Vec::new();
        for (name, bytes) in files {
            let start = COMMENT_LEN as u64 + 16 + 8 + (files.len() as u64 * 64) + data.len() as u64;
            let mut rec = [0u8; 64];
            rec[..name.len()].copy_from_slice(name.as_bytes());
            rec[56..60].copy_from_slice(&(start as u32).to_le_bytes());
            rec[60..64].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
            records.push(rec);
            data.extend_from_slice(bytes);
        }

        let table_offset = (out.len() + 8) as u32;
        out.extend_from_slice(&(files.len() as u32).to_le_bytes());
        out.extend_from_slice(&table_offset.to_le_bytes());
        for rec in &records {
            out.extend_from_slice(rec);
        }
        out.extend_from_slice(&data);
        out
    }

    #[test]
    fn reads_back_an_entry() {
        let vdf = build_vdf(&[("a.txt", b"hello")]);
        let archiver = VdfArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vdf, None));
        let handle = archiver.open_archive(io, "x.vdf", false).unwrap();
        let (mut r, exists) = handle.open_read("a.txt").unwrap();
        assert!(exists);
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn rejects_a_bad_signature() {
        let mut buf = vec![0u8; COMMENT_LEN + 16 + 8];
        buf[COMMENT_LEN..COMMENT_LEN + 12].copy_from_slice(b"NOT_A_SIGNAT");
        let archiver = VdfArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(buf, None));
        assert_eq!(
            archiver.open_archive(io, "x.vdf", false).err(),
            Some(Error::Unsupported)
        );
    }

    #[test]
    fn accepts_the_lfcr_line_ending_variant() {
        let mut vdf = build_vdf(&[("a.txt", b"x")]);
        vdf[COMMENT_LEN + 12] = b'\n';
        vdf[COMMENT_LEN + 13] = b'\r';
        let archiver = VdfArchiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vdf, None));
        assert!(archiver.open_archive(io, "x.vdf", false).is_ok());
    }
}
