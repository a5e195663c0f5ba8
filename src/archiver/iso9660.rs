//! Simplified ISO9660 archiver.
//!
//! Reads a single Primary Volume Descriptor and walks the directory-record
//! tree it roots. No Joliet, no Rock Ridge, no multi-extent files, no
//! multi-session handling — exactly the "simplified" scope SPEC_FULL calls
//! for. Both-endian fields (extent location, data length) are stored
//! little-endian-first/big-endian-second in the wire format; this reader
//! always takes the little-endian half, matching the implementation's
//! choice to pick the native half named in the spec (a little-endian host
//! reads the little-endian copy).

use bitflags::bitflags;
use parking_lot::Mutex;

use super::{ArchiveHandle, Archiver, EnumerateCallback, FileType, Stat};
use crate::error::{Error, Result};
use crate::io::Io;

const SECTOR_SIZE: u64 = 2048;
const PVD_SECTOR: u64 = 16;
const ROOT_DIR_RECORD_OFFSET: usize = 156;

bitflags! {
    /// File flags byte of an ISO9660 directory record (ECMA-119 9.1.6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct DirRecordFlags: u8 {
        const HIDDEN       = 0x01;
        const DIRECTORY    = 0x02;
        const ASSOCIATED   = 0x04;
        const RECORD       = 0x08;
        const PROTECTION   = 0x10;
        const MULTI_EXTENT = 0x80;
    }
}

struct IsoEntry {
    path: String,
    start: u64,
    size: u64,
    is_dir: bool,
}

pub struct Iso9660Archiver;

impl Archiver for Iso9660Archiver {
    fn extension(&self) -> &'static str {
        "iso"
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

        let mut pvd = vec![0u8; SECTOR_SIZE as usize];
        io.seek(PVD_SECTOR * SECTOR_SIZE)?;
        read_exact(&mut *io, &mut pvd)?;

        if pvd[0] != 1 || &pvd[1..6] != b"CD001" {
            return Err(Error::Unsupported);
        }

        let root_record = &pvd[ROOT_DIR_RECORD_OFFSET..ROOT_DIR_RECORD_OFFSET + 34];
        let (root_extent, root_size) = extent_and_size(root_record)?;

        let mut entries = Vec::new();
        walk_directory(&mut *io, root_extent, root_size, "", &mut entries)?;

        Ok(Box::new(IsoHandle {
            io: Mutex::new(io),
            entries,
        }))
    }
}

fn extent_and_size(record: &[u8]) -> Result<(u64, u64)> {
    if record.len() < 18 {
        return Err(Error::Corrupt);
    }
    let extent = u32::from_le_bytes(record[2..6].try_into().unwrap()) as u64;
    let size = u32::from_le_bytes(record[10..14].try_into().unwrap()) as u64;
    Ok((extent, size))
}

fn read_exact(io: &mut dyn Io, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = io.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(Error::Corrupt);
        }
        filled += n;
    }
    Ok(())
}

/// Reads one directory's extent and recurses into its sub-directories.
///
/// Directory records never straddle a sector boundary; a record length of
/// `0` at the current offset means "skip to the next sector".
fn walk_directory(
    io: &mut dyn Io,
    extent: u64,
    size: u64,
    prefix: &str,
    out: &mut Vec<IsoEntry>,
) -> Result<()> {
    let mut remaining = vec![0u8; size as usize];
    io.seek(extent * SECTOR_SIZE)?;
    read_exact(io, &mut remaining)?;

    let mut sector_start = 0usize;
    while sector_start < remaining.len() {
        let sector = &remaining[sector_start..(sector_start + SECTOR_SIZE as usize).min(remaining.len())];
        let mut pos = 0usize;
        let mut first = true;
        while pos < sector.len() {
            let record_len = sector[pos] as usize;
            if record_len == 0 {
                break;
            }
            if pos + record_len > sector.len() || record_len < 34 {
                return Err(Error::Corrupt);
            }
            let record = &sector[pos..pos + record_len];
            let (child_extent, child_size) = extent_and_size(record)?;
            let flags = DirRecordFlags::from_bits_truncate(record[25]);
            let ident_len = record[32] as usize;
            let ident = &record[33..33 + ident_len];

            // Skip the implied "." and ".." entries (identifier byte 0x00 / 0x01).
            let is_dot_entry = ident_len == 1 && (ident[0] == 0 || ident[0] == 1);
            if !is_dot_entry {
                let name = iso_name(ident, flags.contains(DirRecordFlags::DIRECTORY));
                let path = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };
                let is_dir = flags.contains(DirRecordFlags::DIRECTORY);
                out.push(IsoEntry {
                    path: path.clone(),
                    start: child_extent * SECTOR_SIZE,
                    size: child_size,
                    is_dir,
                });
                if is_dir {
                    walk_directory(io, child_extent, child_size, &path, out)?;
                }
            }
            pos += record_len;
            first = false;
        }
        let _ = first;
        sector_start += SECTOR_SIZE as usize;
    }
    Ok(())
}

/// Strips the `;1` version suffix ISO9660 Level 1 filenames carry.
fn iso_name(ident: &[u8], is_dir: bool) -> String {
    let raw = String::from_utf8_lossy(ident).into_owned();
    if is_dir {
        raw
    } else {
        raw.split(';').next().unwrap_or(&raw).to_string()
    }
}

pub struct IsoHandle {
    io: Mutex<Box<dyn Io>>,
    entries: Vec<IsoEntry>,
}

impl IsoHandle {
    fn find(&self, path: &str) -> Option<&IsoEntry> {
        self.entries.iter().find(|e| e.path == path)
    }
}

impl ArchiveHandle for IsoHandle {
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
        let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
        for e in &self.entries {
            let Some(rest) = e.path.strip_prefix(prefix.as_str()) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            cb(rest);
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<(Stat, bool)> {
        if let Some(e) = self.find(path) {
            return Ok((
                Stat {
                    filesize: if e.is_dir { 0 } else { e.size as i64 },
                    modtime: Stat::UNKNOWN_TIME,
                    createtime: Stat::UNKNOWN_TIME,
                    accesstime: Stat::UNKNOWN_TIME,
                    filetype: if e.is_dir { FileType::Directory } else { FileType::Regular },
                    readonly: true,
                },
                true,
            ));
        }
        Err(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryIo;

    fn dir_record(name: &[u8], extent: u32, size: u32, is_dir: bool) -> Vec<u8> {
        let mut flags = 0u8;
        if is_dir {
            flags |= DirRecordFlags::DIRECTORY.bits();
        }
        let ident_len = name.len();
        let mut padded_len = 33 + ident_len;
        if padded_len % 2 != 0 {
            padded_len += 1;
        }
        let mut rec = vec![0u8; padded_len];
        rec[1] = 0; // extended attr length
        rec[2..6].copy_from_slice(&extent.to_le_bytes());
        rec[6..10].copy_from_slice(&extent.to_be_bytes());
        rec[10..14].copy_from_slice(&size.to_le_bytes());
        rec[14..18].copy_from_slice(&size.to_be_bytes());
        rec[25] = flags;
        rec[32] = ident_len as u8;
        rec[33..33 + ident_len].copy_from_slice(name);
        rec[0] = padded_len as u8;
        rec
    }

    fn build_iso(files: &[(&str, &[u8])]) -> Vec<u8> {
        // Layout: sectors 0..16 empty, sector 16 = PVD, sector 17 = root dir
        // extent, sector 18.. = file data, one file per sector for simplicity.
        let root_extent = 17u32;
        let mut root_dir = Vec::new();
        root_dir.extend(dir_record(&[0u8], root_extent, 2048, true)); // "."
        root_dir.extend(dir_record(&[1u8], root_extent, 2048, true)); // ".."
        let mut next_extent = 18u32;
        let mut file_sectors = Vec::new();
        for (name, data) in files {
            let ident = format!("{name};1");
            root_dir.extend(dir_record(ident.as_bytes(), next_extent, data.len() as u32, false));
            file_sectors.push((next_extent, *data));
            next_extent += 1;
        }
        root_dir.resize(2048, 0);

        let total_sectors = next_extent as usize;
        let mut image = vec![0u8; total_sectors * SECTOR_SIZE as usize];

        let mut pvd = vec![0u8; SECTOR_SIZE as usize];
        pvd[0] = 1;
        pvd[1..6].copy_from_slice(b"CD001");
        let root_rec = dir_record(&[0u8], root_extent, 2048, true);
        pvd[ROOT_DIR_RECORD_OFFSET..ROOT_DIR_RECORD_OFFSET + root_rec.len()].copy_from_slice(&root_rec);
        image[(PVD_SECTOR as usize) * SECTOR_SIZE as usize..(PVD_SECTOR as usize + 1) * SECTOR_SIZE as usize]
            .copy_from_slice(&pvd);

        image[(root_extent as usize) * SECTOR_SIZE as usize..(root_extent as usize) * SECTOR_SIZE as usize + root_dir.len()]
            .copy_from_slice(&root_dir);

        for (extent, data) in file_sectors {
            let start = (extent as usize) * SECTOR_SIZE as usize;
            image[start..start + data.len()].copy_from_slice(data);
        }
        image
    }

    #[test]
    fn reads_back_a_root_level_file() {
        let iso = build_iso(&[("hello.txt", b"hi there")]);
        let archiver = Iso9660Archiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(iso, None));
        let handle = archiver.open_archive(io, "x.iso", false).unwrap();
        let (mut r, exists) = handle.open_read("hello.txt").unwrap();
        assert!(exists);
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi there");
    }

    #[test]
    fn rejects_a_missing_cd001_identifier() {
        let archiver = Iso9660Archiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(vec![0u8; 40_000], None));
        assert_eq!(
            archiver.open_archive(io, "x.iso", false).err(),
            Some(Error::Unsupported)
        );
    }

    #[test]
    fn enumerate_strips_the_version_suffix() {
        let iso = build_iso(&[("a.txt", b"1")]);
        let archiver = Iso9660Archiver;
        let io: Box<dyn Io> = Box::new(MemoryIo::new(iso, None));
        let handle = archiver.open_archive(io, "x.iso", false).unwrap();
        let mut names = Vec::new();
        handle.enumerate_files("", false, &mut |n| names.push(n.to_string())).unwrap();
        assert_eq!(names, vec!["a.txt"]);
    }
}
