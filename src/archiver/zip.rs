//! The ZIP archiver.
//!
//! Central-directory driven, with lazy per-entry local-header resolution
//! and symlink following with loop detection. The trickiest backend in the
//! crate by a wide margin — see SPEC_FULL.md §4.3 for the prose version of
//! everything below.

use std::sync::Mutex as StdMutex;

use flate2::{Decompress, FlushDecompress, Status};
use log::warn;
use parking_lot::Mutex;

use super::{ArchiveHandle, Archiver, EnumerateCallback, FileType, Stat};
use crate::error::{Error, Result};
use crate::io::Io;

const EOCD_SIG: u32 = 0x0605_4b50;
const CENTRAL_DIR_SIG: u32 = 0x0201_4b50;
const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const EOCD_FIXED_LEN: u64 = 22;
const MAX_EOCD_SEARCH: u64 = 65_557;
const ZIP_READBUFSIZE: usize = 16 * 1024;

/// Host-type bytes (upper byte of version-made-by) whose external
/// attributes are known *not* to be unix permission bits.
const NON_UNIX_HOST_TYPES: &[u8] = &[
    0,  // FAT
    1,  // Amiga
    2,  // VMS
    4,  // VM/CMS
    6,  // HPFS
    10, // NTFS
    11, // MVS
    13, // Acorn RISC OS
    14, // VFAT
    19, // Theos
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolveState {
    UnresolvedFile,
    UnresolvedSymlink,
    Resolving,
    Resolved,
    BrokenFile,
    BrokenSymlink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    Stored,
    Deflated,
    Other(u16),
}

struct ZipEntry {
    name: String,
    compression: Compression,
    compressed_size: u64,
    uncompressed_size: u64,
    local_header_offset: u64,
    is_symlink_candidate: bool,
    state: ResolveState,
    /// First byte of (possibly compressed) data; filled in by `resolve`.
    data_offset: u64,
    /// Final, non-symlink entry this one resolves to, once resolved.
    target: Option<usize>,
}

pub struct ZipArchiver;

impl Archiver for ZipArchiver {
    fn extension(&self) -> &'static str {
        "zip"
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
        let file_len = io.length()?;
        let (eocd_pos, central_dir_ofs, central_dir_size, entry_count) =
            locate_eocd(&mut *io, file_len)?;
        let data_start = eocd_pos
            .checked_sub(central_dir_ofs + central_dir_size)
            .ok_or(Error::Corrupt)?;

        io.seek(central_dir_ofs + data_start)?;
        let mut entries = Vec::with_capacity(entry_count as usize);
        for _ in 0..entry_count {
            let entry = read_central_dir_record(&mut *io, data_start)?;
            entries.push(entry);
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Box::new(ZipHandle {
            io: Mutex::new(io),
            entries: StdMutex::new(entries),
        }))
    }
}

fn locate_eocd(io: &mut dyn Io, file_len: u64) -> Result<(u64, u64, u64, u64)> {
    let search_len = MAX_EOCD_SEARCH.min(file_len);
    let search_start = file_len - search_len;
    io.seek(search_start)?;
    let mut buf = vec![0u8; search_len as usize];
    read_exact(io, &mut buf)?;

    let sig_bytes = EOCD_SIG.to_le_bytes();
    let pos = buf
        .windows(4)
        .rposition(|w| w == sig_bytes)
        .ok_or(Error::Unsupported)?;
    if pos + EOCD_FIXED_LEN as usize > buf.len() {
        return Err(Error::Corrupt);
    }
    let rec = &buf[pos..];
    let disk_no = u16::from_le_bytes(rec[4..6].try_into().unwrap());
    let cd_disk_no = u16::from_le_bytes(rec[6..8].try_into().unwrap());
    if disk_no != 0 || cd_disk_no != 0 {
        return Err(Error::Unsupported);
    }
    let entry_count = u16::from_le_bytes(rec[10..12].try_into().unwrap()) as u64;
    let central_dir_size = u32::from_le_bytes(rec[12..16].try_into().unwrap()) as u64;
    let central_dir_ofs = u32::from_le_bytes(rec[16..20].try_into().unwrap()) as u64;
    let comment_len = u16::from_le_bytes(rec[20..22].try_into().unwrap()) as u64;
    let eocd_pos = search_start + pos as u64;
    if eocd_pos + EOCD_FIXED_LEN + comment_len != file_len {
        return Err(Error::Unsupported);
    }
    Ok((eocd_pos, central_dir_ofs, central_dir_size, entry_count))
}

fn read_central_dir_record(io: &mut dyn Io, data_start: u64) -> Result<ZipEntry> {
    let mut fixed = [0u8; 46];
    read_exact(io, &mut fixed)?;
    let sig = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
    if sig != CENTRAL_DIR_SIG {
        return Err(Error::Corrupt);
    }
    let version_made_by = u16::from_le_bytes(fixed[4..6].try_into().unwrap());
    let host_type = (version_made_by >> 8) as u8;
    let compression_raw = u16::from_le_bytes(fixed[10..12].try_into().unwrap());
    let compressed_size = u32::from_le_bytes(fixed[20..24].try_into().unwrap()) as u64;
    let uncompressed_size = u32::from_le_bytes(fixed[24..28].try_into().unwrap()) as u64;
    let name_len = u16::from_le_bytes(fixed[28..30].try_into().unwrap()) as usize;
    let extra_len = u16::from_le_bytes(fixed[30..32].try_into().unwrap()) as usize;
    let comment_len = u16::from_le_bytes(fixed[32..34].try_into().unwrap()) as usize;
    let external_attrs = u32::from_le_bytes(fixed[38..42].try_into().unwrap());
    let local_header_offset =
        u32::from_le_bytes(fixed[42..46].try_into().unwrap()) as u64 + data_start;

    let mut name_buf = vec![0u8; name_len];
    read_exact(io, &mut name_buf)?;
    if host_type == 0 {
        for b in &mut name_buf {
            if *b == b'\\' {
                *b = b'/';
            }
        }
    }
    let name = String::from_utf8(name_buf).map_err(|_| Error::Corrupt)?;
    skip(io, extra_len + comment_len)?;

    let compression = match compression_raw {
        0 => Compression::Stored,
        8 => Compression::Deflated,
        other => Compression::Other(other),
    };
    let is_unix = !NON_UNIX_HOST_TYPES.contains(&host_type);
    let is_symlink_candidate =
        is_unix && uncompressed_size > 0 && (external_attrs >> 16) & 0o170_000 == 0o120_000;

    Ok(ZipEntry {
        name,
        compression,
        compressed_size,
        uncompressed_size,
        local_header_offset,
        is_symlink_candidate,
        state: if is_symlink_candidate {
            ResolveState::UnresolvedSymlink
        } else {
            ResolveState::UnresolvedFile
        },
        data_offset: 0,
        target: None,
    })
}

fn skip(io: &mut dyn Io, n: usize) -> Result<()> {
    let mut remaining = n;
    let mut buf = [0u8; 512];
    while remaining > 0 {
        let chunk = remaining.min(buf.len());
        read_exact(io, &mut buf[..chunk])?;
        remaining -= chunk;
    }
    Ok(())
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

pub struct ZipHandle {
    io: Mutex<Box<dyn Io>>,
    entries: StdMutex<Vec<ZipEntry>>,
}

impl ZipHandle {
    fn find_index(entries: &[ZipEntry], name: &str) -> Option<usize> {
        entries.binary_search_by(|e| e.name.as_str().cmp(name)).ok()
    }

    /// Resolves entry `idx`: parses its local header and, for symlinks,
    /// follows the link to a concrete target entry. Idempotent once the
    /// state reaches a terminal value; re-entering a `Resolving` entry is a
    /// symlink loop.
    fn resolve(&self, idx: usize) -> Result<()> {
        let (state, is_symlink) = {
            let entries = self.entries.lock().unwrap();
            (entries[idx].state, entries[idx].is_symlink_candidate)
        };
        match state {
            ResolveState::Resolved | ResolveState::BrokenFile | ResolveState::BrokenSymlink => {
                return Ok(());
            }
            ResolveState::Resolving => return Err(Error::SymlinkLoop),
            ResolveState::UnresolvedFile | ResolveState::UnresolvedSymlink => {}
        }
        self.entries.lock().unwrap()[idx].state = ResolveState::Resolving;

        let outcome = self.resolve_inner(idx, is_symlink);
        let mut entries = self.entries.lock().unwrap();
        match &outcome {
            Ok(target) => {
                entries[idx].state = ResolveState::Resolved;
                entries[idx].target = *target;
            }
            Err(Error::SymlinkLoop) => {
                entries[idx].state = ResolveState::BrokenSymlink;
                warn!("zip: symlink loop detected resolving {:?}", entries[idx].name);
            }
            Err(_) => {
                entries[idx].state = if is_symlink {
                    ResolveState::BrokenSymlink
                } else {
                    ResolveState::BrokenFile
                };
            }
        }
        outcome.map(|_| ())
    }

    fn resolve_inner(&self, idx: usize, is_symlink: bool) -> Result<Option<usize>> {
        let (local_offset, compression, uncompressed_size) = {
            let entries = self.entries.lock().unwrap();
            let e = &entries[idx];
            (e.local_header_offset, e.compression, e.uncompressed_size)
        };
        let data_offset = self.parse_local_header(local_offset, compression)?;
        self.entries.lock().unwrap()[idx].data_offset = data_offset;

        if !is_symlink {
            return Ok(None);
        }

        let mut io = self.open_raw(idx, data_offset)?;
        let mut raw_target = vec![0u8; uncompressed_size as usize];
        read_exact(&mut *io, &mut raw_target)?;
        let target_path = String::from_utf8(raw_target).map_err(|_| Error::Corrupt)?;
        let normalized = normalize_symlink_target(&target_path);

        let target_idx = {
            let entries = self.entries.lock().unwrap();
            Self::find_index(&entries, &normalized)
        }
        .ok_or(Error::Corrupt)?;

        self.resolve(target_idx)?;
        let final_idx = self.entries.lock().unwrap()[target_idx].target.unwrap_or(target_idx);
        Ok(Some(final_idx))
    }

    fn parse_local_header(&self, offset: u64, method: Compression) -> Result<u64> {
        let mut io = self.io.lock().duplicate()?;
        io.seek(offset)?;
        let mut fixed = [0u8; 30];
        read_exact(&mut *io, &mut fixed)?;
        let sig = u32::from_le_bytes(fixed[0..4].try_into().unwrap());
        if sig != LOCAL_HEADER_SIG {
            return Err(Error::Corrupt);
        }
        let local_method = u16::from_le_bytes(fixed[8..10].try_into().unwrap());
        let expected = match method {
            Compression::Stored => 0,
            Compression::Deflated => 8,
            Compression::Other(m) => m,
        };
        if local_method != expected {
            return Err(Error::Corrupt);
        }
        let name_len = u16::from_le_bytes(fixed[26..28].try_into().unwrap()) as u64;
        let extra_len = u16::from_le_bytes(fixed[28..30].try_into().unwrap()) as u64;
        Ok(offset + 30 + name_len + extra_len)
    }

    fn open_raw(&self, idx: usize, data_offset: u64) -> Result<Box<dyn Io>> {
        let (compression, compressed_size, uncompressed_size) = {
            let entries = self.entries.lock().unwrap();
            let e = &entries[idx];
            (e.compression, e.compressed_size, e.uncompressed_size)
        };
        let dup = self.io.lock().duplicate()?;
        match compression {
            Compression::Stored => Ok(Box::new(crate::io::RangeIo::new(
                dup,
                data_offset,
                uncompressed_size,
            )?)),
            Compression::Deflated => Ok(Box::new(InflatingIo::new(
                dup,
                data_offset,
                compressed_size,
                uncompressed_size,
            )?)),
            Compression::Other(_) => Err(Error::Unsupported),
        }
    }
}

/// `..` normalization for a symlink target read from within the archive:
/// interior `.` segments drop out, `..` pops the last segment (stopping at
/// the root), and the result is always relative (no leading `/`).
fn normalize_symlink_target(raw: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();
    for seg in raw.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    stack.join("/")
}

impl ArchiveHandle for ZipHandle {
    fn open_read(&self, path: &str) -> Result<(Box<dyn Io>, bool)> {
        let idx = {
            let entries = self.entries.lock().unwrap();
            Self::find_index(&entries, path)
        };
        let Some(idx) = idx else {
            return Err(Error::NotFound);
        };
        self.resolve(idx)?;
        let final_idx = self.entries.lock().unwrap()[idx].target.unwrap_or(idx);
        let data_offset = self.entries.lock().unwrap()[final_idx].data_offset;
        let io = self.open_raw(final_idx, data_offset)?;
        Ok((io, true))
    }

    fn enumerate_files(
        &self,
        dir: &str,
        _omit_symlinks: bool,
        cb: &mut EnumerateCallback<'_>,
    ) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        let prefix = if dir.is_empty() {
            String::new()
        } else {
            format!("{dir}/")
        };
        let start = entries.partition_point(|e| e.name.as_str() < prefix.as_str());
        let mut last_reported: Option<&str> = None;
        for e in &entries[start..] {
            if !e.name.starts_with(&prefix) {
                break;
            }
            let rest = &e.name[prefix.len()..];
            if rest.is_empty() {
                continue;
            }
            let child = match rest.find('/') {
                Some(slash) => &rest[..slash],
                None => rest,
            };
            if last_reported != Some(child) {
                cb(child);
                last_reported = Some(child);
            }
        }
        Ok(())
    }

    fn stat(&self, path: &str) -> Result<(Stat, bool)> {
        let entries = self.entries.lock().unwrap();
        if let Some(idx) = Self::find_index(&entries, path) {
            let e = &entries[idx];
            return Ok((
                Stat {
                    filesize: e.uncompressed_size as i64,
                    modtime: Stat::UNKNOWN_TIME,
                    createtime: Stat::UNKNOWN_TIME,
                    accesstime: Stat::UNKNOWN_TIME,
                    filetype: if e.is_symlink_candidate {
                        FileType::Symlink
                    } else {
                        FileType::Regular
                    },
                    readonly: true,
                },
                true,
            ));
        }
        let prefix = format!("{path}/");
        let is_dir = entries.iter().any(|e| e.name.starts_with(&prefix));
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

/// An `Io` over a deflate-compressed ZIP entry.
///
/// Seeking forward discards output 512 bytes at a time; seeking backward
/// tears the decompressor down and restarts from the entry's first byte.
/// This is O(target) but always correct.
struct InflatingIo {
    source: Box<dyn Io>,
    data_offset: u64,
    compressed_size: u64,
    uncompressed_size: u64,
    decompress: Decompress,
    in_buf: Vec<u8>,
    in_pos: usize,
    in_filled: usize,
    compressed_consumed: u64,
    uncompressed_position: u64,
    stream_ended: bool,
}

impl InflatingIo {
    fn new(
        mut source: Box<dyn Io>,
        data_offset: u64,
        compressed_size: u64,
        uncompressed_size: u64,
    ) -> Result<Self> {
        source.seek(data_offset)?;
        Ok(Self {
            source,
            data_offset,
            compressed_size,
            uncompressed_size,
            decompress: Decompress::new(false),
            in_buf: vec![0u8; ZIP_READBUFSIZE],
            in_pos: 0,
            in_filled: 0,
            compressed_consumed: 0,
            uncompressed_position: 0,
            stream_ended: false,
        })
    }

    fn reinit(&mut self) -> Result<()> {
        self.source.seek(self.data_offset)?;
        self.decompress = Decompress::new(false);
        self.in_pos = 0;
        self.in_filled = 0;
        self.compressed_consumed = 0;
        self.uncompressed_position = 0;
        self.stream_ended = false;
        Ok(())
    }

    fn fill_input(&mut self) -> Result<()> {
        if self.in_pos < self.in_filled || self.compressed_consumed >= self.compressed_size {
            return Ok(());
        }
        let remaining = (self.compressed_size - self.compressed_consumed) as usize;
        let want = self.in_buf.len().min(remaining);
        let n = self.source.read(&mut self.in_buf[..want])?;
        self.in_pos = 0;
        self.in_filled = n;
        self.compressed_consumed += n as u64;
        Ok(())
    }
}

impl Io for InflatingIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.uncompressed_position >= self.uncompressed_size {
            return Ok(0);
        }
        let mut produced = 0;
        while produced < buf.len() && !self.stream_ended {
            self.fill_input()?;
            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();
            let status = self
                .decompress
                .decompress(
                    &self.in_buf[self.in_pos..self.in_filled],
                    &mut buf[produced..],
                    FlushDecompress::Sync,
                )
                .map_err(|_| Error::Corrupt)?;
            let consumed_in = (self.decompress.total_in() - before_in) as usize;
            self.in_pos += consumed_in;
            let produced_now = (self.decompress.total_out() - before_out) as usize;
            produced += produced_now;
            self.uncompressed_position += produced_now as u64;
            if status == Status::StreamEnd {
                self.stream_ended = true;
                break;
            }
            if consumed_in == 0
                && produced_now == 0
                && self.in_pos >= self.in_filled
                && self.compressed_consumed >= self.compressed_size
            {
                break;
            }
        }
        Ok(produced)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.uncompressed_size {
            return Err(Error::PastEof);
        }
        if pos < self.uncompressed_position {
            self.reinit()?;
        }
        let mut discard = [0u8; 512];
        while self.uncompressed_position < pos {
            let want = (pos - self.uncompressed_position).min(512) as usize;
            let n = self.read(&mut discard[..want])?;
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok(self.uncompressed_position)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.uncompressed_size)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        let dup = self.source.duplicate()?;
        Ok(Box::new(InflatingIo::new(
            dup,
            self.data_offset,
            self.compressed_size,
            self.uncompressed_size,
        )?))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
