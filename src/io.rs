//! The polymorphic byte-stream contract every archiver and the file-handle
//! layer consume uniformly.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// A duplicable, seekable byte stream.
///
/// `tell` is monotone across successful `read`/`write`; after a successful
/// `seek(n)`, `tell()` returns `n`. `duplicate` must produce an independent
/// position; whether storage is shared depends on the concrete impl.
pub trait Io: Send {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn tell(&self) -> Result<u64>;
    fn length(&self) -> Result<u64>;
    fn duplicate(&self) -> Result<Box<dyn Io>>;
    fn flush(&mut self) -> Result<()>;
}

/// An `Io` backed by a real file on the native filesystem.
pub struct NativeFileIo {
    file: File,
    path: PathBuf,
    writable: bool,
}

impl NativeFileIo {
    pub fn open_read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(Error::from)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable: false,
        })
    }

    pub fn open_write(path: &Path, append: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(Error::from)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            writable: true,
        })
    }
}

impl Io for NativeFileIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        use std::io::Read;
        self.file.read(buf).map_err(Error::from)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(Error::ReadOnly);
        }
        use std::io::Write;
        self.file.write(buf).map_err(Error::from)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        use std::io::{Seek, SeekFrom};
        if !self.writable {
            let len = self.length()?;
            if pos > len {
                return Err(Error::PastEof);
            }
        }
        self.file.seek(SeekFrom::Start(pos)).map_err(Error::from)?;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        // The trait exposes tell() as a read-only query, so seek on a clone
        // of the fd rather than widen this method to &mut self.
        let mut dup = self.file.try_clone().map_err(Error::from)?;
        dup.seek(SeekFrom::Current(0)).map_err(Error::from)
    }

    fn length(&self) -> Result<u64> {
        self.file.metadata().map(|m| m.len()).map_err(Error::from)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        if self.writable {
            Ok(Box::new(NativeFileIo::open_write(&self.path, false)?))
        } else {
            Ok(Box::new(NativeFileIo::open_read(&self.path)?))
        }
    }

    fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        use std::io::Write;
        self.file.flush().map_err(Error::from)
    }
}

type Destructor = Box<dyn Fn(&[u8]) + Send + Sync>;

struct MemoryBuffer {
    bytes: Vec<u8>,
    refcount: Mutex<usize>,
    destructor: Option<Destructor>,
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        if let Some(d) = &self.destructor {
            d(&self.bytes);
        }
    }
}

/// An `Io` backed by an in-memory buffer shared read-only across duplicates.
///
/// The buffer's refcount lives behind the shared [`Arc`]; the destructor, if
/// any, fires exactly once when the last reference is dropped.
pub struct MemoryIo {
    buffer: Arc<MemoryBuffer>,
    pos: u64,
}

impl MemoryIo {
    pub fn new(bytes: Vec<u8>, destructor: Option<Destructor>) -> Self {
        let buffer = Arc::new(MemoryBuffer {
            bytes,
            refcount: Mutex::new(1),
            destructor,
        });
        Self { buffer, pos: 0 }
    }

    /// Number of outstanding references to the underlying buffer.
    pub fn refcount(&self) -> usize {
        *self.buffer.refcount.lock()
    }
}

impl Io for MemoryIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = &self.buffer.bytes;
        if self.pos >= data.len() as u64 {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.buffer.bytes.len() as u64 {
            return Err(Error::PastEof);
        }
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok(self.pos)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.buffer.bytes.len() as u64)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        *self.buffer.refcount.lock() += 1;
        Ok(Box::new(MemoryIo {
            buffer: Arc::clone(&self.buffer),
            pos: 0,
        }))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Clone for MemoryIo {
    fn clone(&self) -> Self {
        *self.buffer.refcount.lock() += 1;
        Self {
            buffer: Arc::clone(&self.buffer),
            pos: 0,
        }
    }
}

impl Drop for MemoryIo {
    fn drop(&mut self) {
        *self.buffer.refcount.lock() -= 1;
    }
}

/// An `Io` that clamps another `Io` to a `[base, base + size)` byte window.
///
/// Used by the unpacked-archive framework and by ZIP's stored (uncompressed)
/// entries, whose bytes are a contiguous range within the archive's own
/// stream.
pub struct RangeIo {
    inner: Box<dyn Io>,
    base: u64,
    size: u64,
    pos: u64,
}

impl RangeIo {
    pub fn new(mut inner: Box<dyn Io>, base: u64, size: u64) -> Result<Self> {
        inner.seek(base)?;
        Ok(Self {
            inner,
            base,
            size,
            pos: 0,
        })
    }
}

impl Io for RangeIo {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        let remaining = (self.size - self.pos) as usize;
        let want = buf.len().min(remaining);
        let n = self.inner.read(&mut buf[..want])?;
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<usize> {
        Err(Error::ReadOnly)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.size {
            return Err(Error::PastEof);
        }
        self.inner.seek(self.base + pos)?;
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> Result<u64> {
        Ok(self.pos)
    }

    fn length(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn duplicate(&self) -> Result<Box<dyn Io>> {
        let dup = self.inner.duplicate()?;
        Ok(Box::new(RangeIo::new(dup, self.base, self.size)?))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_io_clamps_reads_to_its_window() {
        let inner: Box<dyn Io> = Box::new(MemoryIo::new(b"0123456789".to_vec(), None));
        let mut r = RangeIo::new(inner, 3, 4).unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456");
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn range_io_seek_past_window_is_past_eof() {
        let inner: Box<dyn Io> = Box::new(MemoryIo::new(b"0123456789".to_vec(), None));
        let mut r = RangeIo::new(inner, 0, 4).unwrap();
        assert_eq!(r.seek(5), Err(Error::PastEof));
        assert!(r.seek(4).is_ok());
    }

    #[test]
    fn memory_io_reads_back_what_was_written_in() {
        let mut io = MemoryIo::new(b"hello world".to_vec(), None);
        let mut buf = [0u8; 5];
        assert_eq!(io.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(io.tell().unwrap(), 5);
    }

    #[test]
    fn memory_io_seek_past_end_is_past_eof() {
        let mut io = MemoryIo::new(b"abc".to_vec(), None);
        assert_eq!(io.seek(10), Err(Error::PastEof));
        assert!(io.seek(3).is_ok());
    }

    #[test]
    fn memory_io_duplicate_shares_buffer_and_refcounts() {
        let io = MemoryIo::new(b"shared".to_vec(), None);
        assert_eq!(io.refcount(), 1);
        let dup = io.duplicate().unwrap();
        assert_eq!(io.refcount(), 2);
        drop(dup);
        assert_eq!(io.refcount(), 1);
    }

    #[test]
    fn memory_io_destructor_fires_once_when_last_reference_drops() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let io = MemoryIo::new(
            b"x".to_vec(),
            Some(Box::new(move |_| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let dup = io.duplicate().unwrap();
        drop(dup);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(io);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
