//! The error taxonomy and per-thread last-error state.

use std::collections::HashMap;
use std::fmt;
use std::thread::ThreadId;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

/// Every failure mode the core produces or propagates.
///
/// Archiver probe rejections use [`Error::Unsupported`] so the mount engine
/// knows to try the next registered backend rather than treating the failure
/// as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Error {
    Ok = 0,
    Other,
    OutOfMemory,
    NotInitialized,
    AlreadyInitialized,
    Unsupported,
    PastEof,
    FilesStillOpen,
    InvalidArgument,
    NotMounted,
    NotFound,
    SymlinkForbidden,
    NoWriteDir,
    OpenForReading,
    OpenForWriting,
    NotAFile,
    ReadOnly,
    Corrupt,
    SymlinkLoop,
    Io,
    Permission,
    NoSpace,
    BadFilename,
    Busy,
    DirNotEmpty,
    OsError,
    Duplicate,
}

impl Error {
    fn message(self) -> &'static str {
        match self {
            Error::Ok => "no error occurred",
            Error::Other => "unspecified error",
            Error::OutOfMemory => "out of memory",
            Error::NotInitialized => "not initialized",
            Error::AlreadyInitialized => "already initialized",
            Error::Unsupported => "operation not supported",
            Error::PastEof => "past end of file",
            Error::FilesStillOpen => "files still open",
            Error::InvalidArgument => "invalid argument",
            Error::NotMounted => "not mounted",
            Error::NotFound => "not found",
            Error::SymlinkForbidden => "symbolic links are forbidden",
            Error::NoWriteDir => "no write directory set",
            Error::OpenForReading => "already open for reading",
            Error::OpenForWriting => "already open for writing",
            Error::NotAFile => "not a file",
            Error::ReadOnly => "read-only filesystem",
            Error::Corrupt => "corrupt archive",
            Error::SymlinkLoop => "symbolic link loop",
            Error::Io => "i/o error",
            Error::Permission => "permission denied",
            Error::NoSpace => "no space left on device",
            Error::BadFilename => "bad filename",
            Error::Busy => "busy",
            Error::DirNotEmpty => "directory not empty",
            Error::OsError => "operating system error",
            Error::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            NotFound => Error::NotFound,
            PermissionDenied => Error::Permission,
            AlreadyExists => Error::Duplicate,
            UnexpectedEof => Error::PastEof,
            _ => Error::Io,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

static LAST_ERRORS: Mutex<Option<HashMap<ThreadId, Error>>> = Mutex::new(None);

/// Records `err` as the calling thread's last error, unless `err` is [`Error::Ok`].
///
/// Mirrors the C API's "setErrorCode ignores OK" rule so code migrating from
/// that shape keeps working: successful calls never clear a stale code this way
/// (only [`last_error`] clears it, by reading it).
pub fn set_last_error(err: Error) {
    if err == Error::Ok {
        return;
    }
    let mut guard = LAST_ERRORS.lock();
    let map = guard.get_or_insert_with(HashMap::new);
    map.insert(std::thread::current().id(), err);
}

/// Returns and clears the calling thread's last recorded error, if any.
pub fn last_error() -> Option<Error> {
    let mut guard = LAST_ERRORS.lock();
    let map = guard.as_mut()?;
    map.remove(&std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_ok_is_a_no_op() {
        set_last_error(Error::NotFound);
        set_last_error(Error::Ok);
        assert_eq!(last_error(), Some(Error::NotFound));
    }

    #[test]
    fn reading_clears_the_code() {
        set_last_error(Error::Corrupt);
        assert_eq!(last_error(), Some(Error::Corrupt));
        assert_eq!(last_error(), None);
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        assert_eq!(Error::from(io_err), Error::NotFound);
    }
}
