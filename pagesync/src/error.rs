//! Error taxonomy shared by the adapters and the page handlers.
//!
//! Storage engines report failures as errno values in whichever sign they
//! prefer. [`Errno`] stores them positive; the host boundary always sees
//! `0` or a negative status (see [`status`]).

use std::fmt;
use std::io;

use thiserror::Error;

/// A positive errno value reported by the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    pub const EIO: Errno = Errno(libc::EIO);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const ENOSPC: Errno = Errno(libc::ENOSPC);
    pub const ENOTDIR: Errno = Errno(libc::ENOTDIR);
    pub const EFBIG: Errno = Errno(libc::EFBIG);

    /// Normalizes `code` to a positive errno. Zero is not a failure code, so it
    /// is reported as `EIO`.
    pub fn new(code: i32) -> Self {
        match code.checked_abs() {
            Some(0) | None => Self::EIO,
            Some(c) => Self(c),
        }
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for io::Error {
    fn from(e: Errno) -> Self {
        io::Error::from_raw_os_error(e.0)
    }
}

#[derive(Debug, Error)]
pub enum PageSyncError {
    /// The primary cache transferred fewer bytes than a page handler asked for.
    #[error("short transfer at offset {offset}: expected {expected} bytes, got {actual}")]
    Io {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// Passed through from the storage engine unchanged.
    #[error("storage engine error: {0}")]
    Engine(Errno),

    #[error("fault beyond end of file: offset {offset}, size {size}")]
    BeyondEof { offset: u64, size: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("is a directory")]
    IsDirectory,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("value too large for defined data type")]
    Overflow,
}

impl PageSyncError {
    /// Positive errno for this error.
    pub fn errno(&self) -> Errno {
        match self {
            Self::Io { .. } => Errno::EIO,
            Self::Engine(e) => *e,
            Self::BeyondEof { .. } => Errno(libc::ENXIO),
            Self::InvalidArgument(_) => Errno(libc::EINVAL),
            Self::IsDirectory => Errno(libc::EISDIR),
            Self::Unsupported(_) => Errno(libc::ENODEV),
            Self::Overflow => Errno(libc::EOVERFLOW),
        }
    }

    /// Kernel-style negative status.
    pub fn to_status(&self) -> i32 {
        -self.errno().code()
    }

    pub fn is_short_transfer(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

impl From<Errno> for PageSyncError {
    fn from(e: Errno) -> Self {
        Self::Engine(e)
    }
}

impl From<PageSyncError> for io::Error {
    fn from(e: PageSyncError) -> Self {
        io::Error::from_raw_os_error(e.errno().code())
    }
}

pub type Result<T> = std::result::Result<T, PageSyncError>;

/// Collapses a result into the status convention the host expects: `0` on
/// success, a negative errno otherwise. Never positive.
pub fn status(res: Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => e.to_status(),
    }
}
