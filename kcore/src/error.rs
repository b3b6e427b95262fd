//! Kernel error taxonomy.
//!
//! Mirrors the teacher's `KernelError` (POSIX-flavored variants, one per
//! errno the core can plausibly raise) but derives [`thiserror::Error`]
//! instead of hand-writing `Display`, and adds a [`KernelError::Fatal`]
//! variant for the conditions §7 of the spec calls out as panics, raised
//! through the [`fatal`] macro so every fatal site looks the same in logs.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// No such file or directory. (ENOENT)
    #[error("no such entry")]
    NoSuchEntry,
    /// IO Error. (EIO)
    #[error("I/O error")]
    IOError,
    /// Out of memory. (ENOMEM)
    #[error("no memory")]
    NoMemory,
    /// Permission denied for the requested access. (EACCES)
    #[error("invalid access")]
    InvalidAccess,
    /// Bad address. (EFAULT)
    #[error("bad address")]
    BadAddress,
    /// Device or resource busy (e.g. denied writer on a file under deny_write). (EBUSY)
    #[error("resource busy")]
    Busy,
    /// Invalid argument. (EINVAL)
    #[error("invalid argument")]
    InvalidArgument,
    /// No space left on device (data sectors or swap slots exhausted in a
    /// recoverable way, i.e. caller-visible rather than a fatal panic). (ENOSPC)
    #[error("no space left on device")]
    NoSpace,
    /// File system is corrupted (bad magic, inconsistent pointer). (EFSCORRUPTED)
    #[error("filesystem corrupted: {0}")]
    FilesystemCorrupted(&'static str),
    /// A condition the spec declares fatal: swap exhaustion, bitmap
    /// inconsistency, disk I/O failure, or allocator+evictor both exhausted.
    /// Carried as an error variant so call sites can log context before the
    /// [`fatal`] macro panics; it is never meant to be caught and handled.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Logs `$msg` at `error` level and panics, attributing every fatal
/// condition in §7 of the spec to the same call-site pattern.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let __msg = ::std::format!($($arg)*);
        ::tracing::error!(%__msg, "fatal kernel condition");
        panic!("{}", __msg);
    }};
}

pub type Result<T> = std::result::Result<T, KernelError>;
