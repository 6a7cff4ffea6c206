//! Typed error kinds for the engine.
//!
//! Every fallible operation in the crate returns [`Error`]. The filesystem
//! front-ends map each kind to a conventional errno via [`Error::errno`];
//! the pftool signals (`NotPackable`, `HandleFull`) are ordinary variants
//! here instead of out-of-band negative returns.

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(PathBuf),

    #[error("already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("not empty: {0}")]
    NotEmpty(PathBuf),

    #[error("cross-device reference: {0}")]
    CrossDevice(PathBuf),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("quota exceeded in namespace '{0}'")]
    QuotaExceeded(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("truncated {0}")]
    Truncated(&'static str),

    #[error("bad format in field '{field}': {detail}")]
    BadFormat {
        field: &'static str,
        detail: String,
    },

    #[error("unsupported format version {major:03}_{minor:03}")]
    UnsupportedVersion { major: u16, minor: u16 },

    #[error("overflow in {0}")]
    Overflow(&'static str),

    #[error("transport error (fatal={fatal}): {detail}")]
    Transport { fatal: bool, detail: String },

    #[error("content-length mismatch: wrote {written}, announced {announced}")]
    ContentLengthMismatch { announced: u64, written: u64 },

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("non-contiguous write at offset {offset}, logical end is {expected}")]
    NonContiguousWrite { offset: u64, expected: u64 },

    #[error("open offset {offset} not aligned to chunk stride {stride}")]
    OffsetNotAligned { offset: u64, stride: u64 },

    #[error("file handle is releasing")]
    HandleReleasing,

    #[error("packed object '{objid}': {observed} of {declared} members observed")]
    PartialPack {
        objid: String,
        observed: u64,
        declared: u64,
    },

    #[error("repack of {need} bytes would overflow chunk size {chunk_size}")]
    RepackOverflow { need: u64, chunk_size: u64 },

    #[error("file is not packable")]
    NotPackable,

    #[error("packed handle is full")]
    HandleFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map this error onto the errno the filesystem surface reports.
    pub fn errno(&self) -> i32 {
        use Error::*;
        match self {
            NotFound(_) => libc::ENOENT,
            AlreadyExists(_) => libc::EEXIST,
            NotEmpty(_) => libc::ENOTEMPTY,
            CrossDevice(_) => libc::EXDEV,
            PermissionDenied(_) => libc::EACCES,
            QuotaExceeded(_) => libc::EDQUOT,
            InvalidArgument(_) => libc::EINVAL,
            Unsupported(_) => libc::ENOSYS,
            Truncated(_) | BadFormat { .. } | UnsupportedVersion { .. } => libc::EINVAL,
            Overflow(_) => libc::ENAMETOOLONG,
            Transport { .. } | ContentLengthMismatch { .. } => libc::EIO,
            Timeout(_) => libc::EIO,
            NonContiguousWrite { .. } | OffsetNotAligned { .. } => libc::EINVAL,
            HandleReleasing => libc::EIO,
            PartialPack { .. } | RepackOverflow { .. } => libc::EIO,
            NotPackable => libc::EINVAL,
            HandleFull => libc::EFBIG,
            Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True if retrying the operation could succeed (transient transport).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { fatal: false, .. })
    }

    /// Build an error from an OS errno, attaching the path that triggered it.
    pub fn from_errno(errno: i32, path: impl Into<PathBuf>) -> Self {
        match errno {
            libc::ENOENT => Error::NotFound(path.into()),
            libc::EEXIST => Error::AlreadyExists(path.into()),
            libc::ENOTEMPTY => Error::NotEmpty(path.into()),
            libc::EXDEV => Error::CrossDevice(path.into()),
            libc::EACCES | libc::EPERM => {
                Error::PermissionDenied(path.into().display().to_string())
            }
            libc::EDQUOT => Error::QuotaExceeded(path.into().display().to_string()),
            other => Error::Io(std::io::Error::from_raw_os_error(other)),
        }
    }

    pub(crate) fn from_nix(err: nix::Error, path: impl Into<PathBuf>) -> Self {
        match err.as_errno() {
            Some(errno) => Error::from_errno(errno as i32, path),
            None => Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            )),
        }
    }
}
