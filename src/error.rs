use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No segment for the given key or ID, or the segment is being destroyed.
    NotFound,
    /// Exclusive creation collided with an existing key.
    AlreadyExists,
    /// Zero, over the configured maximum, or larger than an existing segment.
    InvalidSize,
    PermissionDenied,
    /// Page budget, segment count or ID space exhausted.
    ResourceExhausted,
    /// The memory file could not back the segment.
    AllocationFailed(String),
    /// A snapshot violated a registry invariant and cannot be restored.
    CorruptState(String),
}

impl Error {
    /// Errno the syscall layer reports for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound => libc::ENOENT,
            Error::AlreadyExists => libc::EEXIST,
            Error::InvalidSize => libc::EINVAL,
            Error::PermissionDenied => libc::EACCES,
            Error::ResourceExhausted => libc::ENOSPC,
            Error::AllocationFailed(_) => libc::ENOMEM,
            Error::CorruptState(_) => libc::EIO,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "No such segment"),
            Error::AlreadyExists => write!(f, "Segment already exists"),
            Error::InvalidSize => write!(f, "Invalid segment size"),
            Error::PermissionDenied => write!(f, "Permission denied"),
            Error::ResourceExhausted => write!(f, "Shared memory limits exhausted"),
            Error::AllocationFailed(msg) => write!(f, "Allocation failed: {}", msg),
            Error::CorruptState(msg) => write!(f, "Corrupt snapshot: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<bincode::error::EncodeError> for Error {
    fn from(err: bincode::error::EncodeError) -> Self {
        Error::CorruptState(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(err: bincode::error::DecodeError) -> Self {
        Error::CorruptState(err.to_string())
    }
}
