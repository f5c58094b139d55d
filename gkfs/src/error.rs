use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error carried in RPC responses and returned by the client API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("directory not empty")]
    NotEmpty,
    #[error("not a directory")]
    NotDirectory,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no space left on device")]
    NoSpace,
    #[error("no buffer space available")]
    NoBufferSpace,
    /// Transport failure or timeout talking to a daemon
    #[error("device or resource busy")]
    Busy,
    #[error("input/output error")]
    IoError,
    #[error("os error {0}")]
    Os(i32),
}

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NoSpace => libc::ENOSPC,
            FsError::NoBufferSpace => libc::ENOBUFS,
            FsError::Busy => libc::EBUSY,
            FsError::IoError => libc::EIO,
            FsError::Os(errno) => errno,
        }
    }

    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => FsError::NotFound,
            libc::EEXIST => FsError::Exists,
            libc::ENOTEMPTY => FsError::NotEmpty,
            libc::ENOTDIR => FsError::NotDirectory,
            libc::EINVAL => FsError::InvalidArgument,
            libc::ENOSPC => FsError::NoSpace,
            libc::ENOBUFS => FsError::NoBufferSpace,
            libc::EBUSY => FsError::Busy,
            libc::EIO => FsError::IoError,
            other => FsError::Os(other),
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(e: std::io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => FsError::from_errno(errno),
            None => match e.kind() {
                std::io::ErrorKind::NotFound => FsError::NotFound,
                std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                    FsError::InvalidArgument
                }
                _ => FsError::IoError,
            },
        }
    }
}

pub type FsResult<T> = std::result::Result<T, FsError>;
