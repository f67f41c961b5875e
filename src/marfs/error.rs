//! Engine-internal error type.
//!
//! Every MarFS engine function returns `Result<T, Error>`; the `Filesystem`
//! trait adapter converts the error kind to a raw errno at the boundary
//! (mirroring what a thread-local errno would carry in the original C).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied")]
    Permission,

    #[error("quota exceeded")]
    Quota,

    #[error("layout violation: {0}")]
    Layout(&'static str),

    #[error("operation forbidden by current layout: {0}")]
    Forbidden(&'static str),

    #[error("misaligned access: {0}")]
    Fault(&'static str),

    #[error("object store transport error (status {status:?})")]
    Transport { status: Option<u16> },

    #[error("MDFS error: {0}")]
    Mdfs(#[from] std::io::Error),

    #[error("unsupported operation or mode")]
    Unsupported,

    #[error("xattr not found")]
    NoXattr,
}

impl Error {
    /// Map an engine error to the errno the caller should see at the FUSE
    /// boundary.
    pub fn to_errno(&self) -> i32 {
        match self {
            Error::Permission => libc::EACCES,
            Error::Quota => libc::EDQUOT,
            Error::Layout(_) => libc::EINVAL,
            Error::Forbidden(_) => libc::EPERM,
            Error::Fault(_) => libc::EFAULT,
            Error::Transport { .. } => libc::EIO,
            Error::Mdfs(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Unsupported => libc::ENOSYS,
            Error::NoXattr => libc::ENODATA,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
