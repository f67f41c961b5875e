//! Low-level FUSE kernel wire protocol types
//!
//! Thin wrappers around the raw `fuse_abi` structs sent by the kernel, plus the
//! request/response framing used to parse and serialize them.

pub(crate) mod argument;
pub(crate) mod cuse_init_flags;
pub(crate) mod errno;
pub mod flags;
pub(crate) mod fuse_abi;
pub(crate) mod ioctl;
pub(crate) mod ioslice_concat;
pub mod reply;
pub mod request;
pub(crate) mod write_flags;

pub use reply::Response;
pub use request::{Operation, Request, RequestError};

/// Directory entry buffer filled in while building a readdir reply.
pub use reply::DirEntList as DirentBuf;
/// Directory entry buffer filled in while building a readdirplus reply.
#[cfg(feature = "abi-7-21")]
pub use reply::DirEntPlusList as DirentPlusBuf;

/// Identifier of the inode an operation applies to, as seen by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct INodeNo(pub u64);

impl From<INodeNo> for u64 {
    fn from(value: INodeNo) -> Self {
        value.0
    }
}

/// Generation number paired with an inode number to detect stale/recycled inodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(pub u64);

/// Kernel-assigned handle for an open file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

impl From<FileHandle> for u64 {
    fn from(value: FileHandle) -> Self {
        value.0
    }
}

/// Per-process identifier used to disambiguate byte-range lock owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(pub u64);

/// Identifier of a request, unique for the lifetime of the FUSE session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// FUSE protocol version negotiated during `init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32, pub u32);

/// Either "now" or a specific point in time, used for atime/mtime updates in setattr.
#[derive(Debug, Clone, Copy)]
pub enum TimeOrNow {
    SpecificTime(std::time::SystemTime),
    Now,
}

/// Byte-range lock description in the kernel's wire format.
#[derive(Debug, Clone, Copy)]
pub struct Lock {
    pub range: (u64, u64),
    pub typ: u32,
    pub pid: u32,
}

/// System error number, as accepted by the kernel in reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);

    pub fn from_i32(raw: i32) -> Errno {
        Errno(raw)
    }

    pub fn code(&self) -> i32 {
        self.0
    }
}

impl From<i32> for Errno {
    fn from(value: i32) -> Self {
        Errno(value)
    }
}
