//! MarFS file I/O engine: hybrid POSIX-metadata/object-store-content access.

pub mod chunk;
pub mod chunk_info;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod host_selector;
pub mod object_stream;
pub mod trash;
pub mod xattr;
pub mod xattr_store;

pub use config::Config;
pub use fs::{MarfsFilesystem, QuotaCheck};
pub use object_stream::{ObjectTransport, ReqwestTransport};
pub use xattr_store::{MdfsXattrStore, PosixXattrStore};
