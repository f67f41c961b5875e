//! MDFS xattr access. Split behind a trait so the engine's state machine is
//! testable without a real POSIX filesystem backing it.

use std::ffi::CString;
use std::path::Path;

use crate::marfs::error::{Error, Result};

pub trait MdfsXattrStore: Send + Sync {
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()>;
    fn remove(&self, path: &Path, name: &str) -> Result<()>;
    fn list(&self, path: &Path) -> Result<Vec<u8>>;
}

/// Talks to a real MDFS mount via the raw `lgetxattr`/`lsetxattr` family:
/// direct `libc` FFI for the `*xattr` syscall family, which the standard
/// library doesn't expose (see `channel.rs`'s `fcntl`/`ioctl` use).
pub struct PosixXattrStore;

impl MdfsXattrStore for PosixXattrStore {
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let cpath = cpath(path)?;
        let cname = cname(name)?;
        let size = unsafe { libc::lgetxattr(cpath.as_ptr(), cname.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return map_errno_absent();
        }
        let mut buf = vec![0u8; size as usize];
        let got = unsafe {
            libc::lgetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if got < 0 {
            return map_errno_absent();
        }
        buf.truncate(got as usize);
        Ok(Some(buf))
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let cpath = cpath(path)?;
        let cname = cname(name)?;
        let rc = unsafe {
            libc::lsetxattr(
                cpath.as_ptr(),
                cname.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(Error::Mdfs(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn remove(&self, path: &Path, name: &str) -> Result<()> {
        let cpath = cpath(path)?;
        let cname = cname(name)?;
        let rc = unsafe { libc::lremovexattr(cpath.as_ptr(), cname.as_ptr()) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENODATA) {
                return Ok(());
            }
            return Err(Error::Mdfs(err));
        }
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<u8>> {
        let cpath = cpath(path)?;
        let size = unsafe { libc::llistxattr(cpath.as_ptr(), std::ptr::null_mut(), 0) };
        if size < 0 {
            return Err(Error::Mdfs(std::io::Error::last_os_error()));
        }
        let mut buf = vec![0u8; size as usize];
        let got =
            unsafe { libc::llistxattr(cpath.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if got < 0 {
            return Err(Error::Mdfs(std::io::Error::last_os_error()));
        }
        buf.truncate(got as usize);
        Ok(buf)
    }
}

fn map_errno_absent<T>() -> Result<Option<T>> {
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ENODATA) {
        return Ok(None);
    }
    Err(Error::Mdfs(err))
}

fn cpath(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::Layout("path contains an interior NUL"))
}

fn cname(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Layout("xattr name contains an interior NUL"))
}

/// In-memory double used by engine tests.
#[derive(Default)]
pub struct MemXattrStore {
    entries: std::sync::Mutex<std::collections::HashMap<(std::path::PathBuf, String), Vec<u8>>>,
}

impl MemXattrStore {
    pub fn new() -> MemXattrStore {
        MemXattrStore::default()
    }
}

impl MdfsXattrStore for MemXattrStore {
    fn get(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
        let map = self.entries.lock().unwrap();
        Ok(map.get(&(path.to_path_buf(), name.to_string())).cloned())
    }

    fn set(&self, path: &Path, name: &str, value: &[u8]) -> Result<()> {
        let mut map = self.entries.lock().unwrap();
        map.insert((path.to_path_buf(), name.to_string()), value.to_vec());
        Ok(())
    }

    fn remove(&self, path: &Path, name: &str) -> Result<()> {
        let mut map = self.entries.lock().unwrap();
        map.remove(&(path.to_path_buf(), name.to_string()));
        Ok(())
    }

    fn list(&self, path: &Path) -> Result<Vec<u8>> {
        let map = self.entries.lock().unwrap();
        let mut out = Vec::new();
        for (key, _) in map.iter().filter(|(k, _)| k.0 == path) {
            out.extend_from_slice(key.1.as_bytes());
            out.push(0);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn mem_store_round_trips() {
        let store = MemXattrStore::new();
        let path = PathBuf::from("/mdfs/ns/a");
        store.set(&path, "marfs_post", b"UNI/1/0/0").unwrap();
        assert_eq!(
            store.get(&path, "marfs_post").unwrap(),
            Some(b"UNI/1/0/0".to_vec())
        );
        store.remove(&path, "marfs_post").unwrap();
        assert_eq!(store.get(&path, "marfs_post").unwrap(), None);
    }
}
