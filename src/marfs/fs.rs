//! `MarfsFilesystem` — wires the MarFS file I/O engine into the vendored
//! `Filesystem` trait. Path resolution, xattr enforcement, and the ftruncate/
//! unlink/utimens operations live here; everything object-layout-specific is
//! delegated to `FileHandle`.
//!
//! Mapping kernel inodes to MarFS mount-relative paths, and the directory
//! passthroughs (`readdir`/`opendir`/`releasedir`), are orthogonal plumbing
//! this adapter keeps minimal — they carry no engine state and MDFS
//! directories are ordinary POSIX directories, so the trait's own defaults
//! already cover them.

use std::ffi::OsStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bimap::BiMap;
use dashmap::DashMap;

use crate::access_flags::AccessFlags;
use crate::container::Container as Bytes;
use crate::ll::{Errno, FileHandle as FhId, INodeNo, TimeOrNow};
use crate::marfs::chunk_info::CHUNK_INFO_SIZE;
use crate::marfs::config::{Config, IPerms};
use crate::marfs::error::Error;
use crate::marfs::handle::FileHandle;
use crate::marfs::object_stream::ObjectTransport;
use crate::marfs::trash::{Trash, TrashReason};
use crate::marfs::xattr::{self, ObjType, Post};
use crate::marfs::xattr_store::MdfsXattrStore;
use crate::open_flags::OpenFlags as FuseOpenFlags;
use crate::reply::{Entry, Open, ReplyHandler, Statfs};
use crate::request_param::Request;
use crate::{FileAttr, FileType, KernelConfig};

const ROOT_INO: u64 = 1;

/// A pluggable, advisory quota check invoked from `mknod`. Absent by
/// default: always allows.
pub trait QuotaCheck: Send + Sync {
    fn check(&self, namespace: &str) -> bool;
}

pub struct MarfsFilesystem<T: ObjectTransport, X: MdfsXattrStore> {
    config: Config,
    transport: Arc<T>,
    xstore: Arc<X>,
    trash: Trash,
    quota: Option<Arc<dyn QuotaCheck>>,

    inodes: Mutex<BiMap<u64, String>>,
    next_ino: AtomicU64,
    next_fh: AtomicU64,
    next_object_id: AtomicU64,
    open_handles: DashMap<u64, Mutex<FileHandle<T, X>>>,
}

impl<T: ObjectTransport + 'static, X: MdfsXattrStore + 'static> MarfsFilesystem<T, X> {
    pub fn new(
        config: Config,
        transport: Arc<T>,
        xstore: Arc<X>,
        trash_root: std::path::PathBuf,
    ) -> MarfsFilesystem<T, X> {
        let mut inodes = BiMap::new();
        inodes.insert(ROOT_INO, "/".to_string());
        MarfsFilesystem {
            config,
            transport,
            xstore,
            trash: Trash::new(trash_root),
            quota: None,
            inodes: Mutex::new(inodes),
            next_ino: AtomicU64::new(2),
            next_fh: AtomicU64::new(1),
            next_object_id: AtomicU64::new(1),
            open_handles: DashMap::new(),
        }
    }

    pub fn with_quota_check(mut self, quota: Arc<dyn QuotaCheck>) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Open a handle at a caller-specified chunk-aligned offset for N:1
    /// parallel writing, registering it in the open-handle table exactly
    /// like `open`. There is no FUSE request that carries an offset at open
    /// time, so a coordinating parallel-write tool calls this directly
    /// against the mounted `MarfsFilesystem` instead of going through the
    /// kernel `open` path; the caller is responsible for later invoking
    /// `utime` on the path (which drives `setattr`) to finalize the write.
    pub fn open_at_offset(
        &self,
        ino: INodeNo,
        flags: FuseOpenFlags,
        offset: u64,
    ) -> Result<u64, Error> {
        let path = self.mount_path(ino).ok_or(Error::Layout("unknown inode"))?;
        let info = self.config.resolve(&path)?;
        let handle = FileHandle::open(
            info,
            self.transport.clone(),
            self.xstore.clone(),
            flags.0,
            Some(offset),
        )?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.open_handles.insert(fh, Mutex::new(handle));
        Ok(fh)
    }

    fn mount_path(&self, ino: INodeNo) -> Option<String> {
        self.inodes.lock().unwrap().get_by_left(&ino.0).cloned()
    }

    fn ino_for_path(&self, path: &str) -> u64 {
        let mut inodes = self.inodes.lock().unwrap();
        if let Some(ino) = inodes.get_by_right(path) {
            return *ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::Relaxed);
        inodes.insert(ino, path.to_string());
        ino
    }

    fn join(parent: &str, name: &OsStr) -> String {
        let name = name.to_string_lossy();
        if parent == "/" {
            format!("/{name}")
        } else {
            format!("{parent}/{name}")
        }
    }

    fn mdfs_path(&self, mount_path: &str) -> Option<std::path::PathBuf> {
        if mount_path == "/" {
            return None;
        }
        self.config.resolve(mount_path).ok().map(|info| info.mdfs_path)
    }

    /// Stat a mount-relative path. The root is an artificial read-only
    /// directory; everything else forwards to the MDFS.
    fn stat(&self, mount_path: &str) -> Result<FileAttr, Error> {
        if mount_path == "/" {
            return Ok(root_attr());
        }
        let info = self.config.resolve(mount_path)?;
        let meta = std::fs::metadata(&info.mdfs_path)?;
        let kind = FileType::from_std(meta.file_type()).unwrap_or(FileType::RegularFile);
        let mut perm = (meta.permissions().mode() & 0o7777) as u16;
        // Reserved bits: semi-direct (file) / MD-sharding (directory); never surfaced.
        perm &= !(libc::S_ISUID as u16 | libc::S_ISGID as u16);

        Ok(FileAttr {
            ino: INodeNo(0),
            size: meta.len(),
            blocks: meta.len().div_ceil(512),
            atime: meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            ctime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            crtime: meta.created().unwrap_or(SystemTime::UNIX_EPOCH),
            kind,
            perm,
            nlink: 1,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: 0,
            blksize: 4096,
            flags: 0,
        })
    }

    fn require_handle<F, R>(&self, fh: FhId, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut FileHandle<T, X>) -> Result<R, Error>,
    {
        let entry = self
            .open_handles
            .get(&fh.0)
            .ok_or(Error::Layout("unknown file handle"))?;
        let mut guard = entry.lock().unwrap();
        f(&mut guard)
    }
}

use std::os::unix::fs::{MetadataExt, PermissionsExt};

fn root_attr() -> FileAttr {
    FileAttr {
        ino: INodeNo(ROOT_INO),
        size: 512,
        blocks: 1,
        atime: SystemTime::UNIX_EPOCH,
        mtime: SystemTime::UNIX_EPOCH,
        ctime: SystemTime::UNIX_EPOCH,
        crtime: SystemTime::UNIX_EPOCH,
        kind: FileType::Directory,
        perm: 0o551,
        nlink: 2,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn errno_of(err: &Error) -> Errno {
    Errno::from_i32(err.to_errno())
}

impl<T: ObjectTransport + 'static, X: MdfsXattrStore + 'static> crate::Filesystem
    for MarfsFilesystem<T, X>
{
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        Ok(())
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyHandler) {
        let Some(parent_path) = self.mount_path(parent) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let path = Self::join(&parent_path, name);
        match self.stat(&path) {
            Ok(mut attr) => {
                let ino = self.ino_for_path(&path);
                attr.ino = INodeNo(ino);
                reply.entry(Entry {
                    ino,
                    generation: None,
                    file_ttl: Duration::from_secs(1),
                    attr,
                    attr_ttl: Duration::from_secs(1),
                });
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FhId>, reply: ReplyHandler) {
        let Some(path) = self.mount_path(ino) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.stat(&path) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(attr, Duration::from_secs(1));
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn mknod(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyHandler,
    ) {
        if mode & (libc::S_ISUID | libc::S_ISGID) != 0 {
            reply.error(Errno::EPERM);
            return;
        }
        let Some(parent_path) = self.mount_path(parent) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let path = Self::join(&parent_path, name);

        let info = match self.config.resolve(&path) {
            Ok(info) => info,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        if let Err(err) = self.config.require_perms(&info, IPerms::W_META) {
            reply.error(errno_of(&err));
            return;
        }
        if let Some(quota) = &self.quota {
            if !quota.check(&info.namespace.name) {
                reply.error(Errno::from_i32(libc::EDQUOT));
                return;
            }
        }

        if let Err(err) = std::fs::File::create(&info.mdfs_path).map_err(Error::Mdfs) {
            reply.error(errno_of(&err));
            return;
        }

        if info.repository.access_method != crate::marfs::config::AccessMethod::Direct {
            let inode_id = self.next_object_id.fetch_add(1, Ordering::Relaxed);
            let pre = crate::marfs::xattr::Pre {
                repo_name: info.repository.name.clone(),
                bucket: info.repository.bucket.clone(),
                inode: inode_id,
                chunk_size: info.repository.chunk_size,
                chunk_no: 0,
                n_to_1: false,
            };
            let _ = self.xstore.set(&info.mdfs_path, xattr::PRE_NAME, pre.format().as_bytes());
            let _ = self
                .xstore
                .set(&info.mdfs_path, xattr::OBJID_NAME, xattr::format_objid(&pre).as_bytes());
            let _ = self.xstore.set(&info.mdfs_path, xattr::RESTART_NAME, b"1");
        }

        match self.stat(&path) {
            Ok(mut attr) => {
                let ino = self.ino_for_path(&path);
                attr.ino = INodeNo(ino);
                reply.entry(Entry {
                    ino,
                    generation: None,
                    file_ttl: Duration::from_secs(1),
                    attr,
                    attr_ttl: Duration::from_secs(1),
                });
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: FuseOpenFlags, reply: ReplyHandler) {
        let Some(path) = self.mount_path(ino) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let info = match self.config.resolve(&path) {
            Ok(info) => info,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        match FileHandle::open(info, self.transport.clone(), self.xstore.clone(), flags.0, None) {
            Ok(handle) => {
                let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
                self.open_handles.insert(fh, Mutex::new(handle));
                reply.opened(Open { fh, flags: 0 });
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn read(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FhId,
        offset: u64,
        size: u32,
        _read_flags: crate::ReadFlags,
        _flags: u32,
        _lock_owner: Option<crate::ll::LockOwner>,
        reply: ReplyHandler,
    ) {
        let mut buf = vec![0u8; size as usize];
        match self.require_handle(fh, |h| h.read(offset, &mut buf)) {
            Ok(n) => {
                buf.truncate(n);
                reply.data(Bytes::Vec(buf));
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn write(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FhId,
        offset: i64,
        data: &[u8],
        _write_flags: crate::WriteFlags,
        _flags: FuseOpenFlags,
        _lock_owner: Option<crate::ll::LockOwner>,
        reply: ReplyHandler,
    ) {
        if offset < 0 {
            reply.error(Errno::from_i32(libc::EINVAL));
            return;
        }
        match self.require_handle(fh, |h| h.write(offset as u64, data)) {
            Ok(n) => reply.written(n as u32),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FhId,
        _flags: FuseOpenFlags,
        _lock_owner: Option<crate::ll::LockOwner>,
        _flush: bool,
        reply: ReplyHandler,
    ) {
        let result = self
            .open_handles
            .remove(&fh.0)
            .ok_or(Error::Layout("unknown file handle"))
            .and_then(|(_, handle)| handle.into_inner().unwrap().release());
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<FhId>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<crate::bsd_file_flags::BsdFileFlags>,
        reply: ReplyHandler,
    ) {
        let Some(path) = self.mount_path(ino) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        if let Some(m) = mode {
            if m & (libc::S_ISUID | libc::S_ISGID) != 0 {
                reply.error(Errno::EPERM);
                return;
            }
        }

        let mdfs_path = match self.mdfs_path(&path) {
            Some(p) => p,
            None => {
                reply.error(Errno::EPERM);
                return;
            }
        };

        if let Some(0) = size {
            let result = match fh {
                Some(fh) => self.require_handle(fh, |h| h.ftruncate(0, &self.trash)),
                None => Err(Error::Layout("ftruncate without an open handle")),
            };
            if let Err(err) = result {
                reply.error(errno_of(&err));
                return;
            }
        } else if let Some(len) = size {
            if len != 0 {
                reply.error(Errno::from_i32(libc::EPERM));
                return;
            }
        }

        if let Some(m) = mode {
            let _ = std::fs::set_permissions(&mdfs_path, std::fs::Permissions::from_mode(m & 0o7777));
        }
        if uid.is_some() || gid.is_some() {
            chown(&mdfs_path, uid, gid);
        }
        if atime.is_some() || mtime.is_some() {
            self.maybe_finalize_n_to_1(&mdfs_path);
        }

        match self.stat(&path) {
            Ok(mut attr) => {
                attr.ino = ino;
                reply.attr(attr, Duration::from_secs(1));
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyHandler) {
        let Some(parent_path) = self.mount_path(parent) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let path = Self::join(&parent_path, name);
        let info = match self.config.resolve(&path) {
            Ok(info) => info,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };

        let pre = self
            .xstore
            .get(&info.mdfs_path, xattr::PRE_NAME)
            .ok()
            .flatten()
            .and_then(|b| crate::marfs::xattr::Pre::parse(&String::from_utf8_lossy(&b)).ok());

        let result = match pre {
            Some(pre) => self.trash.stash(&info.mdfs_path, &pre, TrashReason::Unlink),
            None => std::fs::remove_file(&info.mdfs_path).map_err(Error::Mdfs),
        };
        match result {
            Ok(()) => {
                self.inodes.lock().unwrap().remove_by_right(&path);
                reply.ok();
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyHandler) {
        let Some(path) = self.mount_path(ino) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        if path == "/" {
            reply.ok();
            return;
        }
        let info = match self.config.resolve(&path) {
            Ok(info) => info,
            Err(err) => {
                reply.error(errno_of(&err));
                return;
            }
        };
        let mut required = IPerms::empty();
        if mask.contains(AccessFlags::R_OK) {
            required |= IPerms::R_META | IPerms::R_DATA;
        }
        if mask.contains(AccessFlags::W_OK) {
            required |= IPerms::W_META | IPerms::W_DATA;
        }
        if info.namespace.iperms.contains(required) {
            reply.ok();
        } else {
            reply.error(Errno::from_i32(libc::EACCES));
        }
    }

    fn statfs(&self, _req: &Request, ino: INodeNo, reply: ReplyHandler) {
        let path = self.mount_path(ino).unwrap_or_else(|| "/".to_string());
        let root = self
            .config
            .resolve(&path)
            .map(|info| info.namespace.mdfs_root.clone())
            .unwrap_or_else(|_| std::path::PathBuf::from("/"));

        match statvfs(&root) {
            Ok(s) => reply.statfs(s),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyHandler) {
        let Some(path) = self.mount_path(ino) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.mdfs_path(&path).map(std::fs::read_link) {
            Some(Ok(target)) => reply.data(Bytes::Vec(
                target.as_os_str().as_encoded_bytes().to_vec(),
            )),
            _ => reply.error(Errno::from_i32(libc::EIO)),
        }
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyHandler,
    ) {
        let Some(parent_path) = self.mount_path(parent) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        let path = Self::join(&parent_path, link_name);
        let Some(mdfs_path) = self.mdfs_path(&path) else {
            reply.error(Errno::EPERM);
            return;
        };
        match std::os::unix::fs::symlink(target, &mdfs_path) {
            Ok(()) => match self.stat(&path) {
                Ok(mut attr) => {
                    let ino = self.ino_for_path(&path);
                    attr.ino = INodeNo(ino);
                    reply.entry(Entry {
                        ino,
                        generation: None,
                        file_ttl: Duration::from_secs(1),
                        attr,
                        attr_ttl: Duration::from_secs(1),
                    });
                }
                Err(err) => reply.error(errno_of(&err)),
            },
            Err(err) => reply.error(Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO))),
        }
    }

    fn getxattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, size: u32, reply: ReplyHandler) {
        let name = name.to_string_lossy();
        if xattr::is_reserved(&name) {
            reply.error(Errno::EPERM);
            return;
        }
        let Some(path) = self.mount_path(ino).and_then(|p| self.mdfs_path(&p)) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.xstore.get(&path, &name) {
            Ok(Some(value)) => {
                if size == 0 {
                    reply.xattr_size(value.len() as u32);
                } else {
                    reply.xattr_data(Bytes::Vec(value));
                }
            }
            Ok(None) => reply.error(Errno::from_i32(libc::ENODATA)),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn setxattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyHandler,
    ) {
        let name = name.to_string_lossy();
        if xattr::is_reserved(&name) {
            reply.error(Errno::EPERM);
            return;
        }
        let Some(path) = self.mount_path(ino).and_then(|p| self.mdfs_path(&p)) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.xstore.set(&path, &name, value) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn listxattr(&self, _req: &Request, ino: INodeNo, size: u32, reply: ReplyHandler) {
        let Some(path) = self.mount_path(ino).and_then(|p| self.mdfs_path(&p)) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.xstore.list(&path) {
            Ok(raw) => {
                let filtered = xattr::filter_reserved(&raw);
                if size == 0 {
                    reply.xattr_size(filtered.len() as u32);
                } else {
                    reply.xattr_data(Bytes::Vec(filtered));
                }
            }
            Err(err) => reply.error(errno_of(&err)),
        }
    }

    fn removexattr(&self, _req: &Request, ino: INodeNo, name: &OsStr, reply: ReplyHandler) {
        let name = name.to_string_lossy();
        if xattr::is_reserved(&name) {
            reply.error(Errno::EPERM);
            return;
        }
        let Some(path) = self.mount_path(ino).and_then(|p| self.mdfs_path(&p)) else {
            reply.error(Errno::from_i32(libc::ENOENT));
            return;
        };
        match self.xstore.remove(&path, &name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno_of(&err)),
        }
    }
}

impl<T: ObjectTransport + 'static, X: MdfsXattrStore + 'static> MarfsFilesystem<T, X> {
    /// `utime`/`utimens` on an `N_TO_1`-tagged file is the single-threaded
    /// finalizer: count persisted `ChunkInfo` records, set the real
    /// `obj_type`/`chunks`, and reconcile `st_size`.
    fn maybe_finalize_n_to_1(&self, mdfs_path: &std::path::Path) {
        let Ok(Some(pre_bytes)) = self.xstore.get(mdfs_path, xattr::PRE_NAME) else {
            return;
        };
        let Ok(pre) = crate::marfs::xattr::Pre::parse(&String::from_utf8_lossy(&pre_bytes)) else {
            return;
        };
        if !pre.n_to_1 {
            return;
        }

        let Ok(meta) = std::fs::metadata(mdfs_path) else {
            return;
        };
        let chunks = meta.len() / CHUNK_INFO_SIZE as u64;
        if chunks == 0 {
            return;
        }

        let dpc = crate::marfs::chunk::data_per_chunk(pre.chunk_size, xattr::RECOVERY_INFO_SIZE as u64, None);
        let post = Post {
            obj_type: ObjType::Multi,
            chunks,
            obj_offset: 0,
            chunk_info_bytes: chunks * CHUNK_INFO_SIZE as u64,
        };
        let _ = self.xstore.set(mdfs_path, xattr::POST_NAME, post.format().as_bytes());
        let _ = self.xstore.remove(mdfs_path, xattr::RESTART_NAME);
        let _ = self.xstore.remove(mdfs_path, xattr::SLAVE_NAME);
        let _ = std::fs::File::options()
            .write(true)
            .open(mdfs_path)
            .and_then(|f| f.set_len(chunks * dpc));
    }
}

fn chown(path: &std::path::Path, uid: Option<u32>, gid: Option<u32>) {
    use std::ffi::CString;
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return;
    };
    let uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX as libc::uid_t);
    let gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX as libc::gid_t);
    unsafe {
        libc::chown(cpath.as_ptr(), uid, gid);
    }
}

fn statvfs(path: &std::path::Path) -> Result<Statfs, Error> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;

    let cpath = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| Error::Layout("path contains an interior NUL"))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(Error::Mdfs(std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(Statfs {
        blocks: stat.f_blocks,
        bfree: stat.f_bfree,
        bavail: stat.f_bavail,
        files: stat.f_files,
        ffree: stat.f_ffree,
        bsize: stat.f_bsize as u32,
        namelen: stat.f_namemax as u32,
        frsize: stat.f_frsize as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marfs::config::AccessMethod;
    use crate::marfs::error::Result as MarfsResult;
    use crate::marfs::xattr::Pre;
    use crate::marfs::xattr_store::MemXattrStore;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};

    struct FakeTransport {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl FakeTransport {
        fn new() -> FakeTransport {
            FakeTransport {
                objects: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ObjectTransport for FakeTransport {
        fn get(&self, url: &str, range_start: Option<u64>) -> MarfsResult<Box<dyn Read + Send>> {
            let objects = self.objects.lock().unwrap();
            let data = objects.get(url).cloned().unwrap_or_default();
            let start = range_start.unwrap_or(0) as usize;
            Ok(Box::new(Cursor::new(data[start.min(data.len())..].to_vec())))
        }

        fn put(&self, url: &str, _content_length: Option<u64>, mut body: Box<dyn Read + Send>) -> MarfsResult<()> {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .map_err(|_| Error::Transport { status: None })?;
            self.objects.lock().unwrap().insert(url.to_string(), buf);
            Ok(())
        }
    }

    fn config(mdfs_root: &std::path::Path, chunk_size: u64, access_method: AccessMethod) -> Config {
        let method = match access_method {
            AccessMethod::Direct => "DIRECT",
            AccessMethod::S3 => "S3",
            AccessMethod::S3Emc => "S3EMC",
            AccessMethod::Sproxyd => "SPROXYD",
        };
        let text = format!(
            r#"
            [[namespace]]
            name = "ns"
            mount_prefix = "/ns"
            mdfs_root = "{}"
            write_repo = "repo1"
            iperms = ["RMETA", "WMETA", "RDATA", "WDATA"]

            [[repository]]
            name = "repo1"
            access_method = "{}"
            host_template = "10.0.0.%d"
            host_offset = 1
            host_count = 1
            bucket = "marfs-repo1"
            chunk_size = {}
            "#,
            mdfs_root.display(),
            method,
            chunk_size,
        );
        Config::parse(&text).unwrap()
    }

    fn build(dir: &std::path::Path, chunk_size: u64, access_method: AccessMethod) -> MarfsFilesystem<FakeTransport, MemXattrStore> {
        MarfsFilesystem::new(
            config(dir, chunk_size, access_method),
            Arc::new(FakeTransport::new()),
            Arc::new(MemXattrStore::new()),
            dir.join("trash"),
        )
    }

    #[test]
    fn direct_small_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let fs = build(dir.path(), 1 << 20, AccessMethod::Direct);
        let path = "/ns/a.txt";
        let info = fs.config.resolve(path).unwrap();
        std::fs::write(&info.mdfs_path, []).unwrap();

        let mut handle =
            FileHandle::open(info.clone(), fs.transport.clone(), fs.xstore.clone(), libc::O_WRONLY, None).unwrap();
        handle.write(0, b"hello direct").unwrap();
        handle.release().unwrap();

        let mut reader = FileHandle::open(info, fs.transport.clone(), fs.xstore.clone(), libc::O_RDONLY, None).unwrap();
        let mut buf = vec![0u8; 12];
        let n = reader.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello direct");
    }

    #[test]
    fn n_to_1_writers_finalize_and_concatenate() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_size = 1024u64;
        let fs = build(dir.path(), chunk_size, AccessMethod::S3);
        let path = "/ns/big.bin";
        let info = fs.config.resolve(path).unwrap();

        std::fs::write(&info.mdfs_path, []).unwrap();
        let pre = Pre {
            repo_name: "repo1".to_string(),
            bucket: "marfs-repo1".to_string(),
            inode: 1,
            chunk_size,
            chunk_no: 0,
            n_to_1: false,
        };
        fs.xstore.set(&info.mdfs_path, xattr::PRE_NAME, pre.format().as_bytes()).unwrap();
        fs.xstore.set(&info.mdfs_path, xattr::RESTART_NAME, b"1").unwrap();

        let dpc = chunk_size - xattr::RECOVERY_INFO_SIZE as u64;
        let ino = INodeNo(fs.ino_for_path(path));

        let fh0 = fs.open_at_offset(ino, FuseOpenFlags(libc::O_WRONLY), 0).unwrap();
        let fh1 = fs.open_at_offset(ino, FuseOpenFlags(libc::O_WRONLY), dpc).unwrap();

        let payload0 = vec![0xAAu8; dpc as usize];
        let payload1 = vec![0xBBu8; dpc as usize];
        fs.require_handle(FhId(fh0), |h| h.write(0, &payload0)).unwrap();
        fs.require_handle(FhId(fh1), |h| h.write(dpc, &payload1)).unwrap();
        fs.require_handle(FhId(fh0), |h| h.release()).unwrap();
        fs.require_handle(FhId(fh1), |h| h.release()).unwrap();

        fs.maybe_finalize_n_to_1(&info.mdfs_path);

        let reader_info = fs.config.resolve(path).unwrap();
        let mut reader =
            FileHandle::open(reader_info, fs.transport.clone(), fs.xstore.clone(), libc::O_RDONLY, None).unwrap();
        let total = (dpc * 2) as usize;
        let mut buf = vec![0u8; total];
        let n = reader.read(0, &mut buf).unwrap();
        assert_eq!(n, total);
        assert_eq!(&buf[..dpc as usize], &payload0[..]);
        assert_eq!(&buf[dpc as usize..], &payload1[..]);

        assert!(fs.xstore.get(&info.mdfs_path, xattr::RESTART_NAME).unwrap().is_none());
        assert!(fs.xstore.get(&info.mdfs_path, xattr::SLAVE_NAME).unwrap().is_none());
    }
}
