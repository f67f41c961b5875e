//! File Handle & I/O Engine — the `open`/`read`/`write`/`ftruncate`/`release`
//! state machine that drives the Chunk Calculator, Object Stream, Host
//! Selector, and Xattr Codec together.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use crate::marfs::chunk;
use crate::marfs::chunk_info::{ChunkInfo, CHUNK_INFO_SIZE};
use crate::marfs::config::{AccessMethod, IPerms, PathInfo};
use crate::marfs::error::{Error, Result};
use crate::marfs::host_selector;
use crate::marfs::object_stream::{Method, ObjectStream, ObjectTransport};
use crate::marfs::trash::{Trash, TrashReason};
use crate::marfs::xattr::{self, ObjType, Post, Pre, XattrSnapshot};
use crate::marfs::xattr_store::MdfsXattrStore;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READING     = 0b001;
        const WRITING     = 0b010;
        const ALLOW_RISKY = 0b100;
    }
}

/// Open-file state for one MarFS file.
pub struct FileHandle<T: ObjectTransport, X: MdfsXattrStore> {
    path_info: PathInfo,
    transport: Arc<T>,
    xstore: Arc<X>,
    xattr: XattrSnapshot,
    flags: OpenFlags,

    direct_file: Option<std::fs::File>,
    mdfs_file: Option<std::fs::File>,
    stream: Option<ObjectStream<T>>,

    seed: u64,
    host: String,
    recovery: u64,

    open_offset: u64,
    sys_writes: u64,
    log_offset: u64,
    chunk_no: u64,
    chunk_user_bytes: u64,
}

fn load_xattrs<X: MdfsXattrStore>(store: &X, path: &std::path::Path) -> Result<XattrSnapshot> {
    let pre = match store.get(path, xattr::PRE_NAME)? {
        Some(bytes) => Some(Pre::parse(&String::from_utf8_lossy(&bytes))?),
        None => None,
    };
    let post = match store.get(path, xattr::POST_NAME)? {
        Some(bytes) => Some(Post::parse(&String::from_utf8_lossy(&bytes))?),
        None => None,
    };
    let restart = store.get(path, xattr::RESTART_NAME)?.is_some();
    let objid = match store.get(path, xattr::OBJID_NAME)? {
        Some(bytes) => Some(xattr::parse_objid(&String::from_utf8_lossy(&bytes))?),
        None => None,
    };
    let slave = store
        .get(path, xattr::SLAVE_NAME)?
        .map(|b| xattr::parse_slave(&String::from_utf8_lossy(&b)));
    Ok(XattrSnapshot {
        pre,
        post,
        restart,
        objid,
        slave,
    })
}

fn flush_xattrs<X: MdfsXattrStore>(
    store: &X,
    path: &std::path::Path,
    snapshot: &XattrSnapshot,
) -> Result<()> {
    match &snapshot.pre {
        Some(pre) => {
            store.set(path, xattr::PRE_NAME, pre.format().as_bytes())?;
            store.set(path, xattr::OBJID_NAME, xattr::format_objid(pre).as_bytes())?;
        }
        None => {
            store.remove(path, xattr::PRE_NAME)?;
            store.remove(path, xattr::OBJID_NAME)?;
        }
    }
    match &snapshot.post {
        Some(post) => store.set(path, xattr::POST_NAME, post.format().as_bytes())?,
        None => store.remove(path, xattr::POST_NAME)?,
    }
    if snapshot.restart {
        store.set(path, xattr::RESTART_NAME, b"1")?;
    } else {
        store.remove(path, xattr::RESTART_NAME)?;
    }
    match &snapshot.slave {
        Some(slave) => store.set(path, xattr::SLAVE_NAME, xattr::format_slave(slave).as_bytes())?,
        None => store.remove(path, xattr::SLAVE_NAME)?,
    }
    Ok(())
}

impl<T: ObjectTransport + 'static, X: MdfsXattrStore> FileHandle<T, X> {
    /// Decide the storage layout and open whatever backing resources that
    /// layout needs. `open_offset` is `Some` only for an N:1 parallel-writer
    /// open.
    pub fn open(
        path_info: PathInfo,
        transport: Arc<T>,
        xstore: Arc<X>,
        o_flags: i32,
        open_offset: Option<u64>,
    ) -> Result<FileHandle<T, X>> {
        if o_flags & libc::O_APPEND != 0 {
            return Err(Error::Unsupported);
        }
        if (o_flags & libc::O_ACCMODE) == libc::O_RDWR {
            return Err(Error::Unsupported);
        }
        if o_flags & (libc::O_CREAT | libc::O_TRUNC) != 0 {
            return Err(Error::Unsupported);
        }

        let write = (o_flags & libc::O_ACCMODE) == libc::O_WRONLY;
        let required = if write {
            IPerms::R_META | IPerms::W_META | IPerms::R_DATA | IPerms::W_DATA
        } else {
            IPerms::R_META | IPerms::R_DATA
        };
        if !path_info.namespace.iperms.contains(required) {
            return Err(Error::Permission);
        }

        let xattr = load_xattrs(xstore.as_ref(), &path_info.mdfs_path)?;
        let recovery = xattr::RECOVERY_INFO_SIZE as u64;
        let direct = xattr.is_direct() && path_info.repository.access_method == AccessMethod::Direct;

        let mut handle = FileHandle {
            path_info,
            transport,
            xstore,
            xattr,
            flags: OpenFlags::empty(),
            direct_file: None,
            mdfs_file: None,
            stream: None,
            seed: host_selector::new_seed(),
            host: String::new(),
            recovery,
            open_offset: 0,
            sys_writes: 0,
            log_offset: 0,
            chunk_no: 0,
            chunk_user_bytes: 0,
        };

        if direct {
            let file = OpenOptions::new()
                .read(true)
                .write(write)
                .open(&handle.path_info.mdfs_path)?;
            handle.direct_file = Some(file);
            handle.flags = if write {
                OpenFlags::WRITING
            } else {
                OpenFlags::READING
            };
            return Ok(handle);
        }

        if let Some(offset) = open_offset {
            let dpc = handle.data_per_chunk();
            if offset % dpc != 0 {
                return Err(Error::Fault("N:1 open_offset is not chunk-aligned"));
            }
            handle.flags = OpenFlags::WRITING | OpenFlags::ALLOW_RISKY;
            handle.open_offset = offset;
            handle.log_offset = offset;
            handle.chunk_no = offset / dpc;

            let mut file = OpenOptions::new()
                .write(true)
                .read(true)
                .open(&handle.path_info.mdfs_path)?;
            file.seek(SeekFrom::Start(handle.chunk_no * CHUNK_INFO_SIZE as u64))?;
            handle.mdfs_file = Some(file);

            if let Some(pre) = handle.xattr.pre.as_mut() {
                pre.n_to_1 = true;
            }
            handle.select_host();
            handle.xattr.slave = Some(format!("{}:{}", handle.host, handle.seed));
            flush_xattrs(handle.xstore.as_ref(), &handle.path_info.mdfs_path, &handle.xattr)?;
            handle.open_stream_for_write(dpc)?;
            return Ok(handle);
        }

        if write {
            handle.flags = OpenFlags::WRITING;
            handle.select_host();
            handle.open_stream_for_write(0)?;
        } else {
            handle.flags = OpenFlags::READING;
            let multi_or_packed = matches!(
                handle.xattr.post.as_ref().map(|p| p.obj_type),
                Some(ObjType::Multi) | Some(ObjType::Packed)
            );
            if multi_or_packed {
                let file = OpenOptions::new().read(true).open(&handle.path_info.mdfs_path)?;
                handle.mdfs_file = Some(file);
            }
        }

        Ok(handle)
    }

    fn data_per_chunk(&self) -> u64 {
        chunk::data_per_chunk(
            self.path_info.repository.chunk_size,
            self.recovery,
            self.xattr.post.as_ref(),
        )
    }

    fn select_host(&mut self) {
        self.host = host_selector::select_host(&self.path_info.repository, self.seed);
    }

    fn current_object_id(&self) -> Result<String> {
        let pre = self
            .xattr
            .pre
            .as_ref()
            .ok_or(Error::Layout("object-backed handle has no PRE xattr"))?;
        Ok(format!("{}-{}", pre.inode, self.chunk_no))
    }

    fn current_url(&self) -> Result<String> {
        let object_id = self.current_object_id()?;
        Ok(host_selector::object_url(
            &self.path_info.repository,
            &self.host,
            &object_id,
        ))
    }

    fn ensure_stream(&mut self) -> &mut ObjectStream<T> {
        if self.stream.is_none() {
            self.stream = Some(ObjectStream::new(self.transport.clone(), String::new()));
        }
        self.stream.as_mut().unwrap()
    }

    fn open_stream_for_write(&mut self, size_hint: u64) -> Result<()> {
        let url = self.current_url()?;
        let stream = self.ensure_stream();
        stream.set_url(url);
        stream.open(Method::Put, size_hint, true)
    }

    fn open_read_stream(&mut self, range_start: u64) -> Result<()> {
        let url = self.current_url()?;
        let stream = self.ensure_stream();
        stream.set_url(url);
        stream.open_range(range_start, true)
    }

    /// Forward to the MDFS fd, or reconstruct a logical byte range across
    /// one or more objects.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if let Some(file) = self.direct_file.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
            return Ok(file.read(buf)?);
        }

        let max_extent = std::fs::metadata(&self.path_info.mdfs_path)?.len();
        if offset >= max_extent {
            return Ok(0);
        }
        let max_read = ((max_extent - offset).min(buf.len() as u64)) as usize;
        if max_read == 0 {
            return Ok(0);
        }

        let dpc = self.data_per_chunk();
        let phy_offset = self.xattr.post.as_ref().map(|p| p.obj_offset).unwrap_or(0);

        if self.stream.is_none() || self.log_offset != offset {
            if self.stream.is_some() {
                self.stream.as_mut().unwrap().close()?;
            }
            let pos = chunk::locate(offset, dpc, phy_offset);
            self.chunk_no = pos.chunk;
            self.select_host();
            self.open_read_stream(pos.chunk_offset)?;
            self.log_offset = offset;
        }

        let mut written = 0usize;
        let mut remain = max_read;
        let mut chunk_pos = chunk::locate(self.log_offset, dpc, phy_offset).chunk_offset;

        while remain > 0 {
            let chunk_remain = (dpc - chunk_pos) as usize;
            let want = remain.min(chunk_remain);
            let mut filled = 0usize;
            while filled < want {
                let n = self
                    .stream
                    .as_mut()
                    .unwrap()
                    .get(&mut buf[written + filled..written + want])?;
                if n == 0 {
                    return Err(Error::Transport { status: None });
                }
                filled += n;
            }
            written += want;
            remain -= want;
            chunk_pos += want as u64;
            self.log_offset += want as u64;

            if remain > 0 {
                self.stream.as_mut().unwrap().close()?;
                self.chunk_no += 1;
                chunk_pos = 0;
                self.select_host();
                self.open_read_stream(0)?;
            }
        }

        Ok(written)
    }

    /// Append-only write into the current chunk, rolling over to a fresh
    /// object and promoting the layout to Multi as chunks fill.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<usize> {
        if let Some(file) = self.direct_file.as_mut() {
            file.seek(SeekFrom::Start(offset))?;
            return Ok(file.write(data)?);
        }

        if offset != self.log_offset {
            return Err(Error::Layout("non-contiguous write"));
        }

        let dpc = self.data_per_chunk();
        let mut pushed = 0usize;
        let mut remaining = data;

        while !remaining.is_empty() {
            let log_end = chunk::chunk_logical_end(self.chunk_no, dpc);
            let fill = ((log_end - self.log_offset).min(remaining.len() as u64)) as usize;
            if fill == 0 {
                return Err(Error::Transport { status: None });
            }

            self.stream
                .as_mut()
                .ok_or(Error::Layout("write stream not open"))?
                .put(&remaining[..fill])?;
            self.log_offset += fill as u64;
            self.chunk_user_bytes += fill as u64;
            pushed += fill;
            remaining = &remaining[fill..];

            if self.log_offset == log_end {
                self.close_current_chunk()?;
                if !remaining.is_empty() {
                    self.chunk_no += 1;
                    self.xattr.post = Some(match self.xattr.post.take() {
                        Some(mut post) => {
                            post.obj_type = ObjType::Multi;
                            post
                        }
                        None => Post {
                            obj_type: ObjType::Multi,
                            chunks: self.chunk_no + 1,
                            obj_offset: 0,
                            chunk_info_bytes: 0,
                        },
                    });
                    self.select_host();
                    self.open_stream_for_write(dpc)?;
                }
            }
        }

        Ok(pushed)
    }

    /// Close the current chunk: append its recovery blob, sync+close the
    /// stream, and persist a `ChunkInfo` record describing it.
    fn close_current_chunk(&mut self) -> Result<()> {
        let recovery = self.recovery;
        let blob = vec![0u8; recovery as usize];
        {
            let stream = self
                .stream
                .as_mut()
                .ok_or(Error::Layout("no stream to close"))?;
            stream.put(&blob)?;
        }
        self.sys_writes += recovery;
        self.stream.as_mut().unwrap().sync()?;
        self.stream.as_mut().unwrap().close()?;

        if self.mdfs_file.is_none() {
            let file = OpenOptions::new()
                .write(true)
                .read(true)
                .open(&self.path_info.mdfs_path)?;
            self.mdfs_file = Some(file);
        }

        let dpc = self.data_per_chunk();
        let record = ChunkInfo {
            seq: self.chunk_no,
            logical_offset: self.chunk_no * dpc,
            length: self.chunk_user_bytes,
        };
        {
            let file = self.mdfs_file.as_mut().unwrap();
            file.seek(SeekFrom::Start(self.chunk_no * CHUNK_INFO_SIZE as u64))?;
            file.write_all(&record.to_bytes())?;
        }
        self.chunk_user_bytes = 0;
        Ok(())
    }

    /// Only `length == 0` is meaningful on an object-backed file: abort the
    /// in-flight stream, trash the file-as-it-was, and start fresh against a
    /// new object id.
    pub fn ftruncate(&mut self, length: u64, trash: &Trash) -> Result<()> {
        if length != 0 {
            return Err(Error::Forbidden("non-zero truncate of an object-backed file"));
        }

        if let Some(file) = self.direct_file.as_mut() {
            file.set_len(0)?;
            return Ok(());
        }

        if let Some(stream) = self.stream.as_mut() {
            stream.abort()?;
        }
        self.stream = None;
        self.mdfs_file = None;

        if let Some(pre) = self.xattr.pre.clone() {
            trash.stash(&self.path_info.mdfs_path, &pre, TrashReason::Truncate)?;
        }
        std::fs::File::create(&self.path_info.mdfs_path)?;

        self.chunk_no = 0;
        self.chunk_user_bytes = 0;
        self.sys_writes = 0;
        self.log_offset = self.open_offset;
        self.xattr.post = None;
        self.xattr.restart = true;
        if let Some(pre) = self.xattr.pre.as_mut() {
            pre.chunk_no = 0;
        }
        flush_xattrs(self.xstore.as_ref(), &self.path_info.mdfs_path, &self.xattr)?;

        self.select_host();
        self.open_stream_for_write(0)?;
        Ok(())
    }

    /// Finalize a write stream: one last recovery record, the closing
    /// `ChunkInfo`, the apparent-size truncate, and the xattr flush — unless
    /// this handle is an N:1 writer, which defers all of that to the
    /// `utime` finalizer.
    pub fn release(&mut self) -> Result<()> {
        if let Some(file) = self.direct_file.take() {
            drop(file);
            return Ok(());
        }

        let writing = self.flags.contains(OpenFlags::WRITING);
        let risky = self.flags.contains(OpenFlags::ALLOW_RISKY);

        if writing {
            if let Some(stream) = self.stream.as_mut() {
                let recovery = self.recovery;
                let blob = vec![0u8; recovery as usize];
                stream.put(&blob)?;
                self.sys_writes += recovery;
                stream.sync()?;
                stream.close()?;
            }
            self.stream = None;

            let dpc = self.data_per_chunk();
            if self.mdfs_file.is_none() {
                self.mdfs_file = Some(
                    OpenOptions::new()
                        .write(true)
                        .read(true)
                        .open(&self.path_info.mdfs_path)?,
                );
            }
            let record = ChunkInfo {
                seq: self.chunk_no,
                logical_offset: self.chunk_no * dpc,
                length: self.chunk_user_bytes,
            };
            {
                let file = self.mdfs_file.as_mut().unwrap();
                file.seek(SeekFrom::Start(self.chunk_no * CHUNK_INFO_SIZE as u64))?;
                file.write_all(&record.to_bytes())?;
            }

            if !risky {
                let chunks = self.chunk_no + 1;
                self.xattr.post = Some(Post {
                    obj_type: if chunks > 1 { ObjType::Multi } else { ObjType::Uni },
                    chunks,
                    obj_offset: 0,
                    chunk_info_bytes: chunks * CHUNK_INFO_SIZE as u64,
                });
                self.chunk_no = 0;
                self.mdfs_file.take();

                let total = self.log_offset - self.open_offset;
                std::fs::File::options()
                    .write(true)
                    .open(&self.path_info.mdfs_path)?
                    .set_len(total)?;

                self.xattr.restart = false;
                flush_xattrs(self.xstore.as_ref(), &self.path_info.mdfs_path, &self.xattr)?;
            } else {
                debug!(
                    "N:1 writer released without finalizing; awaiting utime finalizer for {}",
                    self.path_info.mdfs_path.display()
                );
            }
        } else if let Some(stream) = self.stream.as_mut() {
            stream.sync()?;
            stream.close()?;
            self.stream = None;
        }

        self.mdfs_file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marfs::config::{AccessMethod, IPerms, Namespace, Repository};
    use crate::marfs::object_stream::ObjectTransport;
    use crate::marfs::xattr_store::MemXattrStore;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

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
        fn get(&self, url: &str, range_start: Option<u64>) -> Result<Box<dyn Read + Send>> {
            let objects = self.objects.lock().unwrap();
            let data = objects.get(url).cloned().unwrap_or_default();
            let start = range_start.unwrap_or(0) as usize;
            Ok(Box::new(Cursor::new(data[start.min(data.len())..].to_vec())))
        }

        fn put(&self, url: &str, _content_length: Option<u64>, mut body: Box<dyn Read + Send>) -> Result<()> {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf)
                .map_err(|_| Error::Transport { status: None })?;
            self.objects.lock().unwrap().insert(url.to_string(), buf);
            Ok(())
        }
    }

    fn path_info(dir: &std::path::Path, chunk_size: u64) -> PathInfo {
        let namespace = Namespace {
            name: "ns".to_string(),
            mount_prefix: "/ns".to_string(),
            mdfs_root: dir.to_path_buf(),
            write_repo: "repo1".to_string(),
            iperms: IPerms::R_META | IPerms::W_META | IPerms::R_DATA | IPerms::W_DATA,
        };
        let repository = Repository {
            name: "repo1".to_string(),
            access_method: AccessMethod::S3,
            host_template: "10.0.0.%d".to_string(),
            host_offset: 1,
            host_count: 1,
            bucket: "marfs-repo1".to_string(),
            tls: false,
            chunk_size,
        };
        PathInfo {
            namespace: Arc::new(namespace),
            repository: Arc::new(repository),
            mdfs_path: dir.join("a"),
        }
    }

    fn mknod(store: &MemXattrStore, path: &std::path::Path, inode: u64, chunk_size: u64) {
        std::fs::write(path, []).unwrap();
        let pre = Pre {
            repo_name: "repo1".to_string(),
            bucket: "marfs-repo1".to_string(),
            inode,
            chunk_size,
            chunk_no: 0,
            n_to_1: false,
        };
        store.set(path, xattr::PRE_NAME, pre.format().as_bytes()).unwrap();
        store.set(path, xattr::RESTART_NAME, b"1").unwrap();
    }

    #[test]
    fn uni_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let info = path_info(dir.path(), 1 << 20);
        let store = Arc::new(MemXattrStore::new());
        mknod(&store, &info.mdfs_path, 1, 1 << 20);
        let transport = Arc::new(FakeTransport::new());

        let mut handle = FileHandle::open(
            info.clone(),
            transport.clone(),
            store.clone(),
            libc::O_WRONLY,
            None,
        )
        .unwrap();
        let payload = vec![0xABu8; 1024];
        handle.write(0, &payload).unwrap();
        handle.release().unwrap();

        assert_eq!(std::fs::metadata(&info.mdfs_path).unwrap().len(), 1024);

        let mut reader = FileHandle::open(info, transport, store, libc::O_RDONLY, None).unwrap();
        let mut buf = vec![0u8; 1024];
        let n = reader.read(0, &mut buf).unwrap();
        assert_eq!(n, 1024);
        assert_eq!(buf, payload);
    }

    #[test]
    fn multi_write_spans_several_objects() {
        let dir = tempfile::tempdir().unwrap();
        let chunk_size = 1024u64;
        let info = path_info(dir.path(), chunk_size);
        let store = Arc::new(MemXattrStore::new());
        mknod(&store, &info.mdfs_path, 7, chunk_size);
        let transport = Arc::new(FakeTransport::new());

        let dpc = chunk_size - xattr::RECOVERY_INFO_SIZE as u64;
        let total = (dpc * 2 + 10) as usize;
        let payload: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();

        let mut handle = FileHandle::open(info.clone(), transport.clone(), store.clone(), libc::O_WRONLY, None).unwrap();
        handle.write(0, &payload).unwrap();
        handle.release().unwrap();

        assert_eq!(std::fs::metadata(&info.mdfs_path).unwrap().len(), total as u64);

        let mut reader = FileHandle::open(info, transport, store, libc::O_RDONLY, None).unwrap();
        let mut buf = vec![0u8; total];
        let n = reader.read(0, &mut buf).unwrap();
        assert_eq!(n, total);
        assert_eq!(buf, payload);
    }

    #[test]
    fn non_contiguous_write_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let info = path_info(dir.path(), 1 << 20);
        let store = Arc::new(MemXattrStore::new());
        mknod(&store, &info.mdfs_path, 1, 1 << 20);
        let transport = Arc::new(FakeTransport::new());

        let mut handle = FileHandle::open(info, transport, store, libc::O_WRONLY, None).unwrap();
        handle.write(0, &[0u8; 100]).unwrap();
        let err = handle.write(50, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, Error::Layout(_)));
    }

    #[test]
    fn ftruncate_zero_stashes_to_trash_and_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let trash_dir = dir.path().join("trash");
        let info = path_info(dir.path(), 1 << 20);
        let store = Arc::new(MemXattrStore::new());
        mknod(&store, &info.mdfs_path, 1, 1 << 20);
        let transport = Arc::new(FakeTransport::new());

        let mut handle = FileHandle::open(info.clone(), transport.clone(), store.clone(), libc::O_WRONLY, None).unwrap();
        handle.write(0, &[0x11u8; 500]).unwrap();
        let trash = Trash::new(trash_dir.clone());
        handle.ftruncate(0, &trash).unwrap();
        handle.write(0, &[0x55u8; 200]).unwrap();
        handle.release().unwrap();

        assert_eq!(std::fs::metadata(&info.mdfs_path).unwrap().len(), 200);
        assert_eq!(std::fs::read_dir(&trash_dir).unwrap().count(), 1);
    }
}
