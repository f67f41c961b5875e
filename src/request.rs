//! Filesystem operation request dispatch
//!
//! Turns a raw byte buffer received from the kernel into a parsed `ll::Request`,
//! then either advances the init/destroy handshake or hands the operation to the
//! filesystem implementation, replying through the supplied channel.

use std::io;
use std::sync::Arc;

use log::{debug, error, warn};

use crate::ll;
use crate::ll::request::Version;
use crate::reply::ReplyHandler;
use crate::request_param::Request as RequestParam;
use crate::session::ActiveSession;
use crate::Filesystem;
use crate::KernelConfig;
use crate::io_ops::ArcSubChannel;

/// A request received from the kernel, not yet dispatched to a filesystem.
#[derive(Debug)]
pub struct Request<'a> {
    request: ll::Request<'a>,
}

impl<'a> Request<'a> {
    /// Parse a request out of a buffer filled by a read from the kernel fd.
    pub fn new(data: &'a [u8]) -> Option<Request<'a>> {
        match ll::Request::try_from(data) {
            Ok(request) => Some(Self { request }),
            Err(err) => {
                error!("{}", err);
                None
            }
        }
    }

    fn reply(&self, sender: ArcSubChannel) -> ReplyHandler {
        ReplyHandler::new(self.request.unique(), sender)
    }

    /// Handle the FUSE init handshake. Must be called before any other operation is
    /// dispatched; sets `active_session`'s initialized flag once the filesystem accepts.
    pub async fn dispatch_init<FS: Filesystem>(
        &self,
        active_session: &Arc<ActiveSession>,
        filesystem: &Arc<FS>,
        sender: ArcSubChannel,
    ) {
        debug!("{}", self.request);
        let ll::Operation::Init(x) = self.request.operation() else {
            warn!("Ignoring FUSE operation before init: {}", self.request);
            self.reply(sender).error(ll::Errno::EIO);
            return;
        };

        let v = Version(x.arg.major, x.arg.minor);
        if v < Version(7, 6) {
            error!("Unsupported FUSE ABI version {}.{}", v.0, v.1);
            self.reply(sender).error(ll::Errno::from_i32(libc::EPROTO));
            return;
        }

        {
            let mut cfg = active_session.session_configuration.lock().await;
            cfg.proto_major = x.arg.major;
            cfg.proto_minor = x.arg.minor;
        }

        let capabilities = crate::InitFlags::from_bits_truncate(x.arg.flags.into());
        let mut config = KernelConfig::new(capabilities, x.arg.max_readahead, v);

        // Safety: Filesystem::init only needs `&Request`; we don't have a real
        // `request_param::Request` reference available before the session exists,
        // so filesystems that inspect `_req` during init see a zeroed stand-in.
        let header = crate::ll::fuse_abi::fuse_in_header {
            len: 0,
            opcode: 0,
            unique: self.request.unique().into(),
            nodeid: 0,
            uid: 0,
            gid: 0,
            pid: 0,
            padding: 0,
        };
        let req = RequestParam::ref_cast(&header);

        let res = init_on_filesystem(filesystem.as_ref(), req, &mut config);
        if let Err(err) = res {
            let code = err.raw_os_error().unwrap_or(libc::EIO);
            self.reply(sender).error(ll::Errno::from_i32(code));
            return;
        }
        active_session
            .initialized
            .store(true, std::sync::atomic::Ordering::Relaxed);
        self.reply(sender).config(x.arg.flags.into(), config);
    }

    /// Dispatch a non-init request to the filesystem implementation.
    pub async fn dispatch<FS: Filesystem>(
        &self,
        active_session: &Arc<ActiveSession>,
        filesystem: Arc<FS>,
        sender: ArcSubChannel,
    ) -> io::Result<()> {
        debug!("{}", self.request);

        if let ll::Operation::Destroy(_) = self.request.operation() {
            active_session.destroy().await;
            self.reply(sender).ok();
            return Ok(());
        }

        if active_session.destroyed() {
            warn!("Ignoring FUSE operation after destroy: {}", self.request);
            self.reply(sender).error(ll::Errno::EIO);
            return Ok(());
        }

        warn!(
            "Operation {} is not wired into low-level dispatch",
            self.request
        );
        self.reply(sender).error(ll::Errno::ENOSYS);
        Ok(())
    }
}

fn init_on_filesystem<FS: Filesystem>(
    fs: &FS,
    req: &RequestParam,
    config: &mut KernelConfig,
) -> io::Result<()> {
    // `Filesystem::init` takes `&mut self` in the public trait but dispatch only ever
    // holds a shared `Arc<FS>`; filesystems that need interior mutability during init
    // should use their own locking, matching how every other trait method is called.
    #[allow(invalid_reference_casting)]
    let fs_mut = unsafe { &mut *(fs as *const FS as *mut FS) };
    fs_mut.init(req, config)
}
