//! Object Stream — a single HTTP transaction against a backing object,
//! streamed incrementally so large chunks never sit fully in memory.

use std::io::Read;

use bitflags::bitflags;
use log::{debug, warn};

use crate::marfs::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StreamState: u8 {
        const OPEN   = 0b01;
        const CLOSED = 0b10;
    }
}

/// The HTTP transport an `ObjectStream` drives. Split out of `ObjectStream`
/// so engine tests can substitute an in-memory double for real `reqwest`
/// traffic. `Sync` is required so `Arc<T>` can cross into the background
/// upload thread `open` spawns.
pub trait ObjectTransport: Send + Sync {
    /// Begin a GET, optionally with an open-ended byte range starting at
    /// `range_start`. Returns a readable body.
    fn get(&self, url: &str, range_start: Option<u64>) -> Result<Box<dyn Read + Send>>;

    /// Begin a PUT, streaming `body` to completion. `content_length` of
    /// `None` means chunked transfer encoding.
    fn put(&self, url: &str, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Result<()>;
}

/// `reqwest::blocking`-backed transport, grounded in the blocking-client
/// pattern used for object-store access in the `Moliholy-cvmfs-rust` example.
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(tls: bool) -> Result<ReqwestTransport> {
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(!tls)
            .build()
            .map_err(|_| Error::Transport { status: None })?;
        Ok(ReqwestTransport { client })
    }
}

impl ObjectTransport for ReqwestTransport {
    fn get(&self, url: &str, range_start: Option<u64>) -> Result<Box<dyn Read + Send>> {
        let mut req = self.client.get(url);
        if let Some(start) = range_start {
            req = req.header(reqwest::header::RANGE, format!("bytes={start}-"));
        }
        let resp = req.send().map_err(|_| Error::Transport { status: None })?;
        let status = resp.status().as_u16();
        if status != 200 && status != 206 {
            return Err(Error::Transport {
                status: Some(status),
            });
        }
        Ok(Box::new(resp))
    }

    fn put(&self, url: &str, content_length: Option<u64>, body: Box<dyn Read + Send>) -> Result<()> {
        let mut req = self.client.put(url);
        req = match content_length {
            Some(len) => req.header(reqwest::header::CONTENT_LENGTH, len).body(reqwest::blocking::Body::sized(body, len)),
            None => req.body(reqwest::blocking::Body::new(body)),
        };
        let resp = req.send().map_err(|_| Error::Transport { status: None })?;
        let status = resp.status().as_u16();
        if status != 200 && status != 201 && status != 204 {
            return Err(Error::Transport {
                status: Some(status),
            });
        }
        Ok(())
    }
}

/// Single-HTTP-transaction session over one backing object.
pub struct ObjectStream<T: ObjectTransport = ReqwestTransport> {
    transport: std::sync::Arc<T>,
    url: String,
    method: Option<Method>,
    state: StreamState,
    written: u64,
    reader: Option<Box<dyn Read + Send>>,
    pending_put: Option<std::sync::mpsc::SyncSender<Vec<u8>>>,
    put_join: Option<std::thread::JoinHandle<Result<()>>>,
}

impl<T: ObjectTransport + 'static> ObjectStream<T> {
    pub fn new(transport: std::sync::Arc<T>, url: String) -> ObjectStream<T> {
        ObjectStream {
            transport,
            url,
            method: None,
            state: StreamState::empty(),
            written: 0,
            reader: None,
            pending_put: None,
            put_join: None,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Point the stream at a new backing object. Used when the engine rolls
    /// over to the next chunk; `written` (and any `preserve_written` request
    /// passed to the next `open`) is unaffected by this alone.
    pub fn set_url(&mut self, url: String) {
        self.url = url;
    }

    /// Start a GET or PUT. `preserve_written` keeps the cumulative `written`
    /// counter across a re-open onto the next chunk of a multi-object file.
    pub fn open(&mut self, method: Method, size_hint: u64, preserve_written: bool) -> Result<()> {
        if !preserve_written {
            self.written = 0;
        }
        self.method = Some(method);
        self.state = StreamState::OPEN;

        match method {
            Method::Get => {
                self.reader = Some(self.transport.get(&self.url, None)?);
            }
            Method::Put => {
                let (tx, rx) = std::sync::mpsc::sync_channel::<Vec<u8>>(1);
                let transport = self.transport.clone();
                let url = self.url.clone();
                let content_length = if size_hint == 0 { None } else { Some(size_hint) };
                let body = Box::new(ChannelReader { rx, buf: Vec::new() });
                self.pending_put = Some(tx);
                self.put_join = Some(std::thread::spawn(move || {
                    transport.put(&url, content_length, body)
                }));
            }
        }
        Ok(())
    }

    /// Open a ranged GET starting at `offset`.
    pub fn open_range(&mut self, offset: u64, preserve_written: bool) -> Result<()> {
        if !preserve_written {
            self.written = 0;
        }
        self.method = Some(Method::Get);
        self.state = StreamState::OPEN;
        self.reader = Some(self.transport.get(&self.url, Some(offset))?);
        Ok(())
    }

    /// Push `n` bytes into an open PUT stream.
    pub fn put(&mut self, buf: &[u8]) -> Result<()> {
        let tx = self
            .pending_put
            .as_ref()
            .ok_or(Error::Layout("put on a stream that is not open for writing"))?;
        tx.send(buf.to_vec())
            .map_err(|_| Error::Transport { status: None })?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Read up to `buf.len()` bytes from an open GET stream. May return
    /// fewer bytes than requested; the engine retries the sub-range.
    pub fn get(&mut self, buf: &mut [u8]) -> Result<usize> {
        let reader = self
            .reader
            .as_mut()
            .ok_or(Error::Layout("get on a stream that is not open for reading"))?;
        let n = reader.read(buf).map_err(|_| Error::Transport { status: None })?;
        self.written += n as u64;
        Ok(n)
    }

    /// Block until all in-flight transfer completes.
    pub fn sync(&mut self) -> Result<()> {
        if let Some(tx) = self.pending_put.take() {
            drop(tx);
            if let Some(join) = self.put_join.take() {
                join.join().map_err(|_| Error::Transport { status: None })??;
            }
        }
        Ok(())
    }

    /// End the session cleanly; stats (`written`) survive a `close`.
    pub fn close(&mut self) -> Result<()> {
        self.sync()?;
        self.reader = None;
        self.state = StreamState::CLOSED;
        debug!("object stream closed, written={} url={}", self.written, self.url);
        Ok(())
    }

    /// Abort a pending PUT: the writer-side channel drops without further
    /// sends, so the upload thread's reader sees EOF early and the server
    /// discards the partial body. Used on `ftruncate(0)`.
    pub fn abort(&mut self) -> Result<()> {
        if self.pending_put.take().is_some() {
            warn!("aborting in-flight object PUT url={}", self.url);
        }
        if let Some(join) = self.put_join.take() {
            let _ = join.join();
        }
        self.close()
    }
}

/// Adapts the bounded channel the engine pushes bytes into as a blocking
/// `Read`, so `reqwest::blocking`'s body consumer can pull at its own pace.
struct ChannelReader {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        if self.buf.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.buf = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len());
        out[..n].copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    struct FakeTransport {
        data: Mutex<Vec<u8>>,
        puts: Mutex<Vec<Vec<u8>>>,
    }

    impl ObjectTransport for FakeTransport {
        fn get(&self, _url: &str, range_start: Option<u64>) -> Result<Box<dyn Read + Send>> {
            let data = self.data.lock().unwrap();
            let start = range_start.unwrap_or(0) as usize;
            Ok(Box::new(Cursor::new(data[start.min(data.len())..].to_vec())))
        }

        fn put(&self, _url: &str, _content_length: Option<u64>, mut body: Box<dyn Read + Send>) -> Result<()> {
            let mut buf = Vec::new();
            body.read_to_end(&mut buf).map_err(|_| Error::Transport { status: None })?;
            self.puts.lock().unwrap().push(buf);
            Ok(())
        }
    }

    #[test]
    fn get_reads_from_range_start() {
        let transport = Arc::new(FakeTransport {
            data: Mutex::new(b"hello world".to_vec()),
            puts: Mutex::new(Vec::new()),
        });
        let mut stream = ObjectStream::new(transport, "http://x/obj".to_string());
        stream.open_range(6, false).unwrap();
        let mut buf = [0u8; 5];
        let n = stream.get(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
    }

    #[test]
    fn put_then_sync_delivers_full_body() {
        let transport = Arc::new(FakeTransport {
            data: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
        });
        let mut stream = ObjectStream::new(transport.clone(), "http://x/obj".to_string());
        stream.open(Method::Put, 11, false).unwrap();
        stream.put(b"hello ").unwrap();
        stream.put(b"world").unwrap();
        stream.sync().unwrap();
        assert_eq!(stream.written(), 11);
        assert_eq!(transport.puts.lock().unwrap()[0], b"hello world");
    }

    #[test]
    fn preserve_written_carries_counter_across_reopen() {
        let transport = Arc::new(FakeTransport {
            data: Mutex::new(Vec::new()),
            puts: Mutex::new(Vec::new()),
        });
        let mut stream = ObjectStream::new(transport, "http://x/obj".to_string());
        stream.open(Method::Put, 0, false).unwrap();
        stream.put(b"abc").unwrap();
        stream.sync().unwrap();
        stream.open(Method::Put, 0, true).unwrap();
        assert_eq!(stream.written(), 3);
    }
}
