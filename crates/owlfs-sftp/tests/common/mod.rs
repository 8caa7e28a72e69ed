//! Test client speaking SFTP v3 over an in-memory pipe or an SSH channel

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use owlfs_core::{
    DirEntry, MemoryFs, Metadata, OpenOptions, SetAttrs, Vfs, VfsFile, VfsPath,
};
use owlfs_sftp::protocol::{FileAttrs, MessageType, OpenFlags, StatusCode, codec};
use owlfs_sftp::{SessionLimits, SftpSession};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// A decoded server packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Version(u32),
    Status(StatusCode, String),
    Handle(Vec<u8>),
    Data(Vec<u8>),
    Name(Vec<(String, String, FileAttrs)>),
    Attrs(FileAttrs),
}

impl Reply {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Reply::Status(code, _) => Some(*code),
            _ => None,
        }
    }

    fn decode(packet: &[u8]) -> (u32, Reply) {
        let mut buf = packet;
        let kind = MessageType::try_from(buf.get_u8()).unwrap();
        if kind == MessageType::Version {
            return (0, Reply::Version(buf.get_u32()));
        }
        let id = buf.get_u32();
        let reply = match kind {
            MessageType::Status => {
                let code = StatusCode::try_from(buf.get_u32()).unwrap();
                let message = codec::get_string(&mut buf).unwrap();
                Reply::Status(code, message)
            }
            MessageType::Handle => Reply::Handle(codec::get_bytes(&mut buf).unwrap()),
            MessageType::Data => Reply::Data(codec::get_bytes(&mut buf).unwrap()),
            MessageType::Name => {
                let count = buf.get_u32();
                let entries = (0..count)
                    .map(|_| {
                        let filename = codec::get_string(&mut buf).unwrap();
                        let longname = codec::get_string(&mut buf).unwrap();
                        let attrs = FileAttrs::decode(&mut buf).unwrap();
                        (filename, longname, attrs)
                    })
                    .collect();
                Reply::Name(entries)
            }
            MessageType::Attrs => Reply::Attrs(FileAttrs::decode(&mut buf).unwrap()),
            other => panic!("unexpected server packet {other:?}"),
        };
        (id, reply)
    }
}

/// Client end of one SFTP session
pub struct TestClient<S = DuplexStream> {
    framed: Framed<S, LengthDelimitedCodec>,
    next_id: u32,
    pub shutdown: CancellationToken,
    /// Set when the session runs in this process
    session: Option<JoinHandle<owlfs_sftp::Result<()>>>,
}

impl TestClient {
    /// Start a session without sending SSH_FXP_INIT
    pub fn spawn(vfs: Arc<dyn Vfs>, limits: SessionLimits) -> Self {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let shutdown = CancellationToken::new();
        let session = tokio::spawn(SftpSession::new(vfs, limits).run(server, shutdown.clone()));
        Self {
            framed: Framed::new(client, LengthDelimitedCodec::new()),
            next_id: 1,
            shutdown,
            session: Some(session),
        }
    }

    /// Start a session and complete the version exchange
    pub async fn connect(vfs: Arc<dyn Vfs>, limits: SessionLimits) -> Self {
        let mut client = Self::spawn(vfs, limits);
        assert_eq!(client.init(3).await, 3);
        client
    }

    pub async fn connect_memory() -> (Self, Arc<MemoryFs>) {
        let fs = Arc::new(MemoryFs::new());
        let client = Self::connect(fs.clone(), SessionLimits::default()).await;
        (client, fs)
    }

    /// Hang up and wait for the session to finish
    pub async fn finish(self) -> owlfs_sftp::Result<()> {
        let Self {
            framed, session, ..
        } = self;
        drop(framed);
        session.expect("session runs in process").await.unwrap()
    }

    /// Wait for the session to end on its own
    pub async fn join(self) -> owlfs_sftp::Result<()> {
        let Self {
            framed, session, ..
        } = self;
        let result = session.expect("session runs in process").await.unwrap();
        drop(framed);
        result
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Speak SFTP over an already running session, such as an SSH channel
    pub async fn over(stream: S) -> Self {
        let mut client = Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            next_id: 1,
            shutdown: CancellationToken::new(),
            session: None,
        };
        assert_eq!(client.init(3).await, 3);
        client
    }

    pub async fn init(&mut self, version: u32) -> u32 {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Init as u8);
        buf.put_u32(version);
        self.send_raw(buf.freeze()).await;
        match self.recv().await {
            (_, Reply::Version(version)) => version,
            other => panic!("expected version, got {other:?}"),
        }
    }

    pub async fn send_raw(&mut self, packet: Bytes) {
        self.framed.send(packet).await.unwrap();
    }

    /// Send a request without waiting for its reply
    pub async fn send(&mut self, kind: MessageType, body: impl FnOnce(&mut BytesMut)) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        let mut buf = BytesMut::new();
        buf.put_u8(kind as u8);
        buf.put_u32(id);
        body(&mut buf);
        self.send_raw(buf.freeze()).await;
        id
    }

    pub async fn recv(&mut self) -> (u32, Reply) {
        let frame = self
            .framed
            .next()
            .await
            .expect("session closed the stream")
            .unwrap();
        Reply::decode(&frame)
    }

    /// Send a request and wait for its reply
    pub async fn call(&mut self, kind: MessageType, body: impl FnOnce(&mut BytesMut)) -> Reply {
        let id = self.send(kind, body).await;
        let (reply_id, reply) = self.recv().await;
        assert_eq!(reply_id, id, "reply for another request");
        reply
    }

    pub async fn open(&mut self, path: &str, flags: u32) -> Reply {
        self.call(MessageType::Open, |buf| {
            codec::put_string(buf, path);
            buf.put_u32(flags);
            buf.put_u32(0);
        })
        .await
    }

    /// Open and unwrap the handle
    pub async fn open_handle(&mut self, path: &str, flags: u32) -> Vec<u8> {
        match self.open(path, flags).await {
            Reply::Handle(handle) => handle,
            other => panic!("open {path} failed: {other:?}"),
        }
    }

    pub async fn close(&mut self, handle: &[u8]) -> Reply {
        self.call(MessageType::Close, |buf| codec::put_bytes(buf, handle))
            .await
    }

    pub async fn read(&mut self, handle: &[u8], offset: u64, len: u32) -> Reply {
        self.call(MessageType::Read, |buf| {
            codec::put_bytes(buf, handle);
            buf.put_u64(offset);
            buf.put_u32(len);
        })
        .await
    }

    pub async fn write(&mut self, handle: &[u8], offset: u64, data: &[u8]) -> Reply {
        self.call(MessageType::Write, |buf| write_body(buf, handle, offset, data))
            .await
    }

    pub async fn opendir(&mut self, path: &str) -> Reply {
        self.call(MessageType::Opendir, |buf| codec::put_string(buf, path))
            .await
    }

    pub async fn readdir(&mut self, handle: &[u8]) -> Reply {
        self.call(MessageType::Readdir, |buf| codec::put_bytes(buf, handle))
            .await
    }

    pub async fn path_request(&mut self, kind: MessageType, path: &str) -> Reply {
        self.call(kind, |buf| codec::put_string(buf, path)).await
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Reply {
        self.call(MessageType::Rename, |buf| {
            codec::put_string(buf, from);
            codec::put_string(buf, to);
        })
        .await
    }

    /// Write a whole file through a fresh handle
    pub async fn put_file(&mut self, path: &str, data: &[u8]) {
        let handle = self
            .open_handle(
                path,
                OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            )
            .await;
        assert_eq!(self.write(&handle, 0, data).await.status(), Some(StatusCode::Ok));
        assert_eq!(self.close(&handle).await.status(), Some(StatusCode::Ok));
    }

    /// Read a whole file through a fresh handle
    pub async fn get_file(&mut self, path: &str) -> Vec<u8> {
        let handle = self.open_handle(path, OpenFlags::READ).await;
        let mut content = Vec::new();
        loop {
            match self.read(&handle, content.len() as u64, 32 * 1024).await {
                Reply::Data(data) => content.extend_from_slice(&data),
                Reply::Status(StatusCode::Eof, _) => break,
                other => panic!("read {path} failed: {other:?}"),
            }
        }
        assert_eq!(self.close(&handle).await.status(), Some(StatusCode::Ok));
        content
    }
}

pub fn write_body(buf: &mut BytesMut, handle: &[u8], offset: u64, data: &[u8]) {
    codec::put_bytes(buf, handle);
    buf.put_u64(offset);
    codec::put_bytes(buf, data);
}

/// MemoryFs wrapper counting files that are open at the VFS level
#[derive(Clone)]
pub struct TrackingFs {
    inner: MemoryFs,
    open_files: Arc<AtomicUsize>,
}

impl TrackingFs {
    pub fn new(inner: MemoryFs) -> Self {
        Self {
            inner,
            open_files: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn open_files(&self) -> usize {
        self.open_files.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Vfs for TrackingFs {
    async fn stat(&self, path: &VfsPath) -> owlfs_core::Result<Metadata> {
        self.inner.stat(path).await
    }

    async fn open(
        &self,
        path: &VfsPath,
        options: OpenOptions,
    ) -> owlfs_core::Result<Box<dyn VfsFile>> {
        let inner = self.inner.open(path, options).await?;
        self.open_files.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TrackedFile {
            inner,
            open_files: self.open_files.clone(),
        }))
    }

    async fn read_dir(&self, path: &VfsPath) -> owlfs_core::Result<Vec<DirEntry>> {
        self.inner.read_dir(path).await
    }

    async fn remove(&self, path: &VfsPath) -> owlfs_core::Result<()> {
        self.inner.remove(path).await
    }

    async fn rename(&self, from: &VfsPath, to: &VfsPath) -> owlfs_core::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn mkdir(&self, path: &VfsPath) -> owlfs_core::Result<()> {
        self.inner.mkdir(path).await
    }

    async fn rmdir(&self, path: &VfsPath) -> owlfs_core::Result<()> {
        self.inner.rmdir(path).await
    }

    async fn set_attrs(&self, path: &VfsPath, attrs: &SetAttrs) -> owlfs_core::Result<()> {
        self.inner.set_attrs(path, attrs).await
    }
}

struct TrackedFile {
    inner: Box<dyn VfsFile>,
    open_files: Arc<AtomicUsize>,
}

#[async_trait]
impl VfsFile for TrackedFile {
    async fn read_at(&self, offset: u64, len: u32) -> owlfs_core::Result<Bytes> {
        self.inner.read_at(offset, len).await
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> owlfs_core::Result<()> {
        self.inner.write_at(offset, data).await
    }

    async fn stat(&self) -> owlfs_core::Result<Metadata> {
        self.inner.stat().await
    }

    async fn set_attrs(&self, attrs: &SetAttrs) -> owlfs_core::Result<()> {
        self.inner.set_attrs(attrs).await
    }

    async fn close(self: Box<Self>) -> owlfs_core::Result<()> {
        self.open_files.fetch_sub(1, Ordering::SeqCst);
        self.inner.close().await
    }
}
