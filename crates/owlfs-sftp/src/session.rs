//! SFTP session engine
//!
//! Runs one SFTP subsystem over any byte stream. The session waits for
//! SSH_FXP_INIT, answers with the negotiated version, then serves requests
//! until the stream ends or shutdown is requested. Requests are pipelined:
//! each one runs on its own task and responses are written as they complete,
//! so they may leave out of order. Operations sharing a handle still apply
//! in the order they arrived (see [`crate::handles`]).
//!
//! When the session ends, in-flight requests are drained and every handle
//! the client left open is closed.

use crate::audit::ConnectionInfo;
use crate::config::{Config, MAX_READ_LEN};
use crate::handles::{HandleTable, OpenObject, SharedObject, Turn};
use crate::protocol::{
    FileAttrs, Incoming, NameEntry, Request, Response, SFTP_VERSION, StatusCode, long_name,
};
use crate::{Error, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use owlfs_core::{Vfs, VfsPath};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Responses queued for the writer before request tasks are held back
const RESPONSE_QUEUE_DEPTH: usize = 64;

/// Per-session limits taken from [`Config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_packet_size: u32,
    pub max_open_handles: usize,
    pub readdir_batch_size: usize,
}

impl From<&Config> for SessionLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            max_open_handles: config.max_open_handles,
            readdir_batch_size: config.readdir_batch_size,
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// One SFTP subsystem instance
pub struct SftpSession {
    vfs: Arc<dyn Vfs>,
    limits: SessionLimits,
    connection: ConnectionInfo,
}

impl SftpSession {
    pub fn new(vfs: Arc<dyn Vfs>, limits: SessionLimits) -> Self {
        Self {
            vfs,
            limits,
            connection: ConnectionInfo::new(None),
        }
    }

    /// Attribute audit events to an authenticated connection
    pub fn with_connection(mut self, connection: ConnectionInfo) -> Self {
        self.connection = connection;
        self
    }

    /// Serve the session until the client goes away or `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns an error when the stream fails, a frame exceeds the packet
    /// limit, or the client speaks before sending SSH_FXP_INIT. The stream
    /// should then be torn down.
    pub async fn run<S>(self, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .max_frame_length(self.limits.max_packet_size as usize)
            .new_codec();
        let (mut sink, mut frames) = Framed::new(stream, codec).split();

        let client_version = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = frames.next() => match frame {
                None => return Ok(()),
                Some(frame) => match Incoming::decode(&frame?)? {
                    Incoming::Init { version } => version,
                    Incoming::Request { request, .. } => {
                        return Err(Error::Protocol(format!(
                            "expected SSH_FXP_INIT, got {} request",
                            request.name()
                        )));
                    }
                    Incoming::Malformed { reason, .. } => {
                        return Err(Error::Protocol(format!(
                            "expected SSH_FXP_INIT, got malformed packet: {reason}"
                        )));
                    }
                },
            },
        };

        let version = client_version.min(SFTP_VERSION);
        sink.send(Response::Version { version }.encode(0)).await?;
        info!(client_version, version, "SFTP session started");

        let (tx, mut rx) = mpsc::channel::<Bytes>(RESPONSE_QUEUE_DEPTH);
        let writer = tokio::spawn(
            async move {
                while let Some(packet) = rx.recv().await {
                    sink.send(packet).await?;
                }
                sink.close().await
            }
            .in_current_span(),
        );

        let state = Arc::new(SessionState {
            vfs: self.vfs,
            handles: Mutex::new(HandleTable::new(self.limits.max_open_handles)),
            limits: self.limits,
            connection: self.connection,
        });
        let mut tasks = JoinSet::new();

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested, draining SFTP session");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "SFTP request task failed");
                    }
                }
                frame = frames.next() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(Error::from(e)),
                    Some(Ok(frame)) => match Incoming::decode(&frame) {
                        Ok(Incoming::Request { id, request }) => {
                            state.dispatch(id, request, &mut tasks, &tx).await;
                        }
                        Ok(Incoming::Malformed { id, reason }) => {
                            debug!(id, reason = %reason, "Malformed SFTP request");
                            let response = Response::status(StatusCode::BadMessage, reason);
                            let _ = tx.send(response.encode(id)).await;
                        }
                        Ok(Incoming::Init { .. }) => {
                            warn!("Ignoring repeated SSH_FXP_INIT");
                        }
                        Err(e) => break Err(e),
                    },
                },
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "SFTP request task failed");
            }
        }
        state.close_all().await;

        drop(tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "SFTP response stream closed early"),
            Err(e) => warn!(error = %e, "SFTP response writer failed"),
        }

        match &result {
            Ok(()) => info!("SFTP session ended"),
            Err(e) => warn!(error = %e, "SFTP session terminated"),
        }
        result
    }
}

struct SessionState {
    vfs: Arc<dyn Vfs>,
    handles: Mutex<HandleTable>,
    limits: SessionLimits,
    connection: ConnectionInfo,
}

impl SessionState {
    /// Queue a request; handle lookups happen here so they follow arrival order
    async fn dispatch(
        self: &Arc<Self>,
        id: u32,
        request: Request,
        tasks: &mut JoinSet<()>,
        tx: &mpsc::Sender<Bytes>,
    ) {
        let op = request.name();
        debug!(id, op, "SFTP request");

        let slot = match &request {
            Request::Close { handle } => Some(self.handles.lock().await.remove(handle)),
            other => match other.handle() {
                Some(handle) => Some(self.handles.lock().await.acquire(handle)),
                None => None,
            },
        };
        let slot = match slot.transpose() {
            Ok(slot) => slot,
            Err(e) => {
                let _ = tx.send(self.error_response(id, op, &e).encode(id)).await;
                return;
            }
        };

        let state = Arc::clone(self);
        let tx = tx.clone();
        tasks.spawn(
            async move {
                let response = match state.execute(request, slot).await {
                    Ok(response) => response,
                    Err(e) => state.error_response(id, op, &e),
                };
                let _ = tx.send(response.encode(id)).await;
            }
            .in_current_span(),
        );
    }

    async fn execute(&self, request: Request, slot: Option<(SharedObject, Turn)>) -> Result<Response> {
        match request {
            Request::Open { path, flags, .. } => {
                let path = resolve(&path)?;
                let mut options = flags.to_options();
                if !options.read && !options.is_writable() {
                    options.read = true;
                }
                let file = self.vfs.open(&path, options).await?;
                self.bind(OpenObject::File { file, path }).await
            }
            Request::Opendir { path } => {
                let path = resolve(&path)?;
                let pending = VecDeque::from(self.vfs.read_dir(&path).await?);
                self.bind(OpenObject::Dir { path, pending }).await
            }
            Request::Close { .. } => {
                let (object, turn) = required(slot)?;
                close(object, turn).await
            }
            Request::Read { offset, len, .. } => {
                let (object, turn) = required(slot)?;
                read(object, turn, offset, len).await
            }
            Request::Write { offset, data, .. } => {
                let (object, turn) = required(slot)?;
                write(object, turn, offset, data).await
            }
            Request::Readdir { .. } => {
                let (object, turn) = required(slot)?;
                self.readdir(object, turn).await
            }
            Request::Fstat { .. } => {
                let (object, mut turn) = required(slot)?;
                turn.wait().await;
                let guard = object.lock().await;
                let meta = match guard.as_ref() {
                    Some(OpenObject::File { file, .. }) => file.stat().await?,
                    Some(OpenObject::Dir { path, .. }) => self.vfs.stat(path).await?,
                    None => return Err(closed()),
                };
                Ok(Response::Attrs(FileAttrs::from_metadata(&meta)))
            }
            Request::Fsetstat { attrs, .. } => {
                let (object, mut turn) = required(slot)?;
                turn.wait().await;
                let changes = attrs.to_set_attrs();
                let guard = object.lock().await;
                match guard.as_ref() {
                    Some(OpenObject::File { file, .. }) => file.set_attrs(&changes).await?,
                    Some(OpenObject::Dir { path, .. }) => {
                        self.vfs.set_attrs(path, &changes).await?
                    }
                    None => return Err(closed()),
                }
                Ok(Response::ok())
            }
            Request::Stat { path } | Request::Lstat { path } => {
                let meta = self.vfs.stat(&resolve(&path)?).await?;
                Ok(Response::Attrs(FileAttrs::from_metadata(&meta)))
            }
            Request::Setstat { path, attrs } => {
                let path = resolve(&path)?;
                let changes = attrs.to_set_attrs();
                if !changes.is_empty() {
                    self.vfs.set_attrs(&path, &changes).await?;
                }
                Ok(Response::ok())
            }
            Request::Remove { path } => {
                self.vfs.remove(&resolve(&path)?).await?;
                Ok(Response::ok())
            }
            Request::Mkdir { path, .. } => {
                self.vfs.mkdir(&resolve(&path)?).await?;
                Ok(Response::ok())
            }
            Request::Rmdir { path } => {
                self.vfs.rmdir(&resolve(&path)?).await?;
                Ok(Response::ok())
            }
            Request::Rename { from, to } => {
                let from = resolve(&from)?;
                let to = resolve(&to)?;
                self.vfs.rename(&from, &to).await?;
                Ok(Response::ok())
            }
            Request::Realpath { path } => {
                let path = resolve(&path)?.to_string();
                Ok(Response::Name(vec![NameEntry {
                    filename: path.clone(),
                    longname: path,
                    attrs: FileAttrs::default(),
                }]))
            }
            Request::Readlink { path } => {
                let target = self.vfs.read_link(&resolve(&path)?).await?;
                Ok(Response::Name(vec![NameEntry {
                    filename: target.clone(),
                    longname: target,
                    attrs: FileAttrs::default(),
                }]))
            }
            Request::Symlink { target, link } => {
                self.vfs.symlink(&target, &resolve(&link)?).await?;
                Ok(Response::ok())
            }
            Request::Extended { name } => Err(Error::NotSupported(format!(
                "extended request {name}"
            ))),
            Request::Unsupported { kind } => {
                Err(Error::NotSupported(format!("message type {kind}")))
            }
        }
    }

    async fn bind(&self, object: OpenObject) -> Result<Response> {
        let inserted = self.handles.lock().await.insert(object);
        match inserted {
            Ok(handle) => Ok(Response::Handle(handle)),
            Err((e, object)) => {
                if let OpenObject::File { file, path } = object
                    && let Err(close_err) = file.close().await
                {
                    debug!(path = %path, error = %close_err, "Failed to release unbound file");
                }
                Err(e)
            }
        }
    }

    async fn readdir(&self, object: SharedObject, mut turn: Turn) -> Result<Response> {
        turn.wait().await;
        let mut guard = object.lock().await;
        let pending = match guard.as_mut() {
            Some(OpenObject::Dir { pending, .. }) => pending,
            Some(OpenObject::File { .. }) => {
                return Err(Error::invalid_handle("not a directory handle"));
            }
            None => return Err(closed()),
        };
        if pending.is_empty() {
            return Ok(Response::status(StatusCode::Eof, "End of directory"));
        }

        let count = pending.len().min(self.limits.readdir_batch_size);
        let entries = pending
            .drain(..count)
            .map(|entry| {
                let longname = long_name(&entry.name, &entry.metadata);
                let attrs = FileAttrs::from_metadata(&entry.metadata);
                NameEntry {
                    filename: entry.name,
                    longname,
                    attrs,
                }
            })
            .collect();
        Ok(Response::Name(entries))
    }

    fn error_response(&self, id: u32, op: &str, err: &Error) -> Response {
        if err.is_security_event() {
            self.connection
                .security_event("request_denied", format!("{op}: {err}"))
                .log();
        }
        let code = err.to_status_code();
        if code == StatusCode::Failure {
            warn!(id, op, error = %err, "SFTP request failed");
        } else {
            debug!(id, op, status = ?code, error = %err, "SFTP request refused");
        }
        Response::status(code, err.sanitized_message())
    }

    /// Close every handle the client left open
    async fn close_all(&self) {
        let open = self.handles.lock().await.drain();
        if !open.is_empty() {
            debug!(count = open.len(), "Closing handles left open");
        }
        for (object, mut turn) in open {
            turn.wait().await;
            let taken = object.lock().await.take();
            if let Some(OpenObject::File { file, path }) = taken
                && let Err(e) = file.close().await
            {
                warn!(path = %path, error = %e, "Failed to close file at session end");
            }
        }
    }
}

fn resolve(raw: &str) -> Result<VfsPath> {
    Ok(VfsPath::parse(raw)?)
}

fn required(slot: Option<(SharedObject, Turn)>) -> Result<(SharedObject, Turn)> {
    slot.ok_or_else(|| Error::invalid_handle("request carries no handle"))
}

fn closed() -> Error {
    Error::invalid_handle("Handle is closed")
}

async fn close(object: SharedObject, mut turn: Turn) -> Result<Response> {
    turn.wait().await;
    let taken = object.lock().await.take();
    match taken {
        Some(OpenObject::File { file, path }) => {
            file.close().await?;
            debug!(path = %path, "Closed file handle");
        }
        Some(OpenObject::Dir { path, .. }) => debug!(path = %path, "Closed directory handle"),
        None => return Err(closed()),
    }
    Ok(Response::ok())
}

async fn read(object: SharedObject, mut turn: Turn, offset: u64, len: u32) -> Result<Response> {
    turn.wait().await;
    let guard = object.lock().await;
    let file = match guard.as_ref() {
        Some(OpenObject::File { file, .. }) => file,
        Some(OpenObject::Dir { .. }) => return Err(Error::invalid_handle("not a file handle")),
        None => return Err(closed()),
    };
    let data = file.read_at(offset, len.min(MAX_READ_LEN)).await?;
    if data.is_empty() {
        Ok(Response::status(StatusCode::Eof, "End of file"))
    } else {
        Ok(Response::Data(data))
    }
}

async fn write(object: SharedObject, mut turn: Turn, offset: u64, data: Bytes) -> Result<Response> {
    turn.wait().await;
    let guard = object.lock().await;
    match guard.as_ref() {
        Some(OpenObject::File { file, .. }) => file.write_at(offset, &data).await?,
        Some(OpenObject::Dir { .. }) => return Err(Error::invalid_handle("not a file handle")),
        None => return Err(closed()),
    }
    Ok(Response::ok())
}
