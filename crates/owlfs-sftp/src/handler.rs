//! Per-connection SSH handler
//!
//! Authenticates the client and multiplexes its session channels: an `sftp`
//! subsystem request starts an [`SftpSession`], exec and shell requests go to
//! the [`ShellEmulator`]. Channel data is bridged to those engines through an
//! in-memory pipe, and their output is pumped back onto the channel.

use crate::audit::{AuditEvent, ConnectionInfo};
use crate::auth::{AuthMethod, Authenticator, Credential};
use crate::session::{SessionLimits, SftpSession};
use crate::shell::{EXIT_SUCCESS, LineBuffer, ShellEmulator, ShellOutput};
use crate::{Error, Result};
use chrono::Utc;
use owlfs_core::Vfs;
use russh::keys::PublicKey;
use russh::server::{Auth, Handle, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

/// The only subsystem served
pub const SFTP_SUBSYSTEM: &str = "sftp";

/// Extended data type code for stderr (RFC 4254 section 5.2)
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Capacity of the in-memory pipe between a channel and the SFTP engine
const PIPE_BUFFER_SIZE: usize = 256 * 1024;

/// Largest chunk forwarded from the engine to the channel at once
const OUTPUT_CHUNK_SIZE: usize = 32 * 1024;

/// Channel data packets buffered ahead of a busy program
///
/// Once full, `data` waits and the connection stops reading from the socket.
const INPUT_QUEUE_DEPTH: usize = 64;

/// State shared by every connection of one server
pub(crate) struct ServerContext {
    pub vfs: Arc<dyn Vfs>,
    pub authenticator: Authenticator,
    pub limits: SessionLimits,
    pub max_auth_attempts: usize,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Program {
    Idle,
    Sftp,
    Shell,
    Exec,
}

struct ChannelState {
    program: Program,
    /// Forwards client data to the running program
    input: Option<mpsc::Sender<Vec<u8>>>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            program: Program::Idle,
            input: None,
        }
    }
}

/// russh handler for one client connection
pub(crate) struct ConnectionHandler {
    ctx: Arc<ServerContext>,
    connection: ConnectionInfo,
    failed_attempts: usize,
    channels: HashMap<ChannelId, ChannelState>,
    /// Tasks serving this connection's channels
    tasks: TaskTracker,
}

impl ConnectionHandler {
    pub fn new(ctx: Arc<ServerContext>, connection: ConnectionInfo, tasks: TaskTracker) -> Self {
        Self {
            ctx,
            connection,
            failed_attempts: 0,
            channels: HashMap::new(),
            tasks,
        }
    }

    /// Evaluate one credential attempt and enforce the retry cap
    fn decide(&mut self, credential: Credential<'_>) -> Result<Auth> {
        let decision = self.ctx.authenticator.authenticate(&credential);
        AuditEvent::auth_attempt(&self.connection, credential.user(), &decision).log();

        if decision.is_accepted() {
            self.connection.principal = decision.principal().map(str::to_string);
            return Ok(Auth::Accept);
        }

        // Clients open with a "none" probe to discover the methods on offer
        if credential.method() != AuthMethod::None {
            self.failed_attempts += 1;
        }
        if self.failed_attempts >= self.ctx.max_auth_attempts {
            AuditEvent::AuthAttemptsExceeded {
                connection_id: self.connection.connection_id.clone(),
                peer: self.connection.peer,
                attempts: self.failed_attempts,
                timestamp: Utc::now(),
            }
            .log();
            return Err(Error::Authentication(format!(
                "{} failed attempts",
                self.failed_attempts
            )));
        }

        Ok(Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        })
    }

    fn start_sftp(&mut self, channel: ChannelId, handle: Handle) {
        let (client_pipe, server_pipe) = tokio::io::duplex(PIPE_BUFFER_SIZE);
        let (client_read, mut client_write) = tokio::io::split(client_pipe);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);

        if let Some(state) = self.channels.get_mut(&channel) {
            state.program = Program::Sftp;
            state.input = Some(tx);
        }

        let span = info_span!("sftp", channel = ?channel);
        let shutdown = self.ctx.shutdown.child_token();

        let feeder_shutdown = shutdown.clone();
        self.tasks.spawn(
            async move {
                loop {
                    let data = tokio::select! {
                        _ = feeder_shutdown.cancelled() => break,
                        data = rx.recv() => data,
                    };
                    let Some(data) = data else { break };
                    if let Err(e) = client_write.write_all(&data).await {
                        debug!(error = %e, "SFTP input pipe closed");
                        break;
                    }
                }
                let _ = client_write.shutdown().await;
            }
            .instrument(span.clone()),
        );

        let session = SftpSession::new(self.ctx.vfs.clone(), self.ctx.limits)
            .with_connection(self.connection.clone());
        self.tasks.spawn(
            async move {
                if let Err(e) = session.run(server_pipe, shutdown).await {
                    debug!(error = %e, "SFTP session error");
                }
            }
            .instrument(span.clone()),
        );

        self.tasks
            .spawn(pump_output(handle, channel, client_read).instrument(span));
    }

    fn start_shell(&mut self, channel: ChannelId, handle: Handle) {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_DEPTH);
        if let Some(state) = self.channels.get_mut(&channel) {
            state.program = Program::Shell;
            state.input = Some(tx);
        }

        let emulator = ShellEmulator::new(self.ctx.vfs.clone());
        let shutdown = self.ctx.shutdown.child_token();
        self.tasks.spawn(
            run_shell(emulator, handle, channel, rx, shutdown)
                .instrument(info_span!("shell", channel = ?channel)),
        );
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.connection.closed().log();
    }
}

impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth> {
        self.decide(Credential::None { user })
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        self.decide(Credential::Password { user, password })
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth> {
        self.decide(Credential::PublicKey {
            user,
            key: public_key,
        })
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        debug!(event = "channel_opened", channel = ?channel.id(), "Session channel opened");
        self.channels.insert(channel.id(), ChannelState::new());
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        let idle = self
            .channels
            .get(&channel)
            .is_some_and(|state| state.program == Program::Idle);

        if name != SFTP_SUBSYSTEM {
            warn!(channel = ?channel, subsystem = name, "Unsupported subsystem requested");
            session.channel_failure(channel)?;
            return Ok(());
        }
        if !idle {
            warn!(channel = ?channel, "Channel already runs a program, refusing SFTP");
            session.channel_failure(channel)?;
            return Ok(());
        }

        info!(
            event = "sftp_subsystem_started",
            channel = ?channel,
            principal = ?self.connection.principal,
            "Starting SFTP subsystem"
        );
        session.channel_success(channel)?;
        self.start_sftp(channel, session.handle());
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<()> {
        let Some(state) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };
        if !matches!(state.program, Program::Idle | Program::Exec) {
            warn!(channel = ?channel, "Channel already runs a program, refusing exec");
            session.channel_failure(channel)?;
            return Ok(());
        }
        state.program = Program::Exec;

        let command = String::from_utf8_lossy(data).into_owned();
        info!(event = "exec_request", channel = ?channel, command = %command, "Shell command requested");
        session.channel_success(channel)?;

        let emulator = ShellEmulator::new(self.ctx.vfs.clone());
        let handle = session.handle();
        self.tasks.spawn(
            async move {
                let output = emulator.execute(&command).await;
                debug!(exit_status = output.exit_status, "Shell command finished");
                send_output(&handle, channel, &output).await;
                finish_channel(&handle, channel, output.exit_status).await;
            }
            .in_current_span(),
        );
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<()> {
        let idle = self
            .channels
            .get(&channel)
            .is_some_and(|state| state.program == Program::Idle);
        if !idle {
            session.channel_failure(channel)?;
            return Ok(());
        }

        info!(event = "shell_request", channel = ?channel, "Interactive shell requested");
        session.channel_success(channel)?;
        self.start_shell(channel, session.handle());
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], _session: &mut Session) -> Result<()> {
        let input = self
            .channels
            .get(&channel)
            .and_then(|state| state.input.clone());
        if let Some(input) = input {
            // The receiving side may already be gone after a protocol error
            let _ = input.send(data.to_vec()).await;
        }
        Ok(())
    }

    async fn channel_eof(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.input = None;
        }
        Ok(())
    }

    async fn channel_close(&mut self, channel: ChannelId, _session: &mut Session) -> Result<()> {
        debug!(event = "channel_closed", channel = ?channel, "Channel closed");
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Copy engine output onto the channel, then close it
async fn pump_output<R>(handle: Handle, channel: ChannelId, mut output: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; OUTPUT_CHUNK_SIZE];
    loop {
        match output.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if handle.data(channel, buf[..n].to_vec().into()).await.is_err() {
                    debug!("Channel gone while sending SFTP output");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to read SFTP output");
                break;
            }
        }
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

/// Run emulator commands line by line until `exit` or end of input
async fn run_shell(
    emulator: ShellEmulator,
    handle: Handle,
    channel: ChannelId,
    mut input: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut lines = LineBuffer::default();
    let mut status = EXIT_SUCCESS;

    'session: loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = input.recv() => received,
        };
        let (batch, done) = match received {
            Some(data) => (lines.push(&data), false),
            None => (std::mem::take(&mut lines).finish().into_iter().collect(), true),
        };

        for line in batch {
            let line = line.trim();
            if line == "exit" {
                break 'session;
            }
            if line.is_empty() {
                continue;
            }
            let output = emulator.execute(line).await;
            status = output.exit_status;
            if !send_output(&handle, channel, &output).await {
                break 'session;
            }
        }
        if done {
            break;
        }
    }

    finish_channel(&handle, channel, status).await;
}

/// Returns false once the channel can no longer be written
async fn send_output(handle: &Handle, channel: ChannelId, output: &ShellOutput) -> bool {
    if !output.stdout.is_empty()
        && handle
            .data(channel, output.stdout.as_bytes().to_vec().into())
            .await
            .is_err()
    {
        return false;
    }
    if !output.stderr.is_empty()
        && handle
            .extended_data(
                channel,
                SSH_EXTENDED_DATA_STDERR,
                output.stderr.as_bytes().to_vec().into(),
            )
            .await
            .is_err()
    {
        return false;
    }
    true
}

async fn finish_channel(handle: &Handle, channel: ChannelId, exit_status: u32) {
    let _ = handle.exit_status_request(channel, exit_status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}
