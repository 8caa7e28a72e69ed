//! SFTP Server Implementation
//!
//! Owns the listener and the lifecycle of every connection. Setup (config
//! validation, authentication policy, host key) happens in [`Server::new`]
//! so a misconfigured server never binds. Each accepted socket runs the SSH
//! handshake on its own task; the accept loop never waits on a client.

use crate::audit::ConnectionInfo;
use crate::auth::Authenticator;
use crate::config::Config;
use crate::handler::{ConnectionHandler, ServerContext};
use crate::host_key::get_host_key;
use crate::session::SessionLimits;
use crate::{Error, Result};
use owlfs_core::Vfs;
use russh::Disconnect;
use russh::keys::HashAlg;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Delay after a failed authentication attempt
const AUTH_REJECTION_TIME: Duration = Duration::from_secs(1);

/// Back-off after a failed `accept`, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// SFTP Server
pub struct Server {
    config: Arc<Config>,
    ctx: Arc<ServerContext>,
    ssh_config: Arc<russh::server::Config>,
    tracker: TaskTracker,
}

impl Server {
    /// Validate the configuration and prepare the host key and auth policy
    ///
    /// # Errors
    ///
    /// `Config` or `NoAuthPolicy` for an unusable configuration, `KeyLoad` or
    /// `KeyGen` when no host key can be obtained.
    pub fn new(config: Config, vfs: Arc<dyn Vfs>) -> Result<Self> {
        config.validate()?;
        let authenticator = Authenticator::from_config(&config)?;
        let cache_dir = config.cache_dir();
        let host_key = get_host_key(config.host_key.as_deref(), cache_dir.as_deref())?;

        info!(
            fingerprint = %host_key.public_key().fingerprint(HashAlg::Sha256),
            "Using host key"
        );

        let inactivity_timeout = (config.inactivity_timeout_secs > 0)
            .then(|| Duration::from_secs(config.inactivity_timeout_secs));
        let ssh_config = russh::server::Config {
            inactivity_timeout,
            auth_rejection_time: AUTH_REJECTION_TIME,
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            max_auth_attempts: config.max_auth_attempts,
            keys: vec![host_key],
            ..Default::default()
        };

        let ctx = Arc::new(ServerContext {
            vfs,
            authenticator,
            limits: SessionLimits::from(&config),
            max_auth_attempts: config.max_auth_attempts,
            shutdown: CancellationToken::new(),
        });

        Ok(Self {
            config: Arc::new(config),
            ctx,
            ssh_config: Arc::new(ssh_config),
            tracker: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Bind the listener and start accepting in the background
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn serve(&self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.listen_addr.as_str())
            .await
            .map_err(|e| {
                Error::Connection(format!("Failed to bind {}: {}", self.config.listen_addr, e))
            })?;
        let local_addr = listener.local_addr()?;

        info!(event = "listening", addr = %local_addr, "SFTP server listening");

        let ctx = self.ctx.clone();
        let ssh_config = self.ssh_config.clone();
        let tracker = self.tracker.clone();
        self.tracker
            .spawn(accept_loop(listener, ctx, ssh_config, tracker));
        Ok(local_addr)
    }

    /// Stop accepting and let every connection wind down
    pub fn shutdown(&self) {
        info!(event = "shutdown_requested", "SFTP server shutting down");
        self.ctx.shutdown.cancel();
    }

    /// Wait until the listener has stopped and every connection has ended
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!(event = "server_stopped", "SFTP server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    ssh_config: Arc<russh::server::Config>,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection = ConnectionInfo::new(Some(peer));
                    let span = info_span!(
                        "connection",
                        connection_id = %connection.connection_id,
                        peer = %peer
                    );
                    tracker.spawn(
                        run_connection(stream, connection, ctx.clone(), ssh_config.clone())
                            .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    debug!("Listener stopped");
}

async fn run_connection(
    stream: TcpStream,
    connection: ConnectionInfo,
    ctx: Arc<ServerContext>,
    ssh_config: Arc<russh::server::Config>,
) {
    connection.established().log();
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Failed to set TCP_NODELAY");
    }

    let channels = TaskTracker::new();
    let handler = ConnectionHandler::new(ctx.clone(), connection, channels.clone());

    // run_stream waits for the client's identification line
    let running = tokio::select! {
        _ = ctx.shutdown.cancelled() => {
            debug!("Shutdown before the SSH handshake completed");
            return;
        }
        result = russh::server::run_stream(ssh_config, stream, handler) => match result {
            Ok(running) => running,
            Err(e) => {
                warn!(event = "handshake_failed", error = %e, "SSH handshake failed");
                return;
            }
        },
    };
    let handle = running.handle();
    tokio::pin!(running);

    let mut draining = false;
    let mut disconnecting = false;
    let result = loop {
        tokio::select! {
            result = &mut running => break result,
            _ = ctx.shutdown.cancelled(), if !draining => {
                // Channel tasks observe the same token and finish their work
                draining = true;
                channels.close();
            }
            _ = channels.wait(), if draining && !disconnecting => {
                disconnecting = true;
                let handle = handle.clone();
                tokio::spawn(async move {
                    let _ = handle
                        .disconnect(
                            Disconnect::ByApplication,
                            "server shutting down".to_string(),
                            "en".to_string(),
                        )
                        .await;
                });
            }
        }
    };

    if let Err(e) = result {
        debug!(error = %e, "Connection ended with error");
    }

    channels.close();
    channels.wait().await;
}
