use crate::SftpArgs;
use anyhow::{Context, Result};
use owlfs_core::{LocalFs, MemoryFs, Vfs};
use owlfs_sftp::Server;
use std::sync::Arc;
use tracing::{info, warn};

/// `owlfs serve sftp`: run until Ctrl-C, then shut down gracefully
pub async fn sftp(args: SftpArgs) -> Result<()> {
    let config = crate::config::load_config(&args)?;
    let _log_guard = crate::logging::init(&config.logging)?;

    info!(
        event = "server_starting",
        version = env!("CARGO_PKG_VERSION"),
        "Starting owlfs SFTP server"
    );

    let vfs = open_vfs(&args)?;
    let server = Server::new(config, vfs).context("Failed to start SFTP server")?;

    info!(
        event = "server_configuration",
        listen_addr = %server.config().listen_addr,
        no_auth = server.config().no_auth,
        max_auth_attempts = server.config().max_auth_attempts,
        max_open_handles = server.config().max_open_handles,
        log_format = ?server.config().logging.format,
        log_file = ?server.config().logging.file,
        "SFTP server configuration"
    );

    let addr = server.serve().await?;
    info!(event = "server_running", addr = %addr, "Press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C, shutting down");
    }
    server.shutdown();
    server.wait().await;

    info!(event = "server_shutdown", "SFTP server shutdown complete");
    Ok(())
}

fn open_vfs(args: &SftpArgs) -> Result<Arc<dyn Vfs>> {
    if args.memory {
        let fs = match args.capacity {
            Some(capacity) => MemoryFs::with_capacity(capacity),
            None => MemoryFs::new(),
        };
        info!(event = "vfs_ready", backend = "memory", capacity = ?args.capacity, "Serving in-memory filesystem");
        return Ok(Arc::new(fs));
    }

    let root = args
        .root
        .as_deref()
        .context("A root directory or --memory is required")?;
    let fs = LocalFs::new(root)
        .with_context(|| format!("Cannot serve {}", root.display()))?;
    info!(event = "vfs_ready", backend = "local", root = %root.display(), "Serving local directory");
    Ok(Arc::new(fs))
}
