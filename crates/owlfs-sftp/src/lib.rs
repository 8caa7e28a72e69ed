//! # Owlfs SFTP
//!
//! Serves an [`owlfs_core::Vfs`] over SFTP.
//!
//! The protocol stack follows:
//! - RFC 4251-4254: SSH architecture, authentication, transport and
//!   connection protocols (via `russh`)
//! - draft-ietf-secsh-filexfer-02: SSH File Transfer Protocol version 3
//!
//! ## Layout
//!
//! - [`Server`]: listener and connection lifecycle
//! - [`Authenticator`]: no-auth, single user/password, or authorized keys
//! - [`SftpSession`]: the SFTP request translator, usable over any byte stream
//! - [`ShellEmulator`]: `md5sum`/`sha1sum`/`sha256sum`/`df` over exec channels
//!
//! ## Example
//!
//! ```no_run
//! use owlfs_core::MemoryFs;
//! use owlfs_sftp::{Config, Server};
//! use std::sync::Arc;
//!
//! # async fn run() -> owlfs_sftp::Result<()> {
//! let config = Config {
//!     no_auth: true,
//!     ..Default::default()
//! };
//! let server = Server::new(config, Arc::new(MemoryFs::new()))?;
//! server.serve().await?;
//! server.wait().await;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
mod handler;
pub mod handles;
pub mod host_key;
pub mod protocol;
pub mod server;
pub mod session;
pub mod shell;

pub use audit::{AuditEvent, ConnectionInfo};
pub use auth::{AuthDecision, AuthMethod, Authenticator, AuthorizedKeys, Credential};
pub use config::{Config, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use host_key::get_host_key;
pub use server::Server;
pub use session::{SessionLimits, SftpSession};
pub use shell::{ShellEmulator, ShellOutput};
