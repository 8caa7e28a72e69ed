//! Error types for the SFTP server
//!
//! Startup errors (`Config`, `NoAuthPolicy`, `KeyLoad`, `KeyGen`) abort the
//! server. Everything else is scoped to one request or one connection and is
//! answered with an SFTP status or a closed channel.

use crate::protocol::StatusCode;
use owlfs_core::{PathError, VfsError};
use thiserror::Error;

/// Result type alias for SFTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// SFTP error types
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SFTP protocol error
    ///
    /// Malformed or unexpected packets. Answered with `BadMessage`.
    #[error("SFTP protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// None of no-auth, user/password or authorized keys is configured
    #[error("No authentication method configured: set a user and password, provide authorized keys, or disable authentication explicitly")]
    NoAuthPolicy,

    /// Host key exists but could not be read or parsed
    #[error("Failed to load host key {path}: {reason}")]
    KeyLoad { path: String, reason: String },

    /// Host key could not be generated or persisted
    #[error("Failed to generate host key: {0}")]
    KeyGen(String),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Path rejected before reaching the VFS
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] PathError),

    /// File handle error
    #[error("Invalid file handle: {0}")]
    InvalidHandle(String),

    /// Failure reported by the VFS
    #[error(transparent)]
    Vfs(#[from] VfsError),

    /// Resource exhaustion
    #[error("Resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// Operation not supported
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),
}

impl Error {
    /// Check if error is fatal to server startup
    pub fn is_startup_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::NoAuthPolicy | Error::KeyLoad { .. } | Error::KeyGen(_)
        )
    }

    /// Check if error is security-related
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            Error::Authentication(_)
                | Error::InvalidPath(_)
                | Error::Vfs(VfsError::PermissionDenied(_))
        )
    }

    /// Get the SFTP status code answering this error
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Error::Vfs(vfs) => match vfs {
                VfsError::NotFound(_) => StatusCode::NoSuchFile,
                VfsError::PermissionDenied(_) => StatusCode::PermissionDenied,
                VfsError::Unsupported(_) => StatusCode::OpUnsupported,
                _ => StatusCode::Failure,
            },
            // Traversal above the root is refused, not reported as missing
            Error::InvalidPath(_) => StatusCode::PermissionDenied,
            Error::InvalidHandle(_) => StatusCode::InvalidHandle,
            Error::Protocol(_) => StatusCode::BadMessage,
            Error::NotSupported(_) => StatusCode::OpUnsupported,
            Error::Connection(_) => StatusCode::ConnectionLost,
            _ => StatusCode::Failure,
        }
    }

    /// Get sanitized error message for client
    pub fn sanitized_message(&self) -> String {
        match self {
            Error::Authentication(_) => "Authentication failed".to_string(),
            Error::InvalidPath(_) | Error::Vfs(VfsError::PermissionDenied(_)) => {
                "Permission denied".to_string()
            }
            Error::Config(_) | Error::NoAuthPolicy | Error::KeyLoad { .. } | Error::KeyGen(_) => {
                "Server configuration error".to_string()
            }
            Error::Io(_) | Error::Vfs(VfsError::Io(_)) => "I/O error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl From<russh::Error> for Error {
    fn from(err: russh::Error) -> Self {
        Error::Ssh(err.to_string())
    }
}

// Additional error constructors and helpers
impl Error {
    /// Create invalid handle error
    pub fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    /// Create resource exhaustion error
    pub fn resource_exhaustion(context: impl Into<String>) -> Self {
        Error::ResourceExhaustion(context.into())
    }
}
