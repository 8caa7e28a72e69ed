//! VFS error taxonomy
//!
//! Every backend reports failures through [`VfsError`].

use crate::VfsPath;
use std::io;
use thiserror::Error;

/// Result type alias for VFS operations
pub type Result<T> = std::result::Result<T, VfsError>;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Classify an I/O error raised while operating on `path`.
    pub fn from_io(err: io::Error, path: &VfsPath) -> Self {
        let path = path.to_string();
        match err.kind() {
            io::ErrorKind::NotFound => VfsError::NotFound(path),
            io::ErrorKind::PermissionDenied => VfsError::PermissionDenied(path),
            io::ErrorKind::AlreadyExists => VfsError::AlreadyExists(path),
            io::ErrorKind::NotADirectory => VfsError::NotADirectory(path),
            io::ErrorKind::IsADirectory => VfsError::IsADirectory(path),
            io::ErrorKind::DirectoryNotEmpty => VfsError::DirectoryNotEmpty(path),
            io::ErrorKind::Unsupported => VfsError::Unsupported(path),
            io::ErrorKind::StorageFull => VfsError::QuotaExceeded(path),
            _ => VfsError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, VfsError::Unsupported(_))
    }
}
