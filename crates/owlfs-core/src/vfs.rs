//! The VFS contract consumed by the servers
//!
//! Implementations must be safe for concurrent use: one instance is shared by
//! every connection and channel of a server.

use crate::error::{Result, VfsError};
use crate::hash::Hasher;
use crate::path::VfsPath;
use crate::types::{DirEntry, HashKind, Metadata, OpenOptions, SetAttrs, Usage};
use async_trait::async_trait;
use bytes::Bytes;

/// Chunk size used when streaming file content through a hasher
pub const CHECKSUM_CHUNK_SIZE: u32 = 64 * 1024;

/// A directory tree backed by some storage provider
#[async_trait]
pub trait Vfs: Send + Sync {
    async fn stat(&self, path: &VfsPath) -> Result<Metadata>;

    async fn open(&self, path: &VfsPath, options: OpenOptions) -> Result<Box<dyn VfsFile>>;

    /// Full listing of a directory, excluding `.` and `..`
    async fn read_dir(&self, path: &VfsPath) -> Result<Vec<DirEntry>>;

    /// Remove a file
    async fn remove(&self, path: &VfsPath) -> Result<()>;

    async fn rename(&self, from: &VfsPath, to: &VfsPath) -> Result<()>;

    async fn mkdir(&self, path: &VfsPath) -> Result<()>;

    /// Remove an empty directory
    async fn rmdir(&self, path: &VfsPath) -> Result<()>;

    async fn set_attrs(&self, path: &VfsPath, attrs: &SetAttrs) -> Result<()>;

    async fn symlink(&self, target: &str, link: &VfsPath) -> Result<()> {
        let _ = target;
        Err(VfsError::Unsupported(format!("symlink {link}")))
    }

    async fn read_link(&self, path: &VfsPath) -> Result<String> {
        Err(VfsError::Unsupported(format!("readlink {path}")))
    }

    /// Aggregate space accounting, if the storage can report it
    async fn usage(&self) -> Result<Usage> {
        Err(VfsError::Unsupported("usage".to_string()))
    }

    /// Content digest of a file
    ///
    /// The default streams the file through [`Hasher`]; backends that store
    /// digests natively should override it.
    async fn checksum(&self, path: &VfsPath, kind: HashKind) -> Result<String> {
        let meta = self.stat(path).await?;
        if meta.is_dir() {
            return Err(VfsError::IsADirectory(path.to_string()));
        }

        let file = self.open(path, OpenOptions::read_only()).await?;
        let mut hasher = Hasher::new(kind);
        let mut offset = 0u64;
        let result = loop {
            match file.read_at(offset, CHECKSUM_CHUNK_SIZE).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => {
                    hasher.update(&chunk);
                    offset += chunk.len() as u64;
                }
                Err(e) => break Err(e),
            }
        };
        file.close().await?;
        result?;

        Ok(hasher.finish())
    }
}

/// An open file obtained from [`Vfs::open`]
#[async_trait]
pub trait VfsFile: Send + Sync {
    /// Read up to `len` bytes at `offset`; an empty buffer means end of file
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes>;

    /// Write all of `data` at `offset`
    ///
    /// Files opened in append mode ignore `offset` and write at the end.
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    async fn stat(&self) -> Result<Metadata>;

    async fn set_attrs(&self, attrs: &SetAttrs) -> Result<()>;

    /// Flush and release the file
    async fn close(self: Box<Self>) -> Result<()>;
}
