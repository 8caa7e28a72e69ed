//! VFS backend over a directory on local disk

use crate::error::{Result, VfsError};
use crate::path::VfsPath;
use crate::types::{DirEntry, Metadata, NodeKind, OpenOptions, SetAttrs};
use crate::vfs::{Vfs, VfsFile};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Serves the contents of one local directory
///
/// Symlinks inside the root are followed only while they stay inside it;
/// links leading elsewhere are refused and left out of listings.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Create a backend rooted at `root`, which must be an existing directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let root = std::fs::canonicalize(&root)
            .map_err(|e| VfsError::from_io(e, &VfsPath::root()))?;
        if !root.is_dir() {
            return Err(VfsError::NotADirectory(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &VfsPath) -> PathBuf {
        let mut resolved = self.root.clone();
        for segment in path.segments() {
            resolved.push(segment);
        }
        resolved
    }

    /// Resolve `path` and refuse it if symlinks carry it outside the root
    async fn contained(&self, path: &VfsPath) -> Result<PathBuf> {
        let target = self.resolve(path);
        let real = match fs::canonicalize(&target).await {
            Ok(real) => real,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // A dangling link would be created through, wherever it points
                if fs::symlink_metadata(&target).await.is_ok() {
                    return Err(self.escape(path));
                }
                let parent = match target.parent() {
                    Some(parent) => fs::canonicalize(parent).await,
                    None => return Ok(target),
                };
                match parent {
                    Ok(parent) => parent,
                    // The operation itself reports the missing parent
                    Err(_) => return Ok(target),
                }
            }
            Err(e) => return Err(VfsError::from_io(e, path)),
        };

        if real.starts_with(&self.root) {
            Ok(target)
        } else {
            Err(self.escape(path))
        }
    }

    fn escape(&self, path: &VfsPath) -> VfsError {
        warn!(path = %path, root = %self.root.display(), "symlink leads outside the served root");
        VfsError::PermissionDenied(path.to_string())
    }
}

fn convert_metadata(meta: &std::fs::Metadata) -> Metadata {
    let kind = if meta.is_dir() {
        NodeKind::Directory
    } else {
        NodeKind::File
    };

    #[cfg(unix)]
    let permissions = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    };
    #[cfg(not(unix))]
    let permissions = match (kind, meta.permissions().readonly()) {
        (NodeKind::Directory, _) => 0o755,
        (NodeKind::File, true) => 0o444,
        (NodeKind::File, false) => 0o644,
    };

    Metadata {
        kind,
        size: if meta.is_dir() { 0 } else { meta.len() },
        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        permissions,
    }
}

async fn apply_attrs(target: &Path, attrs: &SetAttrs, vpath: &VfsPath) -> Result<()> {
    #[cfg(unix)]
    if let Some(mode) = attrs.permissions {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode & 0o7777);
        fs::set_permissions(target, perms)
            .await
            .map_err(|e| VfsError::from_io(e, vpath))?;
    }

    if attrs.size.is_some() || attrs.modified.is_some() {
        let target = target.to_path_buf();
        let size = attrs.size;
        let modified = attrs.modified;
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            // futimens only needs a read handle, which also works for directories
            let file = std::fs::OpenOptions::new()
                .read(size.is_none())
                .write(size.is_some())
                .open(&target)?;
            if let Some(size) = size {
                file.set_len(size)?;
            }
            if let Some(modified) = modified {
                file.set_modified(modified)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| VfsError::Io(std::io::Error::other(e)))?
        .map_err(|e| VfsError::from_io(e, vpath))?;
    }

    Ok(())
}

#[async_trait]
impl Vfs for LocalFs {
    async fn stat(&self, path: &VfsPath) -> Result<Metadata> {
        let meta = fs::metadata(self.contained(path).await?)
            .await
            .map_err(|e| VfsError::from_io(e, path))?;
        Ok(convert_metadata(&meta))
    }

    async fn open(&self, path: &VfsPath, options: OpenOptions) -> Result<Box<dyn VfsFile>> {
        let target = self.contained(path).await?;
        if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            return Err(VfsError::IsADirectory(path.to_string()));
        }

        let mut open = fs::OpenOptions::new();
        open.read(options.read);
        open.write(options.write);
        if options.append {
            open.append(true);
        }
        if options.create && options.exclusive {
            open.create_new(true);
        } else if options.create {
            open.create(true);
        }
        if options.truncate && options.is_writable() {
            open.truncate(true);
        }

        let file = open
            .open(&target)
            .await
            .map_err(|e| VfsError::from_io(e, path))?;
        debug!(path = %path, "opened local file");

        Ok(Box::new(LocalFile {
            file: Mutex::new(file),
            path: path.clone(),
            target,
            append: options.append,
        }))
    }

    async fn read_dir(&self, path: &VfsPath) -> Result<Vec<DirEntry>> {
        let mut dir = fs::read_dir(self.contained(path).await?)
            .await
            .map_err(|e| VfsError::from_io(e, path))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(|e| VfsError::from_io(e, path))? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = %path, "skipping entry with non UTF-8 name");
                continue;
            };
            // Follow symlinks so links show up as what they point at
            let inside = fs::canonicalize(entry.path())
                .await
                .is_ok_and(|real| real.starts_with(&self.root));
            if !inside {
                debug!(path = %path, name = %name, "skipping entry outside the root");
                continue;
            }
            match fs::metadata(entry.path()).await {
                Ok(meta) => entries.push(DirEntry {
                    name,
                    metadata: convert_metadata(&meta),
                }),
                Err(e) => debug!(path = %path, name = %name, error = %e, "skipping unreadable entry"),
            }
        }
        Ok(entries)
    }

    async fn remove(&self, path: &VfsPath) -> Result<()> {
        let target = self.contained(path).await?;
        if fs::metadata(&target).await.is_ok_and(|m| m.is_dir()) {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        fs::remove_file(target)
            .await
            .map_err(|e| VfsError::from_io(e, path))
    }

    async fn rename(&self, from: &VfsPath, to: &VfsPath) -> Result<()> {
        if from.is_root() || to.is_root() {
            return Err(VfsError::PermissionDenied(from.to_string()));
        }
        fs::rename(self.contained(from).await?, self.contained(to).await?)
            .await
            .map_err(|e| VfsError::from_io(e, from))
    }

    async fn mkdir(&self, path: &VfsPath) -> Result<()> {
        fs::create_dir(self.contained(path).await?)
            .await
            .map_err(|e| VfsError::from_io(e, path))
    }

    async fn rmdir(&self, path: &VfsPath) -> Result<()> {
        if path.is_root() {
            return Err(VfsError::PermissionDenied(path.to_string()));
        }
        fs::remove_dir(self.contained(path).await?)
            .await
            .map_err(|e| VfsError::from_io(e, path))
    }

    async fn set_attrs(&self, path: &VfsPath, attrs: &SetAttrs) -> Result<()> {
        let target = self.contained(path).await?;
        let meta = fs::metadata(&target)
            .await
            .map_err(|e| VfsError::from_io(e, path))?;
        if meta.is_dir() && attrs.size.is_some() {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        apply_attrs(&target, attrs, path).await
    }
}

struct LocalFile {
    file: Mutex<fs::File>,
    path: VfsPath,
    target: PathBuf,
    append: bool,
}

#[async_trait]
impl VfsFile for LocalFile {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| VfsError::from_io(e, &self.path))?;

        let mut buffer = BytesMut::zeroed(len as usize);
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file
                .read(&mut buffer[filled..])
                .await
                .map_err(|e| VfsError::from_io(e, &self.path))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer.freeze())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        if !self.append {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| VfsError::from_io(e, &self.path))?;
        }
        file.write_all(data)
            .await
            .map_err(|e| VfsError::from_io(e, &self.path))
    }

    async fn stat(&self) -> Result<Metadata> {
        let file = self.file.lock().await;
        let meta = file
            .metadata()
            .await
            .map_err(|e| VfsError::from_io(e, &self.path))?;
        Ok(convert_metadata(&meta))
    }

    async fn set_attrs(&self, attrs: &SetAttrs) -> Result<()> {
        let mut file = self.file.lock().await;
        file.flush()
            .await
            .map_err(|e| VfsError::from_io(e, &self.path))?;
        apply_attrs(&self.target, attrs, &self.path).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let LocalFile { file, path, .. } = *self;
        let mut file = file.into_inner();
        file.flush()
            .await
            .map_err(|e| VfsError::from_io(e, &path))?;
        file.sync_all()
            .await
            .map_err(|e| VfsError::from_io(e, &path))
    }
}
