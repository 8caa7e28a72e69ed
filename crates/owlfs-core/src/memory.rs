//! In-memory VFS backend
//!
//! Used by `owlfs serve sftp --memory` and throughout the test suites.
//! Optional capacity makes `df` meaningful; the sequential-write policy models
//! storage that can only be written front to back.

use crate::error::{Result, VfsError};
use crate::path::VfsPath;
use crate::types::{
    DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS, DirEntry, Metadata, NodeKind, OpenOptions,
    SetAttrs, Usage,
};
use crate::vfs::{Vfs, VfsFile};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug)]
struct FileData {
    content: Vec<u8>,
    modified: SystemTime,
    permissions: u32,
    /// Cleared when the file is removed or replaced while still open
    linked: bool,
}

impl FileData {
    fn metadata(&self) -> Metadata {
        Metadata {
            kind: NodeKind::File,
            size: self.content.len() as u64,
            modified: self.modified,
            permissions: self.permissions,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File(Arc<Mutex<FileData>>),
    Directory { modified: SystemTime, permissions: u32 },
}

impl Node {
    fn new_dir() -> Self {
        Node::Directory {
            modified: SystemTime::now(),
            permissions: DEFAULT_DIR_PERMISSIONS,
        }
    }

    async fn metadata(&self) -> Metadata {
        match self {
            Node::File(data) => data.lock().await.metadata(),
            Node::Directory {
                modified,
                permissions,
            } => Metadata {
                kind: NodeKind::Directory,
                size: 0,
                modified: *modified,
                permissions: *permissions,
            },
        }
    }
}

/// Largest single file a store without a capacity accepts
pub const MAX_UNBOUNDED_FILE_SIZE: u64 = 1 << 32;

/// Byte accounting shared by the tree and every open file
#[derive(Debug)]
struct Space {
    capacity: Option<u64>,
    used: AtomicU64,
}

impl Space {
    /// Account for a file growing from `old` to `new` bytes
    fn resize(&self, old: u64, new: u64, path: &VfsPath) -> Result<()> {
        if new <= old {
            self.used.fetch_sub(old - new, Ordering::SeqCst);
            return Ok(());
        }

        let grow = new - old;
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let next = used.checked_add(grow)?;
                match self.capacity {
                    Some(cap) if next > cap => None,
                    _ => Some(next),
                }
            })
            .map(|_| ())
            .map_err(|_| VfsError::QuotaExceeded(path.to_string()))
    }

    /// Make room for `content` to grow to `new_len` without aborting on allocation failure
    fn reserve(&self, content: &mut Vec<u8>, new_len: u64, path: &VfsPath) -> Result<()> {
        let quota = || VfsError::QuotaExceeded(path.to_string());
        if new_len > self.capacity.unwrap_or(MAX_UNBOUNDED_FILE_SIZE) {
            return Err(quota());
        }
        let new_len = usize::try_from(new_len).map_err(|_| quota())?;
        let additional = new_len.saturating_sub(content.len());
        content.try_reserve_exact(additional).map_err(|_| quota())
    }
}

/// A VFS held entirely in memory
#[derive(Debug, Clone)]
pub struct MemoryFs {
    nodes: Arc<RwLock<BTreeMap<VfsPath, Node>>>,
    space: Arc<Space>,
    sequential_writes: bool,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self {
            nodes: Arc::new(RwLock::new(BTreeMap::new())),
            space: Arc::new(Space {
                capacity: None,
                used: AtomicU64::new(0),
            }),
            sequential_writes: false,
        }
    }

    /// Limit the total bytes stored; writes beyond it fail with `QuotaExceeded`
    pub fn with_capacity(capacity: u64) -> Self {
        let mut fs = Self::new();
        fs.space = Arc::new(Space {
            capacity: Some(capacity),
            used: AtomicU64::new(0),
        });
        fs
    }

    /// Reject writes that do not land exactly at the current end of file
    pub fn sequential_writes(mut self, enabled: bool) -> Self {
        self.sequential_writes = enabled;
        self
    }

    /// Bytes currently stored
    pub fn used(&self) -> u64 {
        self.space.used.load(Ordering::SeqCst)
    }

    /// Lookup that treats the root as an always-present directory
    fn lookup(nodes: &BTreeMap<VfsPath, Node>, path: &VfsPath) -> Option<Node> {
        if path.is_root() {
            return Some(Node::Directory {
                modified: SystemTime::UNIX_EPOCH,
                permissions: DEFAULT_DIR_PERMISSIONS,
            });
        }
        nodes.get(path).cloned()
    }

    fn require_parent_dir(nodes: &BTreeMap<VfsPath, Node>, path: &VfsPath) -> Result<()> {
        let parent = path.parent().unwrap_or_default();
        match Self::lookup(nodes, &parent) {
            Some(Node::Directory { .. }) => Ok(()),
            Some(Node::File(_)) => Err(VfsError::NotADirectory(parent.to_string())),
            None => Err(VfsError::NotFound(parent.to_string())),
        }
    }

    fn has_children(nodes: &BTreeMap<VfsPath, Node>, path: &VfsPath) -> bool {
        nodes
            .range(path.clone()..)
            .take_while(|(key, _)| key.starts_with(path))
            .any(|(key, _)| key != path)
    }

    async fn unlink(&self, data: &Arc<Mutex<FileData>>, path: &VfsPath) -> Result<()> {
        let mut data = data.lock().await;
        data.linked = false;
        self.space.resize(data.content.len() as u64, 0, path)
    }

    fn apply_file_attrs(
        space: &Space,
        data: &mut FileData,
        attrs: &SetAttrs,
        path: &VfsPath,
    ) -> Result<()> {
        if let Some(size) = attrs.size {
            space.reserve(&mut data.content, size, path)?;
            if data.linked {
                space.resize(data.content.len() as u64, size, path)?;
            }
            data.content.resize(size as usize, 0);
            data.modified = SystemTime::now();
        }
        if let Some(permissions) = attrs.permissions {
            data.permissions = permissions & 0o7777;
        }
        if let Some(modified) = attrs.modified {
            data.modified = modified;
        }
        Ok(())
    }
}

#[async_trait]
impl Vfs for MemoryFs {
    async fn stat(&self, path: &VfsPath) -> Result<Metadata> {
        let node = {
            let nodes = self.nodes.read().await;
            Self::lookup(&nodes, path)
        };
        match node {
            Some(node) => Ok(node.metadata().await),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    async fn open(&self, path: &VfsPath, options: OpenOptions) -> Result<Box<dyn VfsFile>> {
        let mut nodes = self.nodes.write().await;
        Self::require_parent_dir(&nodes, path)?;

        let data = match Self::lookup(&nodes, path) {
            Some(Node::Directory { .. }) => {
                return Err(VfsError::IsADirectory(path.to_string()));
            }
            Some(Node::File(_)) if options.create && options.exclusive => {
                return Err(VfsError::AlreadyExists(path.to_string()));
            }
            Some(Node::File(data)) => {
                if options.truncate && options.is_writable() {
                    let mut guard = data.lock().await;
                    self.space.resize(guard.content.len() as u64, 0, path)?;
                    guard.content.clear();
                    guard.modified = SystemTime::now();
                }
                data
            }
            None if options.create => {
                debug!(path = %path, "creating file");
                let data = Arc::new(Mutex::new(FileData {
                    content: Vec::new(),
                    modified: SystemTime::now(),
                    permissions: DEFAULT_FILE_PERMISSIONS,
                    linked: true,
                }));
                nodes.insert(path.clone(), Node::File(data.clone()));
                data
            }
            None => return Err(VfsError::NotFound(path.to_string())),
        };

        Ok(Box::new(MemoryFile {
            data,
            path: path.clone(),
            options,
            space: self.space.clone(),
            sequential_writes: self.sequential_writes,
        }))
    }

    async fn read_dir(&self, path: &VfsPath) -> Result<Vec<DirEntry>> {
        let children: Vec<(String, Node)> = {
            let nodes = self.nodes.read().await;
            match Self::lookup(&nodes, path) {
                Some(Node::Directory { .. }) => {}
                Some(Node::File(_)) => return Err(VfsError::NotADirectory(path.to_string())),
                None => return Err(VfsError::NotFound(path.to_string())),
            }
            let depth = path.segments().len() + 1;
            nodes
                .range(path.clone()..)
                .take_while(|(key, _)| key.starts_with(path))
                .filter(|(key, _)| key.segments().len() == depth)
                .filter_map(|(key, node)| key.name().map(|name| (name.to_string(), node.clone())))
                .collect()
        };

        let mut entries = Vec::with_capacity(children.len());
        for (name, node) in children {
            entries.push(DirEntry {
                name,
                metadata: node.metadata().await,
            });
        }
        Ok(entries)
    }

    async fn remove(&self, path: &VfsPath) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        match Self::lookup(&nodes, path) {
            Some(Node::File(data)) => {
                nodes.remove(path);
                self.unlink(&data, path).await
            }
            Some(Node::Directory { .. }) => Err(VfsError::IsADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    async fn rename(&self, from: &VfsPath, to: &VfsPath) -> Result<()> {
        if from.is_root() || to.is_root() {
            return Err(VfsError::PermissionDenied(from.to_string()));
        }
        if from == to {
            return Ok(());
        }

        let mut nodes = self.nodes.write().await;
        let source =
            Self::lookup(&nodes, from).ok_or_else(|| VfsError::NotFound(from.to_string()))?;
        Self::require_parent_dir(&nodes, to)?;
        if matches!(source, Node::Directory { .. }) && to.starts_with(from) {
            return Err(VfsError::InvalidArgument(format!(
                "cannot move {from} into itself"
            )));
        }

        match (&source, Self::lookup(&nodes, to)) {
            (_, Some(Node::Directory { .. })) => {
                return Err(VfsError::AlreadyExists(to.to_string()));
            }
            (Node::Directory { .. }, Some(Node::File(_))) => {
                return Err(VfsError::NotADirectory(to.to_string()));
            }
            (Node::File(_), Some(Node::File(replaced))) => {
                nodes.remove(to);
                self.unlink(&replaced, to).await?;
            }
            (_, None) => {}
        }

        if matches!(source, Node::Directory { .. }) {
            let moved: Vec<VfsPath> = nodes
                .range(from.clone()..)
                .take_while(|(key, _)| key.starts_with(from))
                .map(|(key, _)| key.clone())
                .collect();
            for old in moved {
                if let Some(node) = nodes.remove(&old) {
                    let mut new = to.clone();
                    for segment in &old.segments()[from.segments().len()..] {
                        new = new
                            .join(segment)
                            .map_err(|e| VfsError::InvalidArgument(e.to_string()))?;
                    }
                    nodes.insert(new, node);
                }
            }
        } else {
            nodes.remove(from);
            nodes.insert(to.clone(), source);
        }

        debug!(from = %from, to = %to, "renamed");
        Ok(())
    }

    async fn mkdir(&self, path: &VfsPath) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        if Self::lookup(&nodes, path).is_some() {
            return Err(VfsError::AlreadyExists(path.to_string()));
        }
        Self::require_parent_dir(&nodes, path)?;
        nodes.insert(path.clone(), Node::new_dir());
        Ok(())
    }

    async fn rmdir(&self, path: &VfsPath) -> Result<()> {
        if path.is_root() {
            return Err(VfsError::PermissionDenied(path.to_string()));
        }
        let mut nodes = self.nodes.write().await;
        match Self::lookup(&nodes, path) {
            Some(Node::Directory { .. }) => {
                if Self::has_children(&nodes, path) {
                    return Err(VfsError::DirectoryNotEmpty(path.to_string()));
                }
                nodes.remove(path);
                Ok(())
            }
            Some(Node::File(_)) => Err(VfsError::NotADirectory(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    async fn set_attrs(&self, path: &VfsPath, attrs: &SetAttrs) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        match nodes.get_mut(path) {
            Some(Node::File(data)) => {
                let mut data = data.lock().await;
                Self::apply_file_attrs(&self.space, &mut data, attrs, path)
            }
            Some(Node::Directory {
                modified,
                permissions,
            }) => {
                if attrs.size.is_some() {
                    return Err(VfsError::IsADirectory(path.to_string()));
                }
                if let Some(perm) = attrs.permissions {
                    *permissions = perm & 0o7777;
                }
                if let Some(time) = attrs.modified {
                    *modified = time;
                }
                Ok(())
            }
            None if path.is_root() => Err(VfsError::PermissionDenied(path.to_string())),
            None => Err(VfsError::NotFound(path.to_string())),
        }
    }

    async fn usage(&self) -> Result<Usage> {
        let Some(total) = self.space.capacity else {
            return Err(VfsError::Unsupported("usage of an unbounded memory fs".into()));
        };
        let used = self.used();
        Ok(Usage {
            total: Some(total),
            used: Some(used),
            free: Some(total.saturating_sub(used)),
        })
    }
}

struct MemoryFile {
    data: Arc<Mutex<FileData>>,
    path: VfsPath,
    options: OpenOptions,
    space: Arc<Space>,
    sequential_writes: bool,
}

#[async_trait]
impl VfsFile for MemoryFile {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        if !self.options.read {
            return Err(VfsError::PermissionDenied(format!(
                "{} not opened for reading",
                self.path
            )));
        }
        let data = self.data.lock().await;
        let size = data.content.len() as u64;
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = size.min(offset + len as u64);
        Ok(Bytes::copy_from_slice(
            &data.content[offset as usize..end as usize],
        ))
    }

    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.options.is_writable() {
            return Err(VfsError::PermissionDenied(format!(
                "{} not opened for writing",
                self.path
            )));
        }

        let mut data = self.data.lock().await;
        let size = data.content.len() as u64;
        let offset = if self.options.append { size } else { offset };
        if self.sequential_writes && offset != size {
            return Err(VfsError::Unsupported(format!(
                "out of order write to {} at offset {offset}, expected {size}",
                self.path
            )));
        }

        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or_else(|| VfsError::InvalidArgument(format!("offset {offset} too large")))?;
        if end > size {
            self.space.reserve(&mut data.content, end, &self.path)?;
            if data.linked {
                self.space.resize(size, end, &self.path)?;
            }
            data.content.resize(end as usize, 0);
        }
        data.content[offset as usize..end as usize].copy_from_slice(buf);
        data.modified = SystemTime::now();
        Ok(())
    }

    async fn stat(&self) -> Result<Metadata> {
        Ok(self.data.lock().await.metadata())
    }

    async fn set_attrs(&self, attrs: &SetAttrs) -> Result<()> {
        let mut data = self.data.lock().await;
        MemoryFs::apply_file_attrs(&self.space, &mut data, attrs, &self.path)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
