use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

/// Default permission bits for regular files
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

/// Default permission bits for directories
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;

/// Kind of node stored in a VFS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Directory,
}

/// Node metadata as reported by a VFS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub kind: NodeKind,
    pub size: u64,
    pub modified: SystemTime,
    /// Permission bits only (no file type bits)
    pub permissions: u32,
}

impl Metadata {
    pub fn file(size: u64, modified: SystemTime) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            modified,
            permissions: DEFAULT_FILE_PERMISSIONS,
        }
    }

    pub fn directory(modified: SystemTime) -> Self {
        Self {
            kind: NodeKind::Directory,
            size: 0,
            modified,
            permissions: DEFAULT_DIR_PERMISSIONS,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    /// Modification time as seconds since the Unix epoch (0 if earlier)
    pub fn modified_secs(&self) -> u64 {
        self.modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

/// How a file should be opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Default::default()
        }
    }

    /// Write, create and truncate (the usual upload mode)
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    pub fn is_writable(&self) -> bool {
        self.write || self.append
    }
}

/// Attribute changes requested by a client; `None` leaves the field alone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
    pub size: Option<u64>,
    pub permissions: Option<u32>,
    pub modified: Option<SystemTime>,
}

impl SetAttrs {
    pub fn is_empty(&self) -> bool {
        self.size.is_none() && self.permissions.is_none() && self.modified.is_none()
    }
}

/// Aggregate space accounting of the storage behind a VFS, in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub free: Option<u64>,
}

/// Content digest algorithms a VFS can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Md5,
    Sha1,
    Sha256,
}

impl HashKind {
    pub const ALL: [HashKind; 3] = [HashKind::Md5, HashKind::Sha1, HashKind::Sha256];

    pub fn name(&self) -> &'static str {
        match self {
            HashKind::Md5 => "md5",
            HashKind::Sha1 => "sha1",
            HashKind::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "md5" => Ok(HashKind::Md5),
            "sha1" => Ok(HashKind::Sha1),
            "sha256" => Ok(HashKind::Sha256),
            other => Err(format!("unknown hash kind: {other}")),
        }
    }
}
