//! Normalised, root-relative VFS paths
//!
//! Every path that reaches a [`crate::Vfs`] has been through [`VfsPath::parse`],
//! so backends never see `.`/`..` segments and can never be asked for
//! something above their root.

use std::fmt;
use thiserror::Error;

/// Rejected path input
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("Path escapes the VFS root: {0}")]
    Escape(String),

    #[error("Path contains an invalid character: {0:?}")]
    InvalidCharacter(String),
}

/// An absolute path inside a VFS, stored as its normalised segments
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VfsPath {
    segments: Vec<String>,
}

impl VfsPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a client supplied path
    ///
    /// Relative paths are taken relative to the root. Empty and `.` segments
    /// are dropped, `..` removes the previous segment. A `..` that would climb
    /// above the root is an error rather than being clamped, so traversal
    /// attempts are visible to the caller.
    pub fn parse(raw: &str) -> Result<Self, PathError> {
        if raw.contains('\0') {
            return Err(PathError::InvalidCharacter(raw.replace('\0', "\\0")));
        }

        let mut segments: Vec<String> = Vec::new();
        for part in raw.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(PathError::Escape(raw.to_string()));
                    }
                }
                name => segments.push(name.to_string()),
            }
        }

        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Final segment, `None` for the root
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Parent directory, `None` for the root
    pub fn parent(&self) -> Option<VfsPath> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append a single child name
    pub fn join(&self, name: &str) -> Result<VfsPath, PathError> {
        let mut raw = self.to_string();
        raw.push('/');
        raw.push_str(name);
        Self::parse(&raw)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// True if `self` is `other` or lies underneath it
    pub fn starts_with(&self, other: &VfsPath) -> bool {
        self.segments.starts_with(&other.segments)
    }
}

impl fmt::Display for VfsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}
