//! Owlfs Core
//!
//! The virtual filesystem contract shared by the owlfs servers, plus the
//! in-memory and local-disk backends.

pub mod error;
pub mod hash;
pub mod local;
pub mod memory;
pub mod path;
pub mod types;
pub mod vfs;

pub use error::{Result, VfsError};
pub use hash::{Hasher, digest};
pub use local::LocalFs;
pub use memory::MemoryFs;
pub use path::{PathError, VfsPath};
pub use types::*;
pub use vfs::{Vfs, VfsFile};
