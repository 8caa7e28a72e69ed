//! Per-session handle table
//!
//! Handles are 4-byte big-endian counters, unique among the live handles of
//! one session. Every operation on a handle takes a [`Turn`] when it is
//! dispatched; turns complete in dispatch order, which keeps reads and writes
//! against one handle in submission order while unrelated requests overlap.

use crate::{Error, Result};
use owlfs_core::{DirEntry, VfsFile, VfsPath};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};

/// Object bound to a handle
pub enum OpenObject {
    File {
        file: Box<dyn VfsFile>,
        path: VfsPath,
    },
    Dir {
        path: VfsPath,
        /// Entries not yet returned by readdir
        pending: VecDeque<DirEntry>,
    },
}

impl OpenObject {
    pub fn path(&self) -> &VfsPath {
        match self {
            OpenObject::File { path, .. } | OpenObject::Dir { path, .. } => path,
        }
    }
}

/// Shared slot; `None` once the handle has been closed
pub type SharedObject = Arc<Mutex<Option<OpenObject>>>;

/// Position in a handle's operation queue
pub struct Turn {
    prev: Option<oneshot::Receiver<()>>,
    // Dropping the sender releases the next turn
    _done: oneshot::Sender<()>,
}

impl Turn {
    /// Wait until every earlier operation on the handle has finished
    pub async fn wait(&mut self) {
        if let Some(prev) = self.prev.take() {
            // Err means the previous turn was dropped, which also releases us
            let _ = prev.await;
        }
    }
}

#[derive(Default)]
struct Sequencer {
    tail: Option<oneshot::Receiver<()>>,
}

impl Sequencer {
    fn next(&mut self) -> Turn {
        let (done, tail) = oneshot::channel();
        Turn {
            prev: self.tail.replace(tail),
            _done: done,
        }
    }
}

struct Slot {
    object: SharedObject,
    sequencer: Sequencer,
}

/// Mapping from wire handles to open VFS objects
pub struct HandleTable {
    next_id: u32,
    slots: HashMap<u32, Slot>,
    max_open: usize,
}

impl HandleTable {
    pub fn new(max_open: usize) -> Self {
        Self {
            next_id: 1,
            slots: HashMap::new(),
            max_open,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Bind `object` to a fresh handle
    ///
    /// On failure the object is handed back so the caller can close it.
    pub fn insert(
        &mut self,
        object: OpenObject,
    ) -> std::result::Result<Vec<u8>, (Error, OpenObject)> {
        if self.slots.len() >= self.max_open {
            return Err((
                Error::resource_exhaustion(format!(
                    "too many open handles (limit {})",
                    self.max_open
                )),
                object,
            ));
        }

        let mut id = self.next_id;
        while self.slots.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);

        self.slots.insert(
            id,
            Slot {
                object: Arc::new(Mutex::new(Some(object))),
                sequencer: Sequencer::default(),
            },
        );
        Ok(encode_handle(id))
    }

    /// Look up a handle and queue an operation on it
    pub fn acquire(&mut self, handle: &[u8]) -> Result<(SharedObject, Turn)> {
        let slot = decode_handle(handle)
            .and_then(|id| self.slots.get_mut(&id))
            .ok_or_else(|| Error::invalid_handle("Handle does not exist or is closed"))?;
        Ok((slot.object.clone(), slot.sequencer.next()))
    }

    /// Unbind a handle, queueing its close behind earlier operations
    pub fn remove(&mut self, handle: &[u8]) -> Result<(SharedObject, Turn)> {
        let mut slot = decode_handle(handle)
            .and_then(|id| self.slots.remove(&id))
            .ok_or_else(|| Error::invalid_handle("Handle does not exist or is closed"))?;
        let turn = slot.sequencer.next();
        Ok((slot.object, turn))
    }

    /// Unbind every handle (session teardown)
    pub fn drain(&mut self) -> Vec<(SharedObject, Turn)> {
        self.slots
            .drain()
            .map(|(_, mut slot)| {
                let turn = slot.sequencer.next();
                (slot.object, turn)
            })
            .collect()
    }
}

fn encode_handle(id: u32) -> Vec<u8> {
    id.to_be_bytes().to_vec()
}

fn decode_handle(handle: &[u8]) -> Option<u32> {
    <[u8; 4]>::try_from(handle).ok().map(u32::from_be_bytes)
}
