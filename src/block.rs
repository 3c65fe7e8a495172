//! Memory block snapshots and change detection.
//!
//! A [`MemoryBlock`] mirrors one controller data block: its number, its
//! length, the last bytes read from the controller and a dirty flag that
//! says whether those bytes still have to be broadcast. The snapshot and the
//! flag live behind a single lock, so a reader always sees a flag that
//! describes the bytes next to it.
//!
//! # Example
//!
//! ```
//! use plc_gateway::MemoryBlock;
//!
//! let block = MemoryBlock::new(10, 2);
//! // A fresh block is dirty so the first cycle sends it.
//! assert!(block.take_if_dirty().is_some());
//!
//! block.update_bytes(vec![0, 0]);
//! assert!(!block.is_dirty());
//!
//! block.update_bytes(vec![0, 1]);
//! assert!(block.is_dirty());
//! ```

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// How a block decides it must be re-broadcast after a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeDetection {
    /// Dirty only when the new bytes differ from the stored snapshot.
    #[default]
    Differential,
    /// Dirty after every read, whether or not anything changed.
    Always,
}

#[derive(Debug)]
struct BlockState {
    bytes: Vec<u8>,
    previous: Vec<u8>,
    dirty: bool,
}

/// Snapshot and broadcast state of one controller data block.
#[derive(Debug)]
pub struct MemoryBlock {
    num: u16,
    len: usize,
    detection: ChangeDetection,
    state: Mutex<BlockState>,
}

impl MemoryBlock {
    /// Creates a zero-filled block that starts dirty.
    pub fn new(num: u16, len: usize) -> Self {
        Self::with_detection(num, len, ChangeDetection::Differential)
    }

    /// Creates a block with an explicit change detection mode.
    pub fn with_detection(num: u16, len: usize, detection: ChangeDetection) -> Self {
        Self {
            num,
            len,
            detection,
            state: Mutex::new(BlockState {
                bytes: vec![0; len],
                previous: vec![0; len],
                dirty: true,
            }),
        }
    }

    /// Returns the block number on the controller.
    pub fn num(&self) -> u16 {
        self.num
    }

    /// Returns the configured block length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns whether the block has zero length.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the change detection mode.
    pub fn detection(&self) -> ChangeDetection {
        self.detection
    }

    fn lock(&self) -> MutexGuard<'_, BlockState> {
        // Every critical section leaves the state consistent, so a poisoned
        // lock is still safe to use.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a freshly read snapshot.
    ///
    /// Marks the block dirty when `bytes` differs from the stored snapshot
    /// (or on every call with [`ChangeDetection::Always`]). The snapshot is
    /// replaced in every case. Returns whether this call changed the bytes.
    pub fn update_bytes(&self, bytes: Vec<u8>) -> bool {
        let mut state = self.lock();
        let changed = state.bytes != bytes;
        if changed || self.detection == ChangeDetection::Always {
            state.dirty = true;
        }
        let old = std::mem::replace(&mut state.bytes, bytes);
        state.previous = old;
        changed
    }

    /// Forces a full snapshot to go out on the next cycle for a new client.
    pub fn on_client_connect(&self) {
        self.set_dirty();
    }

    /// Marks the block dirty.
    pub fn set_dirty(&self) {
        self.lock().dirty = true;
    }

    /// Clears the dirty flag.
    pub fn reset_dirty(&self) {
        self.lock().dirty = false;
    }

    /// Returns the dirty flag.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Returns a copy of the current snapshot.
    pub fn bytes(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Returns a copy of the snapshot replaced by the last update.
    pub fn previous_bytes(&self) -> Vec<u8> {
        self.lock().previous.clone()
    }

    /// Runs `f` against the current snapshot without copying it.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.lock().bytes)
    }

    /// Consumes the dirty flag.
    ///
    /// If the block is dirty, clears the flag and returns the snapshot it
    /// described, both under the same lock, so a change stored concurrently
    /// is either included here or leaves the flag set for the next cycle.
    pub fn take_if_dirty(&self) -> Option<Vec<u8>> {
        let mut state = self.lock();
        if state.dirty {
            state.dirty = false;
            Some(state.bytes.clone())
        } else {
            None
        }
    }
}
