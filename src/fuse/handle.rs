//! File-handle table for the export.
//!
//! Each FUSE open registers its own descriptor here and gets a fresh `fh`
//! back; read/write/fsync resolve the descriptor by `fh` and release drops
//! it. This replaces the one-global-descriptor scheme where a second open
//! would clobber the first.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::image::ImageFile;

/// Live open handles, keyed by the `fh` handed to the kernel.
///
/// `fh` values start at 1 and are never reused within one mount. The lock
/// guards map access only; I/O runs on a clone taken out of the lock.
pub struct HandleTable {
    handles: Mutex<HashMap<u64, ImageFile>>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    /// Register an open descriptor and return its fh.
    pub fn insert(&self, file: ImageFile) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().unwrap().insert(fh, file);
        fh
    }

    /// Clone the handle out of the lock so I/O runs unlocked.
    pub fn get(&self, fh: u64) -> Option<ImageFile> {
        self.handles.lock().unwrap().get(&fh).cloned()
    }

    /// Drop a handle, closing its descriptor once no request still holds a
    /// clone. Returns `None` when the fh was unknown.
    pub fn remove(&self, fh: u64) -> Option<ImageFile> {
        self.handles.lock().unwrap().remove(&fh)
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
