//! Bookkeeping of live staging buffers.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::StagingBuffer;

/// Ordered collection of the staging buffers the drainer scans.
///
/// The mutex is held only while a buffer attaches and while the drainer
/// advances its round-robin cursor; it is released around compression
/// work so new producer threads and buffer reclamation never wait on I/O.
pub(crate) struct Registry {
    buffers: Mutex<Vec<Arc<StagingBuffer>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
        }
    }

    /// Create and register the staging buffer for a new producer thread.
    pub fn attach(&self, capacity: usize) -> Arc<StagingBuffer> {
        let sb = Arc::new(StagingBuffer::new(capacity));
        self.buffers.lock().push(sb.clone());
        sb
    }

    /// Lock the buffer list. The drainer mutates it in place: erasing a
    /// deletable buffer drops the registry's reference to it.
    pub fn lock(&self) -> MutexGuard<'_, Vec<Arc<StagingBuffer>>> {
        self.buffers.lock()
    }
}
