//! Bookkeeping of live connection workers for coordinated shutdown.
//!
//! The registry owns no worker lifetime: entries hold a close signal and the
//! task's join handle, keyed by an opaque worker id. Enumeration during
//! shutdown only signals; the worker exits on its own and deregisters itself
//! exactly once. The registry's lock is distinct from the record log's lock,
//! so shutdown bookkeeping never waits on in-flight log I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Opaque identity of one connection worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Entry {
    peer: SocketAddr,
    close: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

/// Collection of live workers, guarded by its own lock.
pub struct Registry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<WorkerId, Entry>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Register a newly accepted connection. Returns the worker's id and the
    /// close signal the worker must watch.
    pub fn register(&self, peer: SocketAddr) -> (WorkerId, Arc<Notify>) {
        let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let close = Arc::new(Notify::new());
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries.insert(
            id,
            Entry {
                peer,
                close: Arc::clone(&close),
                handle: None,
            },
        );
        (id, close)
    }

    /// Attach the spawned task's join handle to an entry. A miss means the
    /// worker already finished and deregistered; the handle is dropped.
    pub fn attach_handle(&self, id: WorkerId, handle: JoinHandle<()>) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(entry) = entries.get_mut(&id) {
            entry.handle = Some(handle);
        }
    }

    /// Remove a worker's entry. Called by the worker itself, once, as it
    /// exits; after this the worker is never enumerated again.
    pub fn deregister(&self, id: WorkerId) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.remove(&id).is_some() {
            debug!(worker = %id, "Worker deregistered");
        }
    }

    /// Signal every registered connection to close. Ownership stays with the
    /// workers; they observe the signal, exit, and deregister themselves.
    pub fn close_all(&self) {
        let entries = self.entries.lock().expect("registry lock poisoned");
        for (id, entry) in entries.iter() {
            debug!(worker = %id, peer = %entry.peer, "Closing connection");
            entry.close.notify_one();
        }
    }

    /// Take every remaining join handle so the shutdown coordinator can wait
    /// for the workers to finish.
    pub fn drain_handles(&self) -> Vec<JoinHandle<()>> {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        entries
            .drain()
            .filter_map(|(_, entry)| entry.handle)
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }
}
