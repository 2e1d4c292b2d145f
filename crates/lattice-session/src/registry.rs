use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::debug;

use lattice_core::error::{LatticeError, Result};
use lattice_core::types::{ObjectHandle, ObjectKind};

/// Coordinator-wide `key -> handle` map.
///
/// Every operation takes the single lock, so a lookup racing an unload sees
/// either the handle or nothing. Handles leave only through [`pop`] or
/// [`clear`]; nothing is evicted implicitly.
///
/// [`pop`]: ObjectRegistry::pop
/// [`clear`]: ObjectRegistry::clear
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    handles: Mutex<HashMap<String, ObjectHandle>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite `key`, returning the handle it replaced.
    pub fn put(&self, key: impl Into<String>, handle: ObjectHandle) -> Option<ObjectHandle> {
        let key = key.into();
        debug!(key = %key, kind = ?handle.kind(), object_id = %handle.object_id(), "Handle registered");
        self.handles.lock().insert(key, handle)
    }

    pub fn get(&self, key: &str) -> Option<ObjectHandle> {
        self.handles.lock().get(key).cloned()
    }

    /// Like [`get`](Self::get), but absence is an `ObjectNotFound` error.
    pub fn resolve(&self, key: &str) -> Result<ObjectHandle> {
        self.get(key)
            .ok_or_else(|| LatticeError::ObjectNotFound(key.to_string()))
    }

    /// Remove and return `key`. Popping an absent key is not an error.
    pub fn pop(&self, key: &str) -> Option<ObjectHandle> {
        let handle = self.handles.lock().remove(key);
        if handle.is_none() {
            debug!(key = %key, "Pop of unknown key");
        }
        handle
    }

    pub fn contains(&self, key: &str) -> bool {
        self.handles.lock().contains_key(key)
    }

    /// Snapshot of the registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.handles.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshot of `(key, kind)` pairs, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, ObjectKind)> {
        let mut entries: Vec<_> = self
            .handles
            .lock()
            .iter()
            .map(|(k, h)| (k.clone(), h.kind()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    /// Drop every handle, closing live query connections. Returns the drained
    /// handles so the caller can report them.
    pub fn clear(&self) -> Vec<(String, ObjectHandle)> {
        let drained: Vec<_> = self.handles.lock().drain().collect();
        for (_, handle) in &drained {
            if let ObjectHandle::QueryManager { connection, .. } = handle {
                connection.close();
            }
        }
        debug!(count = drained.len(), "Registry cleared");
        drained
    }
}
