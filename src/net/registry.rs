//! Connection identity and the registry of live accepted connections.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track live connections by ID so the listener can enumerate them
//! - Remove entries as soon as a connection reports it went down

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connections keyed by identity.
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: DashMap<ConnectionId, T>,
}

impl<T: Clone> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, id: ConnectionId, entry: T) {
        self.entries.insert(id, entry);
        tracing::trace!(connection_id = %id, live = self.entries.len(), "Connection registered");
    }

    /// Drop the entry for `id`, returning it if it was still present.
    pub fn remove(&self, id: ConnectionId) -> Option<T> {
        let removed = self.entries.remove(&id).map(|(_, entry)| entry);
        if removed.is_some() {
            tracing::trace!(connection_id = %id, live = self.entries.len(), "Connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<T> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Copy of every live entry, in no particular order.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
