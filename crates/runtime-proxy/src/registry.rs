//! Connection registry: proxied sockets indexed by id, window, and runtime.
//!
//! Pure bookkeeping with no I/O. The proxy owns one registry and mutates
//! it under its state lock.

use std::collections::{HashMap, HashSet};

use crate::{ConnectionId, WindowId};

/// A proxy-tracked logical socket.
#[derive(Debug, Clone)]
pub struct Connection<H> {
    pub id: ConnectionId,
    pub window: WindowId,
    pub url: String,
    pub protocol: Option<String>,
    pub runtime_id: Option<String>,
    /// Handle used to drive the underlying socket.
    pub handle: H,
}

/// Primary map plus secondary indexes by owning window and owning runtime.
#[derive(Debug)]
pub struct ConnectionRegistry<H> {
    connections: HashMap<ConnectionId, Connection<H>>,
    by_window: HashMap<WindowId, HashSet<ConnectionId>>,
    by_runtime: HashMap<String, HashSet<ConnectionId>>,
}

impl<H> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            by_window: HashMap::new(),
            by_runtime: HashMap::new(),
        }
    }
}

impl<H> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection into the primary map and both indexes.
    ///
    /// The runtime index is only touched when the connection has a runtime id.
    pub fn add(&mut self, connection: Connection<H>) {
        let id = connection.id;
        self.by_window
            .entry(connection.window)
            .or_default()
            .insert(id);
        if let Some(runtime_id) = &connection.runtime_id {
            self.by_runtime
                .entry(runtime_id.clone())
                .or_default()
                .insert(id);
        }
        self.connections.insert(id, connection);
    }

    /// Remove a connection and prune it from both indexes.
    ///
    /// Index buckets are dropped once empty. Unknown ids are a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection<H>> {
        let connection = self.connections.remove(&id)?;

        if let Some(bucket) = self.by_window.get_mut(&connection.window) {
            bucket.remove(&id);
            if bucket.is_empty() {
                self.by_window.remove(&connection.window);
            }
        }
        if let Some(runtime_id) = &connection.runtime_id {
            if let Some(bucket) = self.by_runtime.get_mut(runtime_id) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.by_runtime.remove(runtime_id);
                }
            }
        }

        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection<H>> {
        self.connections.get(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Current ids owned by a window. Empty for unknown windows.
    pub fn by_window(&self, window: WindowId) -> HashSet<ConnectionId> {
        self.by_window.get(&window).cloned().unwrap_or_default()
    }

    /// Current ids bound to a runtime. Empty for unknown runtimes.
    pub fn by_runtime(&self, runtime_id: &str) -> HashSet<ConnectionId> {
        self.by_runtime.get(runtime_id).cloned().unwrap_or_default()
    }

    pub fn has_window(&self, window: WindowId) -> bool {
        self.by_window.contains_key(&window)
    }

    pub fn has_runtime(&self, runtime_id: &str) -> bool {
        self.by_runtime.contains_key(runtime_id)
    }

    /// Drop a runtime's index bucket outright.
    pub fn drop_runtime_bucket(&mut self, runtime_id: &str) {
        self.by_runtime.remove(runtime_id);
    }

    /// All live connection ids.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// Remove every connection and index, returning what was registered.
    pub fn drain(&mut self) -> Vec<Connection<H>> {
        self.by_window.clear();
        self.by_runtime.clear();
        self.connections.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
