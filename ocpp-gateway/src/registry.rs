//! Node identity to live connection map.
//!
//! Each node id maps to exactly one authoritative connection. A second
//! registration for the same id replaces the entry atomically and closes the
//! superseded connection; the two never coexist.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::connection::{CloseReason, Connection};
use crate::types::{ConnectionId, NodeId};

/// Concurrent registry of live connections.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<NodeId, Arc<Connection>>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection` to its node id.
    ///
    /// Returns the superseded connection, already closed with
    /// [`CloseReason::Superseded`], if another connection held the id.
    /// Re-registering the same connection is a no-op.
    pub fn register(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        let previous = match self.connections.entry(connection.node_id().clone()) {
            Entry::Occupied(mut entry) => {
                if entry.get().id() == connection.id() {
                    return None;
                }
                Some(entry.insert(connection))
            }
            Entry::Vacant(entry) => {
                entry.insert(connection);
                None
            }
        };

        if let Some(old) = &previous {
            old.close(CloseReason::Superseded);
            tracing::info!(
                node_id = %old.node_id(),
                connection_id = %old.id(),
                "evicted superseded connection"
            );
        }
        previous
    }

    /// Remove the entry for `node_id` if it still points at `connection_id`.
    ///
    /// A stale close event for a superseded connection leaves the newer
    /// registration in place. Returns the removed connection.
    pub fn unregister(&self, node_id: &NodeId, connection_id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .remove_if(node_id, |_, conn| conn.id() == connection_id)
            .map(|(_, conn)| conn)
    }

    /// Connection currently bound to `node_id`.
    pub fn lookup(&self, node_id: &NodeId) -> Option<Arc<Connection>> {
        self.connections
            .get(node_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All registered node ids.
    pub fn all_node_ids(&self) -> BTreeSet<NodeId> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
