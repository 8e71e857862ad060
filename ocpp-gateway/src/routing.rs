//! Static routes from destination nodes to hubs.
//!
//! Resolution is single-hop: a destination maps to at most one hub, and
//! anything beyond the hub is the hub's business.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use crate::types::{NetworkingMode, NodeId};

/// A live connection able to carry a message, and the framing to use on it.
#[derive(Debug, Clone)]
pub struct RouteCandidate {
    /// Connection to write to.
    pub connection: Arc<Connection>,
    /// `NetworkingExtensions` when the connection is a hub relaying for the
    /// destination.
    pub mode: NetworkingMode,
}

/// Operator-managed destination to hub map.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: DashMap<NodeId, NodeId>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `destination` through `hub`. Replaces any existing route for
    /// the destination.
    pub fn add_route(&self, destination: NodeId, hub: NodeId) {
        tracing::debug!(%destination, %hub, "route added");
        self.routes.insert(destination, hub);
    }

    /// Remove the route `destination -> hub`. A route to a different hub is
    /// left alone. Returns whether a route was removed.
    pub fn remove_route(&self, destination: &NodeId, hub: &NodeId) -> bool {
        let removed = self
            .routes
            .remove_if(destination, |_, current| current == hub)
            .is_some();
        if removed {
            tracing::debug!(%destination, %hub, "route removed");
        }
        removed
    }

    /// Hub configured for `destination`.
    pub fn hub_for(&self, destination: &NodeId) -> Option<NodeId> {
        self.routes.get(destination).map(|hub| hub.value().clone())
    }

    /// All routes, ordered by destination.
    pub fn routes(&self) -> BTreeMap<NodeId, NodeId> {
        self.routes
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Candidate connections for `destination`.
    ///
    /// Empty for the zero destination or when nothing is reachable. A routed
    /// destination resolves only through its hub, even if it also happens
    /// to be connected directly.
    pub fn resolve(&self, destination: &NodeId, registry: &ConnectionRegistry) -> Vec<RouteCandidate> {
        if destination.is_zero() {
            return Vec::new();
        }
        let (target, mode) = match self.hub_for(destination) {
            Some(hub) => (hub, NetworkingMode::NetworkingExtensions),
            None => (destination.clone(), NetworkingMode::Standard),
        };
        registry
            .lookup(&target)
            .filter(|conn| !conn.is_closed())
            .map(|connection| RouteCandidate { connection, mode })
            .into_iter()
            .collect()
    }
}
