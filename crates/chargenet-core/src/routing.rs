//! Addressing and route table
//!
//! Decides for each inbound envelope whether it is handled locally or relayed to a
//! next hop, and catches messages that already passed through this node.

use dashmap::DashMap;
use tracing::trace;

use crate::envelope::Envelope;
use crate::types::NodeId;

/// Where an envelope goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Hand to the local dispatch table (or correlation engine for replies)
    Local,
    /// Relay to the given directly connected neighbour
    Relay { next_hop: NodeId },
    /// The local node already appears in the network path
    Loop,
}

/// Destination to next-hop mapping
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<NodeId, NodeId>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace a route, returning the previous next hop
    pub fn add_route(&self, destination: NodeId, next_hop: NodeId) -> Option<NodeId> {
        trace!(%destination, %next_hop, "Route added");
        self.routes.insert(destination, next_hop)
    }

    pub fn remove_route(&self, destination: &NodeId) -> Option<NodeId> {
        self.routes.remove(destination).map(|(_, next_hop)| next_hop)
    }

    pub fn lookup(&self, destination: &NodeId) -> Option<NodeId> {
        self.routes.get(destination).map(|entry| entry.value().clone())
    }

    /// Destinations currently reached through `next_hop`
    pub fn routes_via(&self, next_hop: &NodeId) -> Vec<NodeId> {
        let mut destinations: Vec<NodeId> = self
            .routes
            .iter()
            .filter(|entry| entry.value() == next_hop)
            .map(|entry| entry.key().clone())
            .collect();
        destinations.sort();
        destinations
    }

    /// Withdraw every route through `next_hop`, e.g. after its connection dropped
    pub fn remove_routes_via(&self, next_hop: &NodeId) -> Vec<NodeId> {
        let withdrawn = self.routes_via(next_hop);
        for destination in &withdrawn {
            self.routes.remove_if(destination, |_, hop| hop == next_hop);
        }
        withdrawn
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route an envelope arriving at `local`
    ///
    /// `connected` reports whether a direct connection to a node exists; a direct
    /// neighbour is reachable without a route entry.
    pub fn decide<F>(&self, local: &NodeId, envelope: &Envelope, connected: F) -> RouteDecision
    where
        F: Fn(&NodeId) -> bool,
    {
        if envelope.network_path().contains(local) {
            return RouteDecision::Loop;
        }

        let destination = envelope.destination();
        if destination == local {
            return RouteDecision::Local;
        }
        if let Some(next_hop) = self.lookup(destination) {
            return RouteDecision::Relay { next_hop };
        }
        if connected(destination) {
            return RouteDecision::Relay {
                next_hop: destination.clone(),
            };
        }
        RouteDecision::Local
    }
}
