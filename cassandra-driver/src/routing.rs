//! Replica lookup used by token-aware routing.
//!
//! The driver does not discover the token ring by itself; the
//! application plugs in a [`ReplicaLookup`] through
//! [`SessionBuilder::replica_lookup`](crate::SessionBuilder::replica_lookup)
//! and token-aware policies consult it for every request carrying a routing key.

use std::sync::Arc;

use crate::cluster::host::Host;
use crate::policies::load_balancing::RoutingInfo;

/// Finds the hosts owning the data of a request.
pub trait ReplicaLookup: Send + Sync + std::fmt::Debug {
    /// Returns the replicas for the routing key in `routing_info` within
    /// `keyspace`. An empty list means the replicas are unknown.
    fn find_replicas(&self, keyspace: Option<&str>, routing_info: &RoutingInfo<'_>) -> Vec<Arc<Host>>;
}
