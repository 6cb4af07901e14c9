//! Load balancing configurations\
//! `Session` can use any load balancing policy which implements the `LoadBalancingPolicy` trait\
//! Policies learn about the cluster through host notifications sent by the
//! [`HostRegistry`](crate::cluster::registry::HostRegistry) and answer every
//! request with a fresh [`Plan`].

use std::sync::Arc;

use crate::cluster::host::Host;
use crate::frame::types;
use crate::routing::ReplicaLookup;

mod dc_aware_round_robin;
mod host_list;
mod round_robin;
mod token_aware;
mod white_list;

pub use dc_aware_round_robin::{DcAwareRoundRobinPolicy, DcAwareRoundRobinPolicyBuilder};
pub use round_robin::RoundRobinPolicy;
pub use token_aware::TokenAwarePolicy;
pub use white_list::WhiteListPolicy;

/// Represents info about statement that can be used by load balancing policies.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Requested consistency information allows to route requests to the appropriate
    /// datacenters. E.g. requests with a LOCAL_ONE consistency should be routed to the same
    /// datacenter.
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,

    /// Keyspace the statement operates on, if known.
    pub keyspace: Option<&'a str>,
    /// Serialized partition key, the basis of token-aware routing.
    pub routing_key: Option<&'a [u8]>,
}

/// Hosts to contact for one request, best candidates first.
///
/// A plan is evaluated lazily: most requests succeed on the first host, so
/// the rest of the plan is usually never computed.
pub type Plan<'a> = Box<dyn Iterator<Item = Arc<Host>> + Send + Sync + 'a>;

/// How a policy classifies a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostDistance {
    Local,
    Remote,
    /// The policy never plans this host.
    Ignore,
}

/// Policy that decides which hosts to contact for each request.
///
/// Host notifications are delivered by the registry in the order the
/// changes happened. `plan` may run concurrently with notifications and
/// must not block on them.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    fn host_up(&self, host: &Arc<Host>);

    fn host_down(&self, host: &Arc<Host>);

    fn host_found(&self, host: &Arc<Host>);

    fn host_lost(&self, host: &Arc<Host>);

    fn distance(&self, host: &Host) -> HostDistance;

    /// Returns hosts to contact for a given request.
    fn plan<'a>(&'a self, routing_info: &'a RoutingInfo<'a>) -> Plan<'a>;

    /// Invoked once the session knows how to find replicas for a routing key.
    fn setup(&self, _replica_lookup: Arc<dyn ReplicaLookup>) {}

    /// Returns the name of load balancing policy.
    fn name(&self) -> String;
}

/// Yields every host once, starting at `start` and wrapping around.
fn rotated(
    hosts: Arc<Vec<Arc<Host>>>,
    start: usize,
) -> impl Iterator<Item = Arc<Host>> + Send + Sync {
    let len = hosts.len();
    (0..len).map(move |i| hosts[(start + i) % len].clone())
}
