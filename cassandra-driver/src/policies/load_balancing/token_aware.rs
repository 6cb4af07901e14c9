use std::sync::{Arc, PoisonError, RwLock};

use rand::prelude::SliceRandom;
use rand::rng;
use smallvec::SmallVec;
use tracing::trace;

use super::{HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::Host;
use crate::routing::ReplicaLookup;

type Replicas = SmallVec<[Arc<Host>; 8]>;

/// Wraps another policy and puts the replicas owning the request's
/// partition at the front of its plans.
///
/// Only replicas the wrapped policy considers [local](HostDistance::Local)
/// are moved to the front. The rest of the plan is the wrapped policy's
/// plan without the replicas already yielded.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    child_policy: Arc<dyn LoadBalancingPolicy>,
    replica_lookup: RwLock<Option<Arc<dyn ReplicaLookup>>>,
    shuffle_replicas: bool,
}

impl TokenAwarePolicy {
    pub fn new(child_policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        Self {
            child_policy,
            replica_lookup: RwLock::new(None),
            shuffle_replicas: true,
        }
    }

    /// Replicas are shuffled by default to spread the load over them.
    /// Disabling this keeps the order returned by the replica lookup.
    pub fn shuffle_replicas(mut self, shuffle: bool) -> Self {
        self.shuffle_replicas = shuffle;
        self
    }

    fn replica_lookup(&self) -> Option<Arc<dyn ReplicaLookup>> {
        self.replica_lookup
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn host_up(&self, host: &Arc<Host>) {
        self.child_policy.host_up(host);
    }

    fn host_down(&self, host: &Arc<Host>) {
        self.child_policy.host_down(host);
    }

    fn host_found(&self, host: &Arc<Host>) {
        self.child_policy.host_found(host);
    }

    fn host_lost(&self, host: &Arc<Host>) {
        self.child_policy.host_lost(host);
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.child_policy.distance(host)
    }

    fn plan<'a>(&'a self, routing_info: &'a RoutingInfo<'a>) -> Plan<'a> {
        let Some(replica_lookup) = self.replica_lookup() else {
            return self.child_policy.plan(routing_info);
        };
        if routing_info.routing_key.is_none() {
            return self.child_policy.plan(routing_info);
        }

        let mut replicas: Replicas = replica_lookup
            .find_replicas(routing_info.keyspace, routing_info)
            .into_iter()
            .collect();
        if replicas.is_empty() {
            return self.child_policy.plan(routing_info);
        }
        if self.shuffle_replicas {
            replicas.shuffle(&mut rng());
        }
        trace!(replicas = replicas.len(), "Token aware plan");

        Box::new(TokenAwarePlan {
            replicas: replicas.into_iter(),
            child_policy: self.child_policy.as_ref(),
            routing_info,
            seen: SmallVec::new(),
            child_plan: None,
        })
    }

    fn setup(&self, replica_lookup: Arc<dyn ReplicaLookup>) {
        *self
            .replica_lookup
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(replica_lookup.clone());
        self.child_policy.setup(replica_lookup);
    }

    fn name(&self) -> String {
        format!("TokenAwarePolicy({})", self.child_policy.name())
    }
}

struct TokenAwarePlan<'a> {
    replicas: smallvec::IntoIter<[Arc<Host>; 8]>,
    child_policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo<'a>,
    seen: Replicas,
    // Created only once the local replicas are exhausted.
    child_plan: Option<Plan<'a>>,
}

impl Iterator for TokenAwarePlan<'_> {
    type Item = Arc<Host>;

    fn next(&mut self) -> Option<Self::Item> {
        for replica in self.replicas.by_ref() {
            if self.child_policy.distance(&replica) == HostDistance::Local
                && !self.seen.contains(&replica)
            {
                self.seen.push(replica.clone());
                return Some(replica);
            }
        }

        let child_policy = self.child_policy;
        let routing_info = self.routing_info;
        let child_plan = self
            .child_plan
            .get_or_insert_with(|| child_policy.plan(routing_info));
        child_plan.find(|host| !self.seen.contains(host))
    }
}
