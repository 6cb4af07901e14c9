use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use super::{HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::Host;
use crate::routing::ReplicaLookup;

/// Wraps another policy and hides every host whose IP address is not in
/// the allow list from it. Plans and distances come from the wrapped policy.
#[derive(Debug)]
pub struct WhiteListPolicy {
    child_policy: Arc<dyn LoadBalancingPolicy>,
    allowed: HashSet<IpAddr>,
}

impl WhiteListPolicy {
    pub fn new(
        allowed: impl IntoIterator<Item = IpAddr>,
        child_policy: Arc<dyn LoadBalancingPolicy>,
    ) -> Self {
        Self {
            child_policy,
            allowed: allowed.into_iter().collect(),
        }
    }

    fn is_allowed(&self, host: &Host) -> bool {
        self.allowed.contains(&host.ip())
    }
}

impl LoadBalancingPolicy for WhiteListPolicy {
    fn host_up(&self, host: &Arc<Host>) {
        if self.is_allowed(host) {
            self.child_policy.host_up(host);
        }
    }

    fn host_down(&self, host: &Arc<Host>) {
        if self.is_allowed(host) {
            self.child_policy.host_down(host);
        }
    }

    fn host_found(&self, host: &Arc<Host>) {
        if self.is_allowed(host) {
            self.child_policy.host_found(host);
        }
    }

    fn host_lost(&self, host: &Arc<Host>) {
        if self.is_allowed(host) {
            self.child_policy.host_lost(host);
        }
    }

    fn distance(&self, host: &Host) -> HostDistance {
        self.child_policy.distance(host)
    }

    fn plan<'a>(&'a self, routing_info: &'a RoutingInfo<'a>) -> Plan<'a> {
        self.child_policy.plan(routing_info)
    }

    fn setup(&self, replica_lookup: Arc<dyn ReplicaLookup>) {
        self.child_policy.setup(replica_lookup);
    }

    fn name(&self) -> String {
        format!("WhiteListPolicy({})", self.child_policy.name())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::WhiteListPolicy;
    use crate::cluster::registry::HostRegistry;
    use crate::policies::load_balancing::{
        HostDistance, LoadBalancingPolicy, RoundRobinPolicy, RoutingInfo,
    };
    use crate::test_utils::{mock_host, plan_ids};

    #[test]
    fn hosts_outside_the_list_are_never_planned() {
        let a = mock_host(1, None);
        let b = mock_host(2, None);
        let c = mock_host(3, None);

        let round_robin = Arc::new(RoundRobinPolicy::new());
        let policy = Arc::new(WhiteListPolicy::new([a.ip(), b.ip()], round_robin.clone()));

        let registry = HostRegistry::new();
        registry.add_listener(policy.clone());
        for host in [&a, &b, &c] {
            registry.host_found(host.clone());
        }

        assert_eq!(round_robin.distance(&c), HostDistance::Ignore);
        assert_eq!(policy.distance(&a), HostDistance::Local);

        let info = RoutingInfo::default();
        for _ in 0..4 {
            let mut ids = plan_ids(policy.plan(&info));
            ids.sort();
            assert_eq!(ids, vec![1, 2]);
        }

        registry.host_down(a.address);
        assert_eq!(plan_ids(policy.plan(&info)), vec![2]);
    }
}
