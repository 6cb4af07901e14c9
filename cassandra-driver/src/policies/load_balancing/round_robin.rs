use std::sync::Arc;

use super::host_list::{Cursor, HostList};
use super::{rotated, HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::Host;

/// Cycles through every host that is up, ignoring datacenters.
///
/// Each plan starts one host further than the previous one, so consecutive
/// plans are rotations of the host list offset by one.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    hosts: HostList,
    position: Cursor,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self {
            hosts: HostList::new(),
            position: Cursor::default(),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn host_up(&self, host: &Arc<Host>) {
        self.hosts.insert(host, None);
    }

    fn host_down(&self, host: &Arc<Host>) {
        self.hosts.remove(host);
    }

    fn host_found(&self, _host: &Arc<Host>) {}

    fn host_lost(&self, _host: &Arc<Host>) {}

    fn distance(&self, host: &Host) -> HostDistance {
        if self.hosts.contains(host) {
            HostDistance::Local
        } else {
            HostDistance::Ignore
        }
    }

    fn plan<'a>(&'a self, _routing_info: &'a RoutingInfo<'a>) -> Plan<'a> {
        let hosts = self.hosts.snapshot();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        let start = self.position.advance(hosts.len());
        Box::new(rotated(hosts, start))
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::RoundRobinPolicy;
    use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoutingInfo};
    use crate::test_utils::{mock_host, plan_ids};

    #[test]
    fn consecutive_plans_rotate_by_one() {
        let policy = RoundRobinPolicy::new();
        for id in 1..=3 {
            policy.host_up(&mock_host(id, None));
        }
        // Duplicate notifications do not change the list.
        policy.host_up(&mock_host(2, None));

        let info = RoutingInfo::default();
        assert_eq!(plan_ids(policy.plan(&info)), vec![1, 2, 3]);
        assert_eq!(plan_ids(policy.plan(&info)), vec![2, 3, 1]);
        assert_eq!(plan_ids(policy.plan(&info)), vec![3, 1, 2]);
        assert_eq!(plan_ids(policy.plan(&info)), vec![1, 2, 3]);
    }

    #[test]
    fn down_hosts_are_not_planned() {
        let policy = RoundRobinPolicy::new();
        let info = RoutingInfo::default();
        assert_eq!(plan_ids(policy.plan(&info)), Vec::<u8>::new());

        let a = mock_host(1, None);
        let b = mock_host(2, None);
        policy.host_up(&a);
        policy.host_up(&b);
        policy.host_down(&a);

        assert_eq!(policy.distance(&a), HostDistance::Ignore);
        assert_eq!(policy.distance(&b), HostDistance::Local);
        for _ in 0..3 {
            assert_eq!(plan_ids(policy.plan(&info)), vec![2]);
        }
    }

    #[test]
    fn plan_is_a_snapshot() {
        let policy = RoundRobinPolicy::new();
        policy.host_up(&mock_host(1, None));
        policy.host_up(&mock_host(2, None));

        let info = RoutingInfo::default();
        let plan = policy.plan(&info);
        policy.host_up(&mock_host(3, None));
        policy.host_down(&mock_host(1, None));
        assert_eq!(plan_ids(plan), vec![1, 2]);
    }
}
