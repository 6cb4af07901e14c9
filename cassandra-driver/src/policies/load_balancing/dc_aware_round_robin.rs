use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use tracing::debug;

use super::host_list::{Cursor, HostList};
use super::{rotated, HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
use crate::cluster::host::Host;
use crate::errors::InvalidArgumentError;

/// Round robin over the hosts of the local datacenter, followed by a
/// bounded number of hosts from other datacenters.
///
/// Remote hosts are used only when the request consistency is not local
/// (`LocalOne`, `LocalQuorum`), unless
/// [`use_remote_hosts_for_local_consistency`](DcAwareRoundRobinPolicyBuilder::use_remote_hosts_for_local_consistency)
/// is enabled.
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: ArcSwapOption<String>,
    // Serializes the first-host datacenter election.
    local_dc_lock: Mutex<()>,
    max_remote_hosts_to_use: Option<usize>,
    use_remote_hosts_for_local_consistency: bool,

    local: HostList,
    remote: HostList,
    position: Cursor,
}

/// The builder of [`DcAwareRoundRobinPolicy`].
///
/// ```
/// # use cassandra_driver::policies::load_balancing::DcAwareRoundRobinPolicy;
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let policy = DcAwareRoundRobinPolicy::builder()
///     .local_dc("dc1")
///     .max_remote_hosts_to_use(Some(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct DcAwareRoundRobinPolicyBuilder {
    local_dc: Option<String>,
    max_remote_hosts_to_use: Option<usize>,
    use_remote_hosts_for_local_consistency: bool,
}

impl DcAwareRoundRobinPolicyBuilder {
    /// Creates a builder with no fixed local datacenter, no cap on remote
    /// hosts and local consistencies kept in the local datacenter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the local datacenter. When unset, the datacenter of the first
    /// host that comes up (and has a datacenter) becomes local.
    pub fn local_dc(mut self, local_dc: impl Into<String>) -> Self {
        self.local_dc = Some(local_dc.into());
        self
    }

    /// Caps how many hosts from other datacenters are kept. `None` means
    /// no cap, `Some(0)` disables remote hosts.
    pub fn max_remote_hosts_to_use(mut self, max: Option<usize>) -> Self {
        self.max_remote_hosts_to_use = max;
        self
    }

    /// Plans remote hosts even for `LocalOne` and `LocalQuorum` requests.
    pub fn use_remote_hosts_for_local_consistency(mut self, enabled: bool) -> Self {
        self.use_remote_hosts_for_local_consistency = enabled;
        self
    }

    pub fn build(self) -> Result<DcAwareRoundRobinPolicy, InvalidArgumentError> {
        if self.use_remote_hosts_for_local_consistency && self.max_remote_hosts_to_use == Some(0) {
            return Err(InvalidArgumentError::new(
                "remote hosts cannot be used for local consistency when max_remote_hosts_to_use is 0",
            ));
        }
        Ok(DcAwareRoundRobinPolicy {
            local_dc: ArcSwapOption::from_pointee(self.local_dc),
            local_dc_lock: Mutex::new(()),
            max_remote_hosts_to_use: self.max_remote_hosts_to_use,
            use_remote_hosts_for_local_consistency: self.use_remote_hosts_for_local_consistency,
            local: HostList::new(),
            remote: HostList::new(),
            position: Cursor::default(),
        })
    }
}

impl DcAwareRoundRobinPolicy {
    pub fn builder() -> DcAwareRoundRobinPolicyBuilder {
        DcAwareRoundRobinPolicyBuilder::new()
    }

    /// Currently elected local datacenter.
    pub fn local_dc(&self) -> Option<Arc<String>> {
        self.local_dc.load_full()
    }

    fn is_local(&self, host: &Host) -> bool {
        let Some(host_dc) = host.datacenter.as_deref() else {
            return true;
        };
        if let Some(local_dc) = self.local_dc.load().as_deref() {
            return local_dc.as_str() == host_dc;
        }

        let _guard = self.local_dc_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.local_dc.load().as_deref() {
            Some(local_dc) => local_dc.as_str() == host_dc,
            None => {
                debug!("Using datacenter {} of host {} as local", host_dc, host);
                self.local_dc.store(Some(Arc::new(host_dc.to_owned())));
                true
            }
        }
    }

    fn is_configured_local(&self, host: &Host) -> bool {
        match (host.datacenter.as_deref(), self.local_dc.load().as_deref()) {
            (None, _) => true,
            (Some(host_dc), Some(local_dc)) => local_dc.as_str() == host_dc,
            (Some(_), None) => false,
        }
    }
}

impl LoadBalancingPolicy for DcAwareRoundRobinPolicy {
    fn host_up(&self, host: &Arc<Host>) {
        if self.is_local(host) {
            self.local.insert(host, None);
        } else if !self.remote.insert(host, self.max_remote_hosts_to_use) {
            debug!("Not using remote host {}", host);
        }
    }

    fn host_down(&self, host: &Arc<Host>) {
        if self.is_configured_local(host) {
            self.local.remove(host);
        } else {
            self.remote.remove(host);
        }
    }

    fn host_found(&self, _host: &Arc<Host>) {}

    fn host_lost(&self, _host: &Arc<Host>) {}

    fn distance(&self, host: &Host) -> HostDistance {
        if self.is_configured_local(host) {
            if self.local.contains(host) {
                return HostDistance::Local;
            }
        } else if self.remote.contains(host) {
            return HostDistance::Remote;
        }
        HostDistance::Ignore
    }

    fn plan<'a>(&'a self, routing_info: &'a RoutingInfo<'a>) -> Plan<'a> {
        let local = self.local.snapshot();
        let remote = self.remote.snapshot();
        let total = local.len() + remote.len();
        if total == 0 {
            return Box::new(std::iter::empty());
        }

        let position = self.position.advance(total);
        let remote = if routing_info.consistency.is_local()
            && !self.use_remote_hosts_for_local_consistency
        {
            Arc::new(Vec::new())
        } else {
            remote
        };

        // One index walks both lists.
        let remote_start = position + local.len();
        Box::new(rotated(local, position).chain(rotated(remote, remote_start)))
    }

    fn name(&self) -> String {
        "DcAwareRoundRobinPolicy".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::DcAwareRoundRobinPolicy;
    use crate::frame::types::Consistency;
    use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, RoutingInfo};
    use crate::test_utils::{mock_host, plan_ids};

    fn routing_info(consistency: Consistency) -> RoutingInfo<'static> {
        RoutingInfo {
            consistency,
            ..Default::default()
        }
    }

    fn policy_with_hosts(max_remote: Option<usize>, remote_for_local: bool) -> DcAwareRoundRobinPolicy {
        let policy = DcAwareRoundRobinPolicy::builder()
            .local_dc("dc1")
            .max_remote_hosts_to_use(max_remote)
            .use_remote_hosts_for_local_consistency(remote_for_local)
            .build()
            .unwrap();
        policy.host_up(&mock_host(1, Some("dc1")));
        policy.host_up(&mock_host(2, Some("dc2")));
        policy.host_up(&mock_host(3, Some("dc1")));
        policy.host_up(&mock_host(4, Some("dc3")));
        policy.host_up(&mock_host(5, None));
        policy
    }

    #[test]
    fn locals_always_come_before_remotes() {
        let policy = policy_with_hosts(None, false);
        let info = routing_info(Consistency::Quorum);

        for _ in 0..10 {
            let ids = plan_ids(policy.plan(&info));
            assert_eq!(ids.len(), 5);
            let mut locals = ids[..3].to_vec();
            locals.sort();
            assert_eq!(locals, vec![1, 3, 5]);
            let mut remotes = ids[3..].to_vec();
            remotes.sort();
            assert_eq!(remotes, vec![2, 4]);
        }
    }

    #[test]
    fn local_rotation_advances_by_one() {
        let policy = policy_with_hosts(None, false);
        let info = routing_info(Consistency::One);
        assert_eq!(plan_ids(policy.plan(&info)), vec![1, 3, 5, 4, 2]);
        assert_eq!(plan_ids(policy.plan(&info)), vec![3, 5, 1, 2, 4]);
        assert_eq!(plan_ids(policy.plan(&info)), vec![5, 1, 3, 4, 2]);
    }

    #[test]
    fn local_consistency_stays_in_local_dc() {
        let policy = policy_with_hosts(None, false);
        for consistency in [Consistency::LocalOne, Consistency::LocalQuorum] {
            let mut ids = plan_ids(policy.plan(&routing_info(consistency)));
            ids.sort();
            assert_eq!(ids, vec![1, 3, 5]);
        }

        let policy = policy_with_hosts(None, true);
        let ids = plan_ids(policy.plan(&routing_info(Consistency::LocalOne)));
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn remote_hosts_are_capped() {
        let policy = policy_with_hosts(Some(0), false);
        assert_eq!(policy.distance(&mock_host(2, Some("dc2"))), HostDistance::Ignore);
        for _ in 0..5 {
            let mut ids = plan_ids(policy.plan(&routing_info(Consistency::All)));
            ids.sort();
            assert_eq!(ids, vec![1, 3, 5]);
        }

        let policy = policy_with_hosts(Some(1), false);
        assert_eq!(policy.distance(&mock_host(2, Some("dc2"))), HostDistance::Remote);
        assert_eq!(policy.distance(&mock_host(4, Some("dc3"))), HostDistance::Ignore);
        assert_eq!(policy.distance(&mock_host(1, Some("dc1"))), HostDistance::Local);
        assert_eq!(plan_ids(policy.plan(&routing_info(Consistency::All))).len(), 4);
    }

    #[test]
    fn remote_for_local_requires_remote_hosts() {
        let result = DcAwareRoundRobinPolicy::builder()
            .max_remote_hosts_to_use(Some(0))
            .use_remote_hosts_for_local_consistency(true)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn first_host_elects_local_dc() {
        let policy = DcAwareRoundRobinPolicy::builder().build().unwrap();
        policy.host_up(&mock_host(1, None));
        assert!(policy.local_dc().is_none());

        policy.host_up(&mock_host(2, Some("dc2")));
        policy.host_up(&mock_host(3, Some("dc1")));
        assert_eq!(policy.local_dc().as_deref().map(String::as_str), Some("dc2"));
        assert_eq!(policy.distance(&mock_host(2, Some("dc2"))), HostDistance::Local);
        assert_eq!(policy.distance(&mock_host(3, Some("dc1"))), HostDistance::Remote);

        policy.host_down(&mock_host(2, Some("dc2")));
        assert_eq!(policy.distance(&mock_host(2, Some("dc2"))), HostDistance::Ignore);
    }
}
