//! Host lifecycle bookkeeping and change notifications.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::cluster::host::Host;
use crate::policies::load_balancing::LoadBalancingPolicy;

/// Owns the set of known hosts and tells the registered load balancing
/// policies about every change.
///
/// Readers get lock-free snapshots. Updates are serialized by a lock
/// which is also held while listeners are notified, so every listener
/// observes the same order of events.
pub struct HostRegistry {
    hosts: ArcSwap<HashMap<SocketAddr, Arc<Host>>>,
    listeners: ArcSwap<Vec<Arc<dyn LoadBalancingPolicy>>>,
    update_lock: StdMutex<()>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(HashMap::new()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            update_lock: StdMutex::new(()),
        }
    }

    /// Registers a policy. The policy is immediately told about every
    /// known host (found, then up if it is up). Registering the same
    /// policy twice is a no-op. Returns whether the policy was added.
    pub fn add_listener(&self, listener: Arc<dyn LoadBalancingPolicy>) -> bool {
        if self.is_listening(&listener) {
            return false;
        }
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let listeners = self.listeners.load();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }

        debug!("Registering {} for host notifications", listener.name());
        for host in self.hosts.load().values() {
            listener.host_found(host);
            if host.is_up() {
                listener.host_up(host);
            }
        }

        let mut new_listeners = Vec::with_capacity(listeners.len() + 1);
        new_listeners.extend(listeners.iter().cloned());
        new_listeners.push(listener);
        self.listeners.store(Arc::new(new_listeners));
        true
    }

    pub fn is_listening(&self, listener: &Arc<dyn LoadBalancingPolicy>) -> bool {
        self.listeners
            .load()
            .iter()
            .any(|l| same_listener(l, listener))
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LoadBalancingPolicy>) {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let new_listeners: Vec<_> = self
            .listeners
            .load()
            .iter()
            .filter(|l| !same_listener(l, listener))
            .cloned()
            .collect();
        self.listeners.store(Arc::new(new_listeners));
    }

    /// Adds a newly discovered host. Returns `false` if a host with this
    /// address is already known, in which case nothing changes.
    pub fn host_found(&self, host: Arc<Host>) -> bool {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let hosts = self.hosts.load();
        if hosts.contains_key(&host.address) {
            return false;
        }

        let mut new_hosts = HashMap::clone(&hosts);
        new_hosts.insert(host.address, host.clone());
        self.hosts.store(Arc::new(new_hosts));

        debug!("Host {} found", host);
        let listeners = self.listeners.load();
        for listener in listeners.iter() {
            listener.host_found(&host);
        }
        if host.is_up() {
            for listener in listeners.iter() {
                listener.host_up(&host);
            }
        }
        true
    }

    /// Marks the host up. Listeners are notified only if it was down.
    pub fn host_up(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.set_status(address, true)
    }

    /// Marks the host down. Listeners are notified only if it was up.
    pub fn host_down(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.set_status(address, false)
    }

    /// Forgets the host. A host that was up is reported down first.
    pub fn host_lost(&self, address: SocketAddr) -> Option<Arc<Host>> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let hosts = self.hosts.load();
        let host = hosts.get(&address)?.clone();
        let mut new_hosts = HashMap::clone(&hosts);
        new_hosts.remove(&address);
        self.hosts.store(Arc::new(new_hosts));

        debug!("Host {} lost", host);
        let listeners = self.listeners.load();
        if host.set_up(false) {
            for listener in listeners.iter() {
                listener.host_down(&host);
            }
        }
        for listener in listeners.iter() {
            listener.host_lost(&host);
        }
        Some(host)
    }

    fn set_status(&self, address: SocketAddr, up: bool) -> Option<Arc<Host>> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let host = self.hosts.load().get(&address)?.clone();
        if host.set_up(up) == up {
            return None;
        }

        debug!("Host {} is now {}", host, if up { "up" } else { "down" });
        for listener in self.listeners.load().iter() {
            if up {
                listener.host_up(&host);
            } else {
                listener.host_down(&host);
            }
        }
        Some(host)
    }

    /// Snapshot of every known host.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.load().values().cloned().collect()
    }

    pub fn get(&self, address: &SocketAddr) -> Option<Arc<Host>> {
        self.hosts.load().get(address).cloned()
    }
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HostRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRegistry")
            .field("hosts", &self.hosts.load().keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.load().len())
            .finish()
    }
}

fn same_listener(a: &Arc<dyn LoadBalancingPolicy>, b: &Arc<dyn LoadBalancingPolicy>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

#[cfg(test)]
mod tests {
    use super::HostRegistry;
    use crate::cluster::host::Host;
    use crate::policies::load_balancing::{HostDistance, LoadBalancingPolicy, Plan, RoutingInfo};
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct RecordingPolicy {
        events: Mutex<Vec<String>>,
    }

    impl RecordingPolicy {
        fn record(&self, what: &str, host: &Host) {
            self.events
                .lock()
                .unwrap()
                .push(format!("{} {}", what, host.address.port()));
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl LoadBalancingPolicy for RecordingPolicy {
        fn host_up(&self, host: &Arc<Host>) {
            self.record("up", host);
        }
        fn host_down(&self, host: &Arc<Host>) {
            self.record("down", host);
        }
        fn host_found(&self, host: &Arc<Host>) {
            self.record("found", host);
        }
        fn host_lost(&self, host: &Arc<Host>) {
            self.record("lost", host);
        }
        fn distance(&self, _host: &Host) -> HostDistance {
            HostDistance::Local
        }
        fn plan<'a>(&'a self, _routing_info: &'a RoutingInfo<'a>) -> Plan<'a> {
            Box::new(std::iter::empty())
        }
        fn name(&self) -> String {
            "RecordingPolicy".to_owned()
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn notifications_follow_status_changes() {
        let registry = HostRegistry::new();
        let policy = Arc::new(RecordingPolicy::default());
        registry.add_listener(policy.clone());

        assert!(registry.host_found(Arc::new(Host::new(addr(1), None, None))));
        assert!(!registry.host_found(Arc::new(Host::new(addr(1), None, None))));
        assert_eq!(policy.take(), vec!["found 1", "up 1"]);

        // Repeated status reports do not produce events.
        assert!(registry.host_up(addr(1)).is_none());
        assert!(registry.host_down(addr(1)).is_some());
        assert!(registry.host_down(addr(1)).is_none());
        assert!(registry.host_up(addr(1)).is_some());
        assert_eq!(policy.take(), vec!["down 1", "up 1"]);

        assert!(registry.host_lost(addr(1)).is_some());
        assert!(registry.host_lost(addr(1)).is_none());
        assert_eq!(policy.take(), vec!["down 1", "lost 1"]);
        assert!(registry.hosts().is_empty());
    }

    #[test]
    fn late_listener_gets_replayed_state() {
        let registry = HostRegistry::new();
        registry.host_found(Arc::new(Host::new(addr(1), None, None)));
        registry.host_found(Arc::new(Host::new(addr(2), None, None)));
        registry.host_down(addr(2));

        let policy = Arc::new(RecordingPolicy::default());
        registry.add_listener(policy.clone());
        // Adding the same policy again must not replay twice.
        registry.add_listener(policy.clone());

        let mut events = policy.take();
        events.sort();
        assert_eq!(events, vec!["found 1", "found 2", "up 1"]);

        let as_dyn: Arc<dyn LoadBalancingPolicy> = policy.clone();
        registry.remove_listener(&as_dyn);
        registry.host_up(addr(2));
        assert!(policy.take().is_empty());
    }
}
