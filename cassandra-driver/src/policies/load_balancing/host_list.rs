use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;

use crate::cluster::host::Host;

/// Copy-on-write list of hosts.
///
/// Writers are serialized by a lock and publish a new vector; readers take
/// a snapshot without locking.
#[derive(Debug)]
pub(super) struct HostList {
    hosts: ArcSwap<Vec<Arc<Host>>>,
    update_lock: Mutex<()>,
}

impl HostList {
    pub(super) fn new() -> Self {
        Self {
            hosts: ArcSwap::from_pointee(Vec::new()),
            update_lock: Mutex::new(()),
        }
    }

    /// Adds the host unless it is already present or the list already
    /// holds `cap` hosts. Returns whether the host was added.
    pub(super) fn insert(&self, host: &Arc<Host>, cap: Option<usize>) -> bool {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let hosts = self.hosts.load();
        if hosts.contains(host) || cap.is_some_and(|cap| hosts.len() >= cap) {
            return false;
        }
        let mut new_hosts = Vec::with_capacity(hosts.len() + 1);
        new_hosts.extend(hosts.iter().cloned());
        new_hosts.push(host.clone());
        self.hosts.store(Arc::new(new_hosts));
        true
    }

    pub(super) fn remove(&self, host: &Host) -> bool {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let hosts = self.hosts.load();
        if !hosts.iter().any(|h| **h == *host) {
            return false;
        }
        let new_hosts: Vec<_> = hosts.iter().filter(|h| ***h != *host).cloned().collect();
        self.hosts.store(Arc::new(new_hosts));
        true
    }

    pub(super) fn contains(&self, host: &Host) -> bool {
        self.hosts.load().iter().any(|h| **h == *host)
    }

    pub(super) fn snapshot(&self) -> Arc<Vec<Arc<Host>>> {
        self.hosts.load_full()
    }
}

/// Rotation cursor shared by all plans of a policy.
#[derive(Debug, Default)]
pub(super) struct Cursor(AtomicUsize);

impl Cursor {
    /// Returns the current position and advances it by one, modulo `total`.
    pub(super) fn advance(&self, total: usize) -> usize {
        if total == 0 {
            return 0;
        }
        let previous = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |position| {
                Some((position + 1) % total)
            })
            .unwrap_or_else(|position| position);
        previous % total
    }
}
