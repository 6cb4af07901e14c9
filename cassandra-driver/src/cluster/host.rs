use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

/// A database node known to the session.
///
/// Identity is the socket address: two `Host`s compare equal (and hash
/// the same) iff they share an address. The up/down status is the only
/// mutable part and is driven by the
/// [`HostRegistry`](crate::cluster::registry::HostRegistry).
#[derive(Debug)]
pub struct Host {
    pub address: SocketAddr,
    pub host_id: Option<Uuid>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
    pub release_version: Option<String>,

    up: AtomicBool,
}

impl Host {
    /// Creates a host that is considered up.
    pub fn new(address: SocketAddr, datacenter: Option<String>, rack: Option<String>) -> Self {
        Self {
            address,
            host_id: None,
            datacenter,
            rack,
            release_version: None,
            up: AtomicBool::new(true),
        }
    }

    pub fn with_host_id(mut self, host_id: Uuid) -> Self {
        self.host_id = Some(host_id);
        self
    }

    pub fn with_release_version(mut self, release_version: impl Into<String>) -> Self {
        self.release_version = Some(release_version.into());
        self
    }

    /// IP address of the host, without the port.
    pub fn ip(&self) -> IpAddr {
        self.address.ip()
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Sets the status and returns the previous one.
    pub(crate) fn set_up(&self, up: bool) -> bool {
        self.up.swap(up, Ordering::AcqRel)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

impl Hash for Host {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.datacenter {
            Some(dc) => write!(f, "{} (dc: {})", self.address, dc),
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Host;
    use std::collections::HashSet;

    #[test]
    fn identity_is_the_address() {
        let a = Host::new("10.0.0.1:9042".parse().unwrap(), Some("dc1".into()), None);
        let b = Host::new("10.0.0.1:9042".parse().unwrap(), Some("dc2".into()), None);
        let c = Host::new("10.0.0.1:9043".parse().unwrap(), Some("dc1".into()), None);

        assert_eq!(a, b);
        assert_ne!(a, c);
        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn status_swap_reports_previous() {
        let host = Host::new("10.0.0.1:9042".parse().unwrap(), None, None);
        assert!(host.is_up());
        assert!(host.set_up(false));
        assert!(!host.set_up(false));
        assert!(!host.is_up());
    }
}
