use std::net::SocketAddr;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;

/// Port used when a known node is given without one.
pub const DEFAULT_PORT: u16 = 9042;

/// Describes a database server known on `Session` startup.
///
/// The name derives from SessionBuilder's `known_node()` family of methods.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by its hostname.
    Hostname(String),
    /// A node identified by its IP address + a port.
    Address(SocketAddr),
}

/// A known node together with its location in the cluster.
///
/// The session does not discover the topology, so the datacenter and rack
/// of a node are whatever the user declared here.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ContactPoint {
    pub node: KnownNode,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

impl From<KnownNode> for ContactPoint {
    fn from(node: KnownNode) -> Self {
        Self {
            node,
            datacenter: None,
            rack: None,
        }
    }
}

/// Describes a database server known on Session startup, with already resolved address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResolvedContactPoint {
    pub(crate) address: SocketAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Performs a DNS lookup with provided optional timeout.
async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            // Elapsed error from tokio library does not provide any context.
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

// Resolve the given hostname using a DNS lookup if necessary.
// The resolution may return multiple IPs and the function returns one of them.
// It prefers to return IPv4s first, and only if there are none, IPv6s.
pub(crate) async fn resolve_hostname(
    hostname: &str,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    // "hostname" without a port is rejected by `lookup_host` right away,
    // so such names are retried with the default port.
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        // Use a default port in case of error, but propagate the original error on failure
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, DEFAULT_PORT), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Resolves every contact point. Hostnames that fail to resolve are
/// logged and returned in the second vector.
pub(crate) async fn resolve_contact_points(
    contact_points: &[ContactPoint],
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<ResolvedContactPoint>, Vec<String>) {
    let resolve_futures = contact_points.iter().map(|point| async move {
        let address = match &point.node {
            KnownNode::Address(address) => Ok(*address),
            KnownNode::Hostname(hostname) => {
                resolve_hostname(hostname, hostname_resolution_timeout)
                    .await
                    .map_err(|e| {
                        warn!("Hostname resolution failed for {}: {}", hostname, &e);
                        hostname.clone()
                    })
            }
        };
        address.map(|address| ResolvedContactPoint {
            address,
            datacenter: point.datacenter.clone(),
            rack: point.rack.clone(),
        })
    });

    let mut resolved = Vec::with_capacity(contact_points.len());
    let mut failed = Vec::new();
    for result in futures::future::join_all(resolve_futures).await {
        match result {
            Ok(point) => {
                // The same node given twice would get two pools.
                if !resolved
                    .iter()
                    .any(|other: &ResolvedContactPoint| other.address == point.address)
                {
                    resolved.push(point);
                }
            }
            Err(hostname) => failed.push(hostname),
        }
    }
    (resolved, failed)
}

#[cfg(test)]
mod tests {
    use super::{resolve_contact_points, resolve_hostname, ContactPoint, KnownNode};
    use std::net::SocketAddr;

    #[tokio::test]
    async fn resolves_addresses_and_hostnames() {
        let addr: SocketAddr = "127.0.0.1:19042".parse().unwrap();
        let points = vec![
            ContactPoint {
                node: KnownNode::Address(addr),
                datacenter: Some("dc1".to_owned()),
                rack: None,
            },
            ContactPoint::from(KnownNode::Hostname("127.0.0.1:19042".to_owned())),
            ContactPoint::from(KnownNode::Hostname("127.0.0.2".to_owned())),
        ];

        let (resolved, failed) = resolve_contact_points(&points, None).await;
        assert!(failed.is_empty());
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].address, addr);
        assert_eq!(resolved[0].datacenter.as_deref(), Some("dc1"));
        assert_eq!(resolved[1].address, "127.0.0.2:9042".parse().unwrap());
    }

    #[tokio::test]
    async fn default_port_is_used() {
        let addr = resolve_hostname("127.0.0.1", None).await.unwrap();
        assert_eq!(addr.port(), 9042);
    }
}
