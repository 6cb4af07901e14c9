use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::{join_all, RemoteHandle};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::host::Host;
use super::node::ResolvedContactPoint;
use super::registry::HostRegistry;
use crate::errors::{ConnectionPoolError, RequestAttemptError, UseKeyspaceError};
use crate::network::{NodeConnectionPool, PoolConfig, PoolStateEvent, VerifiedKeyspaceName};

/// Cluster owns the known hosts and a connection pool for each of them.
///
/// Host status follows pool connectivity: a host is up while its pool has
/// at least one working connection. Status changes reach the load
/// balancing policies through the [`HostRegistry`].
pub(crate) struct Cluster {
    registry: Arc<HostRegistry>,
    pools: HashMap<SocketAddr, NodeConnectionPool>,

    _worker_handle: RemoteHandle<()>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("registry", &self.registry)
            .field("pools", &self.pools.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

// Works in the background to keep host statuses up to date.
struct ClusterWorker {
    registry: Arc<HostRegistry>,
    pool_state_receiver: mpsc::UnboundedReceiver<PoolStateEvent>,
}

impl Cluster {
    /// Registers the contact points, opens their pools and waits until
    /// every pool either connected or failed its first fill.
    pub(crate) async fn new(
        contact_points: Vec<ResolvedContactPoint>,
        pool_config: &PoolConfig,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Cluster {
        let registry = Arc::new(HostRegistry::new());
        // Unbounded so that pool refillers never block on a slow worker.
        let (pool_state_sender, pool_state_receiver) = mpsc::unbounded_channel();

        let mut pools = HashMap::with_capacity(contact_points.len());
        for point in contact_points {
            let host = Arc::new(Host::new(point.address, point.datacenter, point.rack));
            let pool = NodeConnectionPool::new(
                host.clone(),
                pool_config,
                keyspace.clone(),
                Some(pool_state_sender.clone()),
            );
            registry.host_found(host);
            pools.insert(point.address, pool);
        }

        join_all(pools.values().map(|pool| pool.wait_until_initialized())).await;
        for (address, pool) in pools.iter() {
            if !pool.is_connected() {
                debug!("Initial connection to {} failed, marking it down", address);
                registry.host_down(*address);
            }
        }

        let worker = ClusterWorker {
            registry: registry.clone(),
            pool_state_receiver,
        };
        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Cluster {
            registry,
            pools,
            _worker_handle: worker_handle,
        }
    }

    pub(crate) fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub(crate) fn pool(&self, address: &SocketAddr) -> Result<&NodeConnectionPool, ConnectionPoolError> {
        self.pools.get(address).ok_or(ConnectionPoolError::Missing)
    }

    pub(crate) fn has_connected_host(&self) -> bool {
        self.pools.values().any(NodeConnectionPool::is_connected)
    }

    /// Last connection error of every pool that is not connected.
    pub(crate) fn connection_errors(&self) -> HashMap<SocketAddr, ConnectionPoolError> {
        self.pools
            .iter()
            .filter_map(|(address, pool)| pool.connection().err().map(|err| (*address, err)))
            .collect()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let use_keyspace_futures = self
            .pools
            .values()
            .map(|pool| pool.use_keyspace(keyspace_name.clone()));
        let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> =
            join_all(use_keyspace_futures).await;

        use_keyspace_result(use_keyspace_results.into_iter())
    }
}

impl ClusterWorker {
    async fn work(mut self) {
        while let Some(event) = self.pool_state_receiver.recv().await {
            debug!("Received pool state event: {:?}", event);
            let changed = if event.connected {
                self.registry.host_up(event.address)
            } else {
                self.registry.host_down(event.address)
            };
            if changed.is_none() {
                debug!("Status of {} did not change", event.address);
            }
        }
        debug!("Pool state channel closed, stopping cluster worker");
    }
}

/// Returns a result of use_keyspace operation, based on the query results
/// returned from given node/connection.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    // If there was at least one Ok and the rest were broken connection errors we can return Ok
    // keyspace name is correct and will be used on broken connection on the next reconnect

    // If there were only broken connection errors then return broken connection error.
    // If there was an error different than broken connection error return this error - something is wrong

    let mut was_ok: bool = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(_)) => {
                    broken_conn_error = Some(err)
                }
                _ => return Err(err),
            },
        }
    }

    if was_ok {
        return Ok(());
    }

    // No results at all means there was nothing to switch.
    match broken_conn_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{use_keyspace_result, Cluster};
    use crate::cluster::node::ResolvedContactPoint;
    use crate::errors::{BrokenConnectionErrorKind, RequestAttemptError, UseKeyspaceError};
    use crate::network::{PoolConfig, VerifiedKeyspaceName};
    use crate::test_utils::{setup_tracing, MockServer};
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn broken() -> UseKeyspaceError {
        UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(
            BrokenConnectionErrorKind::Closed.into(),
        ))
    }

    #[test]
    fn use_keyspace_result_tolerates_broken_connections() {
        assert_matches!(use_keyspace_result(std::iter::empty()), Ok(()));
        assert_matches!(use_keyspace_result(vec![Ok(()), Err(broken())].into_iter()), Ok(()));
        assert_matches!(
            use_keyspace_result(vec![Err(broken()), Err(broken())].into_iter()),
            Err(UseKeyspaceError::RequestError(_))
        );
        assert_matches!(
            use_keyspace_result(
                vec![Ok(()), Err(UseKeyspaceError::RequestTimeout(Duration::from_secs(1)))]
                    .into_iter()
            ),
            Err(UseKeyspaceError::RequestTimeout(_))
        );
    }

    fn contact_point(server: &MockServer) -> ResolvedContactPoint {
        ResolvedContactPoint {
            address: server.address(),
            datacenter: None,
            rack: None,
        }
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn host_status_follows_pool_connectivity() {
        setup_tracing();
        let alive = MockServer::start().await;
        let dead = MockServer::start().await;
        let dead_point = contact_point(&dead);
        dead.stop();
        drop(dead);

        let cluster = Cluster::new(
            vec![contact_point(&alive), dead_point.clone()],
            &PoolConfig::default(),
            None,
        )
        .await;

        assert!(cluster.has_connected_host());
        let registry = cluster.registry();
        assert!(registry.get(&alive.address()).unwrap().is_up());
        assert!(!registry.get(&dead_point.address).unwrap().is_up());
        assert_eq!(cluster.connection_errors().len(), 1);

        let keyspace = VerifiedKeyspaceName::new("ks".to_owned(), false).unwrap();
        cluster.use_keyspace(keyspace).await.unwrap();

        alive.stop();
        for _ in 0..500 {
            if !registry.get(&alive.address()).unwrap().is_up() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.get(&alive.address()).unwrap().is_up());
    }
}
