//! Fluent configuration of a [`Session`](crate::Session).

use std::borrow::Borrow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::execution_profile::ExecutionProfileHandle;
use super::session::{Session, SessionConfig};
use super::{Compression, PoolSize};
use crate::authentication::{AuthenticatorProvider, PlainTextAuthenticator};
use crate::cluster::node::{ContactPoint, KnownNode};
use crate::errors::NewSessionError;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::routing::ReplicaLookup;

/// Collects [`SessionConfig`] options and connects.
///
/// # Example
///
/// ```rust,no_run
/// # use cassandra_driver::{Session, SessionBuilder};
/// # use cassandra_driver::client::Compression;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let session: Session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .compression(Some(Compression::Snappy))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    /// Builder holding [`SessionConfig::default`]: no known nodes, no
    /// compression, one connection per host.
    pub fn new() -> Self {
        SessionBuilder {
            config: SessionConfig::new(),
        }
    }

    /// Adds a contact point given as `host` or `host:port`. The port
    /// defaults to 9042. Hostnames are resolved when the session connects.
    /// # Examples
    /// ```rust,no_run
    /// # use cassandra_driver::{Session, SessionBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("db1.example.com")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node(mut self, hostname: impl AsRef<str>) -> Self {
        self.config.add_known_node(hostname);
        self
    }

    /// Adds a contact point given as a socket address.
    /// # Example
    /// ```rust,no_run
    /// # use cassandra_driver::{Session, SessionBuilder};
    /// # use std::net::{SocketAddr, IpAddr, Ipv4Addr};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 9042))
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node_addr(mut self, node_addr: SocketAddr) -> Self {
        self.config.add_known_node_addr(node_addr);
        self
    }

    /// [`known_node`](Self::known_node) for every item.
    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.config.add_known_nodes(hostnames);
        self
    }

    pub fn known_nodes_addr(
        mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) -> Self {
        self.config.add_known_nodes_addr(node_addrs);
        self
    }

    /// Add a known node together with the datacenter and rack it lives in.
    /// Datacenter aware load balancing relies on this information, as the
    /// session does not discover the topology by itself.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use cassandra_driver::{Session, SessionBuilder};
    /// # use cassandra_driver::cluster::KnownNode;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node_in_dc(KnownNode::Hostname("10.0.0.1".to_owned()), "eu-west", Some("rack1"))
    ///     .known_node_in_dc(KnownNode::Hostname("10.1.0.1".to_owned()), "us-east", None)
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn known_node_in_dc(
        mut self,
        node: KnownNode,
        datacenter: impl Into<String>,
        rack: Option<&str>,
    ) -> Self {
        self.config.known_nodes.push(ContactPoint {
            node,
            datacenter: Some(datacenter.into()),
            rack: rack.map(str::to_owned),
        });
        self
    }

    /// Answers authentication challenges with SASL PLAIN credentials when the
    /// server asks for it.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use cassandra_driver::{Session, SessionBuilder};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .user("cassandra", "cassandra")
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn user(mut self, username: impl Into<String>, passwd: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(PlainTextAuthenticator::new(
            username.into(),
            passwd.into(),
        )));
        self
    }

    /// Uses `authenticator_provider` for the SASL exchange of every connection.
    pub fn authenticator_provider(
        mut self,
        authenticator_provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(authenticator_provider);
        self
    }

    /// Compression to negotiate. Connections to a server that does not
    /// offer it fall back to uncompressed frames.
    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    /// Request bodies shorter than `threshold` bytes are sent uncompressed,
    /// even if compression was negotiated.
    pub fn compression_threshold(mut self, threshold: usize) -> Self {
        self.config.compression_threshold = threshold;
        self
    }

    /// Profile used by statements that do not carry their own handle.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use cassandra_driver::{ExecutionProfile, Session, SessionBuilder};
    /// # use cassandra_driver::statement::Consistency;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let execution_profile = ExecutionProfile::builder()
    ///     .consistency(Consistency::All)
    ///     .request_timeout(Some(std::time::Duration::from_secs(2)))
    ///     .build();
    /// let session: Session = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .default_execution_profile_handle(execution_profile.into_handle())
    ///     .build()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn default_execution_profile_handle(
        mut self,
        profile_handle: ExecutionProfileHandle,
    ) -> Self {
        self.config.default_execution_profile_handle = profile_handle;
        self
    }

    /// TCP_NODELAY on every socket, on by default.
    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    /// OS-level TCP keepalive, off by default. Unrelated to the protocol
    /// heartbeats of [`heartbeat_interval`](Self::heartbeat_interval).
    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        if interval <= Duration::from_secs(1) {
            tracing::warn!(
                "TCP keepalive interval {:?} is very short and will cost throughput; use more than 1 second",
                interval
            );
        }

        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    /// Keyspace every connection switches to before serving requests.
    /// See [`Session::use_keyspace`].
    pub fn use_keyspace(mut self, keyspace_name: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.used_keyspace = Some(keyspace_name.into());
        self.config.keyspace_case_sensitive = case_sensitive;
        self
    }

    /// Connects to the known nodes. Fails if none of them accepts a connection.
    pub async fn build(&self) -> Result<Session, NewSessionError> {
        Session::connect(self.config.clone()).await
    }

    /// Limit on the TCP connect and the handshake, 5 seconds by default.
    pub fn connection_timeout(mut self, duration: Duration) -> Self {
        self.config.connect_timeout = duration;
        self
    }

    /// Changes the timeout of resolving a known node's hostname.
    /// The default is 5 seconds. `None` waits as long as the resolver does.
    pub fn hostname_resolution_timeout(mut self, duration: Option<Duration>) -> Self {
        self.config.hostname_resolution_timeout = duration;
        self
    }

    /// Connections kept open to each host, one by default.
    ///
    /// # Example
    /// ```
    /// # use cassandra_driver::SessionBuilder;
    /// # use cassandra_driver::client::PoolSize;
    /// # use std::num::NonZeroUsize;
    /// let builder = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .pool_size(PoolSize::PerHost(NonZeroUsize::new(4).unwrap()));
    /// ```
    pub fn pool_size(mut self, size: PoolSize) -> Self {
        self.config.connection_pool_size = size;
        self
    }

    /// Sets after how long without writing anything a connection sends a
    /// heartbeat. `None` disables heartbeats.
    /// The default is 30 seconds.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Sets how long a connection waits for a heartbeat response
    /// before it gets closed. The default is 30 seconds.
    pub fn heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.config.heartbeat_timeout = timeout;
        self
    }

    /// Sets after how long without reading anything a connection is
    /// closed. `None` keeps idle connections open.
    /// The default is 60 seconds.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Sets the number of stream ids of each connection, which bounds
    /// how many requests a connection carries at once. Further requests
    /// wait for a free id. Must be between 128 and 32767, the default.
    pub fn max_streams(mut self, max_streams: usize) -> Self {
        self.config.max_streams = max_streams;
        self
    }

    /// Sets where the load balancing policies look up the replicas of a
    /// routing key. Needed for token aware routing to have any effect.
    pub fn replica_lookup(mut self, replica_lookup: Arc<dyn ReplicaLookup>) -> Self {
        self.config.replica_lookup = Some(replica_lookup);
        self
    }

    /// Sets how long a pool waits between failed attempts to connect to
    /// its host. The default is an
    /// [`ExponentialReconnectionPolicy`](crate::policies::reconnection::ExponentialReconnectionPolicy)
    /// going from 500 milliseconds up to 30 seconds.
    ///
    /// # Example
    /// ```
    /// # use cassandra_driver::SessionBuilder;
    /// # use cassandra_driver::policies::reconnection::ConstantReconnectionPolicy;
    /// # use std::sync::Arc;
    /// # use std::time::Duration;
    /// let builder = SessionBuilder::new()
    ///     .known_node("127.0.0.1:9042")
    ///     .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(Duration::from_secs(2))));
    /// ```
    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    /// Sets the generator of client-side timestamps, used for statements
    /// that do not set their own. Without one the server assigns write
    /// timestamps.
    pub fn timestamp_generator(mut self, generator: Arc<dyn TimestampGenerator>) -> Self {
        self.config.timestamp_generator = Some(generator);
        self
    }
}

/// Same as [`SessionBuilder::new`].
impl Default for SessionBuilder {
    fn default() -> Self {
        SessionBuilder::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Compression;
    use super::SessionBuilder;
    use crate::client::execution_profile::ExecutionProfile;
    use crate::cluster::node::{ContactPoint, KnownNode};
    use crate::errors::NewSessionError;
    use crate::frame::types::Consistency;
    use crate::policies::reconnection::ConstantReconnectionPolicy;
    use crate::policies::timestamp_generator::MonotonicTimestampGenerator;
    use crate::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn default_session_builder() {
        setup_tracing();
        let builder = SessionBuilder::new();

        assert!(builder.config.known_nodes.is_empty());
        assert_eq!(builder.config.compression, None);
        assert_eq!(builder.config.max_streams, 32767);
        assert!(builder.config.timestamp_generator.is_none());
        assert_eq!(
            builder.config.reconnection_policy.new_schedule().next_delay(),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn reconnection_and_timestamps() {
        setup_tracing();
        let builder = SessionBuilder::new()
            .reconnection_policy(Arc::new(ConstantReconnectionPolicy::new(
                Duration::from_secs(3),
            )))
            .timestamp_generator(Arc::new(MonotonicTimestampGenerator::new()));

        let mut schedule = builder.config.reconnection_policy.new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_secs(3));
        assert_eq!(schedule.next_delay(), Duration::from_secs(3));
        assert!(builder.config.timestamp_generator.is_some());
        assert!(format!("{:?}", builder.config).contains("ConstantReconnectionPolicy"));
    }

    #[test]
    fn add_known_nodes() {
        setup_tracing();
        let addr1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 3)), 1357);
        let addr2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(172, 17, 0, 4)), 9090);

        let builder = SessionBuilder::new()
            .known_node("test_hostname1")
            .known_nodes(["test_hostname2"])
            .known_node_addr(addr1)
            .known_nodes_addr([addr2]);

        assert_eq!(
            builder.config.known_nodes,
            vec![
                ContactPoint::from(KnownNode::Hostname("test_hostname1".into())),
                ContactPoint::from(KnownNode::Hostname("test_hostname2".into())),
                ContactPoint::from(KnownNode::Address(addr1)),
                ContactPoint::from(KnownNode::Address(addr2)),
            ]
        );
    }

    #[test]
    fn add_known_node_in_dc() {
        setup_tracing();
        let builder = SessionBuilder::new().known_node_in_dc(
            KnownNode::Hostname("10.0.0.1".into()),
            "dc1",
            Some("r1"),
        );

        assert_eq!(
            builder.config.known_nodes,
            vec![ContactPoint {
                node: KnownNode::Hostname("10.0.0.1".into()),
                datacenter: Some("dc1".to_owned()),
                rack: Some("r1".to_owned()),
            }]
        );
    }

    #[test]
    fn compression() {
        setup_tracing();
        let mut builder = SessionBuilder::new();
        assert_eq!(builder.config.compression, None);

        builder = builder.compression(Some(Compression::Lz4));
        assert_eq!(builder.config.compression, Some(Compression::Lz4));

        builder = builder.compression(Some(Compression::Snappy));
        assert_eq!(builder.config.compression, Some(Compression::Snappy));

        builder = builder.compression(None).compression_threshold(0);
        assert_eq!(builder.config.compression, None);
        assert_eq!(builder.config.compression_threshold, 0);
    }

    #[test]
    fn use_keyspace() {
        setup_tracing();
        let mut builder = SessionBuilder::new();
        assert_eq!(builder.config.used_keyspace, None);
        assert!(!builder.config.keyspace_case_sensitive);

        builder = builder.use_keyspace("ks_name_1", true);
        assert_eq!(builder.config.used_keyspace, Some("ks_name_1".to_string()));
        assert!(builder.config.keyspace_case_sensitive);

        builder = builder.use_keyspace("ks_name_2", false);
        assert_eq!(builder.config.used_keyspace, Some("ks_name_2".to_string()));
        assert!(!builder.config.keyspace_case_sensitive);
    }

    #[test]
    fn connection_settings() {
        setup_tracing();
        let builder = SessionBuilder::new()
            .connection_timeout(Duration::from_secs(10))
            .tcp_nodelay(false)
            .tcp_keepalive_interval(Duration::from_secs(42))
            .heartbeat_interval(None)
            .heartbeat_timeout(Duration::from_secs(3))
            .idle_timeout(Some(Duration::from_secs(120)))
            .max_streams(1024);

        let config = &builder.config;
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(!config.tcp_nodelay);
        assert_eq!(config.tcp_keepalive_interval, Some(Duration::from_secs(42)));
        assert_eq!(config.heartbeat_interval, None);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.max_streams, 1024);
    }

    #[test]
    fn execution_profile() {
        setup_tracing();
        let execution_profile = ExecutionProfile::builder()
            .consistency(Consistency::All)
            .build();
        let builder = SessionBuilder::new()
            .default_execution_profile_handle(execution_profile.into_handle());

        assert_eq!(
            builder
                .config
                .default_execution_profile_handle
                .access()
                .consistency,
            Consistency::All
        );
    }

    #[tokio::test]
    async fn build_rejects_bad_configuration() {
        setup_tracing();
        assert_matches!(
            SessionBuilder::new().build().await,
            Err(NewSessionError::EmptyKnownNodesList)
        );
        assert_matches!(
            SessionBuilder::new()
                .known_node("127.0.0.1:9042")
                .max_streams(100)
                .build()
                .await,
            Err(NewSessionError::InvalidArgument(_))
        );
    }
}
