//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and executes CQL statements.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::future::join_all;
use tracing::{debug, trace, trace_span, Instrument};

use super::execution_profile::{ExecutionProfile, ExecutionProfileHandle};
use super::{Compression, PoolSize};
use crate::authentication::AuthenticatorProvider;
use crate::cluster::host::Host;
use crate::cluster::node::{resolve_contact_points, ContactPoint, KnownNode};
use crate::cluster::Cluster;
use crate::errors::{
    DbError, ExecutionError, NewSessionError, NoHostsAvailableError, RequestAttemptError,
    RequestError, UseKeyspaceError,
};
use crate::frame::response::{result, NonErrorResponse};
use crate::frame::types::{Consistency, SerialConsistency};
use crate::network::{ConnectionConfig, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{self, RetryDecision, RetryPolicy};
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::response::query_result::{ExecutionInfo, QueryResult};
use crate::response::{NonErrorQueryResponse, QueryResponse};
use crate::routing::ReplicaLookup;
use crate::statement::Statement;

/// `Session` manages connections to the cluster and executes CQL statements.
pub struct Session {
    cluster: Cluster,
    default_execution_profile_handle: ExecutionProfileHandle,
    replica_lookup: Option<Arc<dyn ReplicaLookup>>,
    keyspace_name: ArcSwapOption<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cluster", &self.cluster)
            .field(
                "default_execution_profile_handle",
                &self.default_execution_profile_handle,
            )
            .field("replica_lookup", &self.replica_lookup)
            .field("keyspace_name", &self.keyspace_name)
            .finish()
    }
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup, with the
    /// datacenter and rack they live in, if known.
    /// The session connects to exactly these nodes.
    pub known_nodes: Vec<ContactPoint>,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,
    /// Request bodies shorter than this many bytes are sent uncompressed.
    pub compression_threshold: usize,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,
    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Timeout for establishing connections to a node.
    pub connect_timeout: Duration,
    /// Timeout of a single DNS lookup of a known node.
    pub hostname_resolution_timeout: Option<Duration>,

    /// A heartbeat is sent on a connection that wrote nothing for this long.
    /// If `None`, heartbeats are never sent.
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for a heartbeat response before closing the connection.
    pub heartbeat_timeout: Duration,
    /// A connection that read nothing for this long is closed.
    pub idle_timeout: Option<Duration>,
    /// Size of the stream id table of each connection, between 128 and 32767.
    pub max_streams: usize,

    /// Size of the per-node connection pool.
    pub connection_pool_size: PoolSize,
    /// Decides how long a pool waits between failed attempts to connect
    /// to its host.
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,

    /// Handle to the default execution profile, which is used
    /// for all statements that do not specify an execution profile.
    pub default_execution_profile_handle: ExecutionProfileHandle,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::use_keyspace`].
    pub used_keyspace: Option<String>,
    /// Whether the keyspace name is case-sensitive.
    /// If it is, the name is sent enclosed in double quotes.
    pub keyspace_case_sensitive: bool,

    /// Custom authenticator provider to create an authenticator instance
    /// upon session creation.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Source of replica placement, handed to the load balancing policies.
    /// Without it token aware routing falls back to the wrapped policy.
    pub replica_lookup: Option<Arc<dyn ReplicaLookup>>,

    /// Generates timestamps for statements that have none.
    /// If `None`, the server assigns the write timestamp.
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("known_nodes", &self.known_nodes)
            .field("compression", &self.compression)
            .field("compression_threshold", &self.compression_threshold)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field(
                "hostname_resolution_timeout",
                &self.hostname_resolution_timeout,
            )
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_streams", &self.max_streams)
            .field("connection_pool_size", &self.connection_pool_size)
            .field("reconnection_policy", &self.reconnection_policy)
            .field(
                "default_execution_profile_handle",
                &self.default_execution_profile_handle,
            )
            .field("used_keyspace", &self.used_keyspace)
            .field("keyspace_case_sensitive", &self.keyspace_case_sensitive)
            .field("authenticator", &self.authenticator.as_ref().map(|_| "..."))
            .field("replica_lookup", &self.replica_lookup)
            .field(
                "timestamp_generator",
                &self.timestamp_generator.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Pool size: one connection per host
    /// * Connect timeout: 5 seconds
    /// * Heartbeat: every 30 seconds of write inactivity
    /// * Reconnection: exponential, from 500 milliseconds up to 30 seconds
    ///
    /// # Example
    /// ```
    /// # use cassandra_driver::SessionConfig;
    /// let config = SessionConfig::new();
    /// ```
    pub fn new() -> Self {
        let connection_defaults = ConnectionConfig::default();
        SessionConfig {
            known_nodes: Vec::new(),
            compression: connection_defaults.compression,
            compression_threshold: connection_defaults.compression_threshold,
            tcp_nodelay: connection_defaults.tcp_nodelay,
            tcp_keepalive_interval: connection_defaults.tcp_keepalive_interval,
            connect_timeout: connection_defaults.connect_timeout,
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            heartbeat_interval: connection_defaults.heartbeat_interval,
            heartbeat_timeout: connection_defaults.heartbeat_timeout,
            idle_timeout: connection_defaults.idle_timeout,
            max_streams: connection_defaults.max_streams,
            connection_pool_size: Default::default(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            default_execution_profile_handle: ExecutionProfile::default().into_handle(),
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            replica_lookup: None,
            timestamp_generator: None,
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    /// # Example
    /// ```
    /// # use cassandra_driver::SessionConfig;
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1");
    /// config.add_known_node("db1.example.com:9042");
    /// ```
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_owned()).into());
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr).into());
    }

    /// Adds a list of known database server with hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    /// Adds a list of known database servers with IP addresses
    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            compression_threshold: self.compression_threshold,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            authenticator: self.authenticator.clone(),
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
            idle_timeout: self.idle_timeout,
            max_streams: self.max_streams,
            event_types: Vec::new(),
            timestamp_generator: self.timestamp_generator.clone(),
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) enum RunRequestResult<ResT> {
    IgnoredWriteError,
    Completed(ResT),
}

// What the orchestrator does after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    RetrySameHost(Consistency),
    NextHost,
    // Like NextHost, but the error is the verdict if the plan runs out.
    Reraise,
    Ignore,
    Surface,
}

impl Session {
    /// Estabilishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](crate::SessionBuilder)
    /// instead of calling `Session::connect` directly, because it's more convenient.
    /// # Arguments
    /// * `config` - Connection configuration - known nodes, Compression, etc.
    ///   Must contain at least one known node.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use std::error::Error;
    /// # async fn check_only_compiles() -> Result<(), Box<dyn Error>> {
    /// use cassandra_driver::{Session, SessionConfig};
    ///
    /// let mut config = SessionConfig::new();
    /// config.add_known_node("127.0.0.1:9042");
    ///
    /// let session: Session = Session::connect(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(config: SessionConfig) -> Result<Self, NewSessionError> {
        // Ensure there is at least one known node
        if config.known_nodes.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let connection_config = config.connection_config();
        connection_config.validate()?;

        let (contact_points, failed_hostnames) =
            resolve_contact_points(&config.known_nodes, config.hostname_resolution_timeout).await;
        if contact_points.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(
                failed_hostnames,
            ));
        }

        let pool_config = PoolConfig {
            connection_config,
            pool_size: config.connection_pool_size,
            reconnection_policy: config.reconnection_policy,
        };

        let cluster = Cluster::new(contact_points, &pool_config, None).await;
        if !cluster.has_connected_host() {
            let errors = cluster
                .connection_errors()
                .into_iter()
                .map(|(address, error)| (address, RequestError::from(error)))
                .collect();
            return Err(NewSessionError::NoConnectedHost(NoHostsAvailableError::new(
                errors,
            )));
        }

        let session = Self {
            cluster,
            default_execution_profile_handle: config.default_execution_profile_handle,
            replica_lookup: config.replica_lookup,
            keyspace_name: ArcSwapOption::empty(), // will be set by use_keyspace
        };
        session.register_load_balancing_policy(
            &session
                .default_execution_profile_handle
                .access()
                .load_balancing_policy,
        );

        if let Some(keyspace_name) = config.used_keyspace {
            session
                .use_keyspace(keyspace_name, config.keyspace_case_sensitive)
                .await?;
        }

        Ok(session)
    }

    /// Executes a statement and waits for its result.
    ///
    /// Hosts are tried in the order given by the load balancing policy of
    /// the statement's execution profile (or of the session default one).
    /// Failures are retried according to the retry policy, see
    /// [`RetryPolicy`] for the decisions it takes.
    ///
    /// # Example
    /// ```rust,no_run
    /// # use cassandra_driver::Session;
    /// # use std::error::Error;
    /// # async fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
    /// use cassandra_driver::statement::{Consistency, Statement};
    ///
    /// let mut statement = Statement::new("SELECT a FROM ks.tab");
    /// statement.set_consistency(Consistency::One);
    ///
    /// let result = session.execute(&statement).await?;
    /// if let Some(rows) = result.raw_rows() {
    ///     println!("{} columns", rows.col_count);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute(&self, statement: &Statement) -> Result<QueryResult, ExecutionError> {
        let execution_profile = statement
            .get_execution_profile_handle()
            .unwrap_or_else(|| self.get_default_execution_profile_handle())
            .access();

        let consistency = statement
            .config
            .determine_consistency(execution_profile.consistency);
        let serial_consistency = statement
            .config
            .serial_consistency
            .unwrap_or(execution_profile.serial_consistency);

        let session_keyspace = self.keyspace_name.load_full();
        let routing_info = RoutingInfo {
            consistency,
            serial_consistency,
            keyspace: statement
                .get_keyspace()
                .or(session_keyspace.as_deref().map(String::as_str)),
            routing_key: statement.get_routing_key(),
        };

        let load_balancer = statement
            .get_load_balancing_policy()
            .unwrap_or(&execution_profile.load_balancing_policy);
        self.register_load_balancing_policy(load_balancer);

        let retry_policy = statement
            .get_retry_policy()
            .unwrap_or(&execution_profile.retry_policy);

        let request_timeout = statement
            .get_request_timeout()
            .or(execution_profile.request_timeout);
        let attempt_timeout = statement
            .get_attempt_timeout()
            .unwrap_or(execution_profile.attempt_timeout);

        let runner = async {
            let request_plan = load_balancer.plan(&routing_info);
            self.run_request(
                request_plan,
                statement,
                retry_policy.as_ref(),
                consistency,
                serial_consistency,
                attempt_timeout,
            )
            .await
        };

        let (run_request_result, execution_info) = match request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, runner).await.unwrap_or_else(
                |_: tokio::time::error::Elapsed| {
                    debug!(?timeout, "Request timed out");
                    Err(ExecutionError::RequestTimeout(timeout))
                },
            ),
            None => runner.await,
        }?;

        let response = match run_request_result {
            RunRequestResult::IgnoredWriteError => {
                return Ok(QueryResult::mock_empty(execution_info))
            }
            RunRequestResult::Completed(response) => response,
        };

        let result = match response.response {
            NonErrorResponse::Result(result) => result,
            other => {
                return Err(ExecutionError::LastAttemptError(
                    RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
                ))
            }
        };

        // Automatically handle meaningful responses.
        if let result::Result::SetKeyspace(set_keyspace) = &result {
            debug!(
                "Detected USE KEYSPACE query, setting session's keyspace to {}",
                set_keyspace.keyspace_name
            );
            self.use_keyspace(set_keyspace.keyspace_name.clone(), true)
                .await?;
        }

        Ok(QueryResult::new(
            result,
            response.tracing_id,
            response.warnings,
            execution_info,
        ))
    }

    /// Walks the plan, sending the statement to one host at a time.
    ///
    /// Every retrying decision (on the same host or the next one) bumps a
    /// single retry counter which the retry policy gets to see.
    /// `attempt_timeout` bounds each attempt separately, so a host that
    /// does not answer can be left for the next one.
    async fn run_request(
        &self,
        request_plan: Plan<'_>,
        statement: &Statement,
        retry_policy: &dyn RetryPolicy,
        mut current_consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        attempt_timeout: Option<Duration>,
    ) -> Result<(RunRequestResult<NonErrorQueryResponse>, ExecutionInfo), ExecutionError> {
        let is_idempotent = statement.get_is_idempotent();
        let mut errors: HashMap<SocketAddr, RequestError> = HashMap::new();
        let mut attempted_hosts: Vec<Arc<Host>> = Vec::new();
        let mut retry_count: usize = 0;
        let mut last_reraised: Option<RequestAttemptError> = None;

        'nodes_in_plan: for host in request_plan {
            let span = trace_span!("Executing request", host = %host.address);
            let mut sent_to_host = false;
            'same_node_retries: loop {
                trace!(parent: &span, "Execution started");
                let connection = match self
                    .cluster
                    .pool(&host.address)
                    .and_then(|pool| pool.connection())
                {
                    Ok(connection) => connection,
                    Err(e) => {
                        trace!(
                            parent: &span,
                            error = %e,
                            "Choosing connection failed"
                        );
                        errors.insert(host.address, e.into());
                        continue 'nodes_in_plan;
                    }
                };

                if !sent_to_host {
                    sent_to_host = true;
                    attempted_hosts.push(host.clone());
                }
                trace!(
                    parent: &span,
                    connection = %connection.get_connect_address(),
                    consistency = %current_consistency,
                    "Sending"
                );
                let request_result: Result<NonErrorQueryResponse, RequestAttemptError> =
                    connection
                        .query(
                            statement,
                            current_consistency,
                            serial_consistency,
                            attempt_timeout,
                        )
                        .instrument(span.clone())
                        .await
                        .and_then(QueryResponse::into_non_error_query_response);

                let request_error: RequestAttemptError = match request_result {
                    Ok(response) => {
                        trace!(parent: &span, "Request succeeded");
                        let execution_info =
                            ExecutionInfo::new(attempted_hosts, retry_count, current_consistency);
                        return Ok((RunRequestResult::Completed(response), execution_info));
                    }
                    Err(e) => {
                        trace!(
                            parent: &span,
                            last_error = %e,
                            "Request failed"
                        );
                        e
                    }
                };

                let outcome = evaluate_failure(
                    retry_policy,
                    statement,
                    &request_error,
                    is_idempotent,
                    retry_count,
                );
                trace!(parent: &span, outcome = ?outcome);

                match outcome {
                    AttemptOutcome::RetrySameHost(new_cl) => {
                        retry_count += 1;
                        current_consistency = new_cl;
                        errors.insert(host.address, request_error.into());
                        continue 'same_node_retries;
                    }
                    AttemptOutcome::Reraise => {
                        retry_count += 1;
                        last_reraised = Some(request_error.clone());
                        errors.insert(host.address, request_error.into());
                        continue 'nodes_in_plan;
                    }
                    AttemptOutcome::NextHost => {
                        errors.insert(host.address, request_error.into());
                        continue 'nodes_in_plan;
                    }
                    AttemptOutcome::Ignore => {
                        let execution_info =
                            ExecutionInfo::new(attempted_hosts, retry_count, current_consistency);
                        return Ok((RunRequestResult::IgnoredWriteError, execution_info));
                    }
                    AttemptOutcome::Surface => {
                        return Err(ExecutionError::LastAttemptError(request_error));
                    }
                }
            }
        }

        match last_reraised {
            Some(error) => Err(ExecutionError::LastAttemptError(error)),
            None => Err(ExecutionError::NoHostsAvailable(NoHostsAvailableError::new(
                errors,
            ))),
        }
    }

    /// Sends `USE <keyspace_name>` request on all connections\
    /// This allows to write `SELECT * FROM table` instead of `SELECT * FROM keyspace.table`\
    ///
    /// Note that even failed `use_keyspace` can change currently used keyspace - the request is sent on all connections and
    /// can overwrite previously used keyspace.
    ///
    /// Call only one `use_keyspace` at a time.\
    /// Trying to do two `use_keyspace` requests simultaneously with different names
    /// can end with some connections using one keyspace and the rest using the other.
    ///
    /// # Arguments
    ///
    /// * `keyspace_name` - keyspace name to use,
    ///   keyspace names can have up to 48 alphanumeric characters and contain underscores
    /// * `case_sensitive` - if set to true the generated request will put keyspace name in quotes
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let keyspace_name = keyspace_name.into();

        // Trying to pass keyspace as bound value in "USE ?" doesn't work
        // So we have to create a string for query: "USE " + new_keyspace
        // To avoid any possible CQL injections it's good to verify that the name is valid
        let verified_ks_name = VerifiedKeyspaceName::new(keyspace_name.clone(), case_sensitive)?;
        self.keyspace_name.store(Some(Arc::new(keyspace_name)));

        self.cluster.use_keyspace(verified_ks_name).await?;

        Ok(())
    }

    /// Gets the name of the keyspace that is currently set, or `None` if no
    /// keyspace was set.
    ///
    /// Note: the return value might be wrong if `use_keyspace` was called
    /// concurrently or it previously failed.
    #[inline]
    pub fn get_keyspace(&self) -> Option<Arc<String>> {
        self.keyspace_name.load_full()
    }

    /// Retrieves the handle to execution profile that is used by this session
    /// by default, i.e. when an executed statement does not define its own handle.
    pub fn get_default_execution_profile_handle(&self) -> &ExecutionProfileHandle {
        &self.default_execution_profile_handle
    }

    /// Snapshot of the hosts known to the session, with their current status.
    pub fn get_hosts(&self) -> Vec<Arc<Host>> {
        self.cluster.registry().hosts()
    }

    /// Waits for every pool to finish its current fill. Useful after
    /// hosts came back, before asserting on their status.
    pub async fn await_pools_initialized(&self) {
        join_all(
            self.get_hosts()
                .iter()
                .filter_map(|host| self.cluster.pool(&host.address).ok())
                .map(|pool| pool.wait_until_initialized()),
        )
        .await;
    }

    // Profiles can be remapped at any time, so policies are registered on
    // first use rather than on handle creation.
    fn register_load_balancing_policy(&self, policy: &Arc<dyn LoadBalancingPolicy>) {
        if self.cluster.registry().add_listener(policy.clone()) {
            if let Some(replica_lookup) = &self.replica_lookup {
                policy.setup(replica_lookup.clone());
            }
        }
    }
}

/// Decides what happens after an attempt failed with `error`.
fn evaluate_failure(
    retry_policy: &dyn RetryPolicy,
    statement: &Statement,
    error: &RequestAttemptError,
    is_idempotent: bool,
    retry_count: usize,
) -> AttemptOutcome {
    match error {
        RequestAttemptError::DbError(db_error, _) => {
            let Some(decision) = retry::decide(retry_policy, statement, db_error, retry_count)
            else {
                return match db_error {
                    DbError::Overloaded
                    | DbError::ServerError
                    | DbError::IsBootstrapping
                    | DbError::TruncateError => AttemptOutcome::NextHost,
                    _ => AttemptOutcome::Surface,
                };
            };

            // Sending a write again is only safe if it is idempotent.
            let unsafe_write = matches!(db_error, DbError::WriteTimeout { .. }) && !is_idempotent;
            match decision {
                RetryDecision::Retry(_) | RetryDecision::Reraise if unsafe_write => {
                    AttemptOutcome::Surface
                }
                RetryDecision::Retry(consistency) => AttemptOutcome::RetrySameHost(consistency),
                RetryDecision::Reraise => AttemptOutcome::Reraise,
                RetryDecision::Ignore => AttemptOutcome::Ignore,
            }
        }
        RequestAttemptError::BrokenConnectionError(_) | RequestAttemptError::NotConnected => {
            AttemptOutcome::NextHost
        }
        RequestAttemptError::Timeout(_) if is_idempotent => AttemptOutcome::NextHost,
        _ => AttemptOutcome::Surface,
    }
}

#[cfg(test)]
mod tests {
    use super::{evaluate_failure, AttemptOutcome};
    use crate::errors::{BrokenConnectionErrorKind, DbError, RequestAttemptError, WriteType};
    use crate::frame::types::Consistency;
    use crate::policies::retry::{DefaultRetryPolicy, DowngradingConsistencyRetryPolicy};
    use crate::statement::Statement;
    use std::time::Duration;

    fn db_error(error: DbError) -> RequestAttemptError {
        RequestAttemptError::DbError(error, String::new())
    }

    fn write_timeout(write_type: WriteType) -> RequestAttemptError {
        db_error(DbError::WriteTimeout {
            consistency: Consistency::Two,
            received: 1,
            required: 2,
            write_type,
        })
    }

    #[test]
    fn server_errors_are_classified() {
        let policy = DefaultRetryPolicy::new();
        let statement = Statement::new("SELECT * FROM ks.t");
        let outcome = |error: RequestAttemptError| {
            evaluate_failure(&policy, &statement, &error, false, 0)
        };

        for error in [
            DbError::Overloaded,
            DbError::ServerError,
            DbError::IsBootstrapping,
            DbError::TruncateError,
        ] {
            assert_eq!(outcome(db_error(error)), AttemptOutcome::NextHost);
        }
        for error in [DbError::SyntaxError, DbError::Invalid, DbError::Unauthorized] {
            assert_eq!(outcome(db_error(error)), AttemptOutcome::Surface);
        }
        assert_eq!(
            outcome(db_error(DbError::ReadTimeout {
                consistency: Consistency::Quorum,
                received: 2,
                required: 2,
                data_present: false,
            })),
            AttemptOutcome::RetrySameHost(Consistency::Quorum)
        );
        assert_eq!(
            outcome(db_error(DbError::Unavailable {
                consistency: Consistency::Quorum,
                required: 2,
                alive: 1,
            })),
            AttemptOutcome::Reraise
        );
    }

    #[test]
    fn connection_errors_move_to_next_host() {
        let policy = DefaultRetryPolicy::new();
        let statement = Statement::new("SELECT * FROM ks.t");

        let broken = RequestAttemptError::BrokenConnectionError(
            BrokenConnectionErrorKind::Closed.into(),
        );
        assert_eq!(
            evaluate_failure(&policy, &statement, &broken, false, 0),
            AttemptOutcome::NextHost
        );
        assert_eq!(
            evaluate_failure(&policy, &statement, &RequestAttemptError::NotConnected, false, 3),
            AttemptOutcome::NextHost
        );

        // A timed out request may still be applied, so only idempotent
        // statements move on.
        let timeout = RequestAttemptError::Timeout(Duration::from_millis(10));
        assert_eq!(
            evaluate_failure(&policy, &statement, &timeout, false, 0),
            AttemptOutcome::Surface
        );
        assert_eq!(
            evaluate_failure(&policy, &statement, &timeout, true, 0),
            AttemptOutcome::NextHost
        );
    }

    #[test]
    fn non_idempotent_writes_are_not_sent_again() {
        let policy = DowngradingConsistencyRetryPolicy::new();
        let statement = Statement::new("INSERT INTO ks.t (a) VALUES (1)");

        let unlogged = write_timeout(WriteType::UnloggedBatch);
        assert_eq!(
            evaluate_failure(&policy, &statement, &unlogged, false, 0),
            AttemptOutcome::Surface
        );
        assert_eq!(
            evaluate_failure(&policy, &statement, &unlogged, true, 0),
            AttemptOutcome::RetrySameHost(Consistency::One)
        );

        let counter = write_timeout(WriteType::Counter);
        assert_eq!(
            evaluate_failure(&policy, &statement, &counter, false, 0),
            AttemptOutcome::Surface
        );
        assert_eq!(
            evaluate_failure(&policy, &statement, &counter, true, 0),
            AttemptOutcome::Reraise
        );

        // Ignoring does not send anything, so idempotence does not matter.
        let simple = write_timeout(WriteType::Simple);
        assert_eq!(
            evaluate_failure(&policy, &statement, &simple, false, 0),
            AttemptOutcome::Ignore
        );
    }
}
