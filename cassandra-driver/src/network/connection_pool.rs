use super::connection::{open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName};

use crate::cluster::host::Host;
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, RequestAttemptError,
    UseKeyspaceError,
};
use crate::policies::reconnection::{
    ExponentialReconnectionPolicy, ReconnectionPolicy, ReconnectionSchedule,
};

use arc_swap::ArcSwap;
use futures::{future::RemoteHandle, stream::FuturesUnordered, Future, FutureExt, StreamExt};
use itertools::Itertools;
use rand::Rng;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

/// The target size of a per-host connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolSize {
    /// Indicates that the pool should establish given number of connections to the host.
    PerHost(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::PerHost(NonZeroUsize::MIN)
    }
}

impl PoolSize {
    fn target(&self) -> usize {
        match self {
            PoolSize::PerHost(target) => target.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) pool_size: PoolSize,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: Default::default(),
            pool_size: Default::default(),
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
        }
    }
}

/// Emitted when a pool gains its first connection or loses its last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PoolStateEvent {
    pub(crate) address: SocketAddr,
    pub(crate) connected: bool,
}

enum PoolConnections {
    /// First fill still in progress.
    Filling,

    /// No connections; the refiller keeps trying. Holds the most recent
    /// connect error.
    Broken(ConnectionError),

    /// Never empty.
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for PoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolConnections::Filling => write!(f, "Filling"),
            PoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            PoolConnections::Ready(conns) => {
                write!(f, "{:?}", ConnectionsDebug(conns))
            }
        }
    }
}

struct ConnectionsDebug<'a>(&'a [Arc<Connection>]);
impl std::fmt::Debug for ConnectionsDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.0
                    .iter()
                    .map(|conn| (conn.get_connect_address(), conn.in_flight())),
            )
            .finish()
    }
}

/// Connections to a single host, kept at the configured size by a
/// background refiller.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<PoolConnections>>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    host: Arc<Host>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .field("host", &self.host.address)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        host: Arc<Host>,
        pool_config: &PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_state_sender: Option<mpsc::UnboundedSender<PoolStateEvent>>,
    ) -> Self {
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let pool_updated_notify = Arc::new(Notify::new());

        let refiller = PoolRefiller::new(
            host.address,
            pool_config.clone(),
            current_keyspace,
            pool_updated_notify.clone(),
            pool_state_sender,
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller.run(use_keyspace_request_receiver).remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            use_keyspace_request_sender,
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            host,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        let maybe_conns = self.conns.load();
        match maybe_conns.as_ref() {
            PoolConnections::Filling => false,
            PoolConnections::Broken(_) => false,
            PoolConnections::Ready(_) => true,
        }
    }

    /// Picks the connection with the most spare stream ids.
    ///
    /// Ties are broken randomly so that equally loaded connections share
    /// the traffic. If every connection is saturated the least loaded one
    /// is returned anyway and the request waits in its queue.
    pub(crate) fn connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        trace!("Selecting connection");
        self.with_connections(|conns| Self::choose_least_loaded_connection(conns))?
            .ok_or(ConnectionPoolError::Initializing)
    }

    fn choose_least_loaded_connection(v: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        trace!(
            connections = tracing::field::display(
                v.iter()
                    .map(|conn| format!("{} ({} in flight)", conn.get_connect_address(), conn.in_flight()))
                    .join(", ")
            ),
            "Available"
        );
        match v.len() {
            0 => None,
            1 => Some(v[0].clone()),
            len => {
                let start = rand::rng().random_range(0..len);
                v.iter()
                    .cycle()
                    .skip(start)
                    .take(len)
                    .filter(|conn| !conn.is_closed())
                    .min_by_key(|conn| conn.in_flight())
                    .or_else(|| v.get(start))
                    .cloned()
            }
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();

        // The other end lives in the PoolRefiller, which only stops once
        // every handle to this pool is dropped.
        let channel_closed = || {
            UseKeyspaceError::RequestError(RequestAttemptError::BrokenConnectionError(
                BrokenConnectionErrorKind::ChannelError.into(),
            ))
        };

        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| channel_closed())?;

        response_receiver.await.map_err(|_| channel_closed())?
    }

    /// Resolves once the first connection is up or the first fill has
    /// failed.
    pub(crate) async fn wait_until_initialized(&self) {
        let notified = self.pool_updated_notify.notified();
        if let PoolConnections::Filling = **self.conns.load() {
            notified.await;
        }
    }

    #[cfg(test)]
    fn connection_count(&self) -> usize {
        self.with_connections(|conns| conns.len()).unwrap_or(0)
    }

    fn with_connections<T>(
        &self,
        f: impl FnOnce(&[Arc<Connection>]) -> T,
    ) -> Result<T, ConnectionPoolError> {
        let conns = self.conns.load_full();
        match &*conns {
            PoolConnections::Ready(pool_connections) => Ok(f(pool_connections)),
            PoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            PoolConnections::Filling => Err(ConnectionPoolError::Initializing),
        }
    }
}

/// Delay before topping up a pool whose last fill went fine.
const TOP_UP_DELAY: Duration = Duration::from_millis(50);

/// Picks the delay before the next fill. A streak of failed fills walks
/// one reconnection schedule; the first fill that succeeds ends the streak.
struct FillDelay {
    policy: Arc<dyn ReconnectionPolicy>,
    failing: Option<Box<dyn ReconnectionSchedule>>,
}

impl FillDelay {
    fn new(policy: Arc<dyn ReconnectionPolicy>) -> Self {
        Self {
            policy,
            failing: None,
        }
    }

    fn after_failed_fill(&mut self) -> Duration {
        let policy = &self.policy;
        self.failing
            .get_or_insert_with(|| policy.new_schedule())
            .next_delay()
    }

    fn after_successful_fill(&mut self) -> Duration {
        self.failing = None;
        TOP_UP_DELAY
    }
}

struct PoolRefiller {
    address: SocketAddr,
    pool_config: PoolConfig,

    /// Published copy of `conns`.
    shared_conns: Arc<ArcSwap<PoolConnections>>,
    conns: Vec<Arc<Connection>>,

    had_error_since_last_refill: bool,

    fill_delay: FillDelay,

    /// Connections being opened, or being switched to the current keyspace.
    ready_connections:
        FuturesUnordered<Pin<Box<dyn Future<Output = OpenedConnectionEvent> + Send + 'static>>>,

    /// One future per pooled connection, resolving when it breaks.
    connection_errors:
        FuturesUnordered<Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send + 'static>>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    pool_updated_notify: Arc<Notify>,

    /// Told when the pool becomes empty or stops being empty.
    pool_state_sender: Option<mpsc::UnboundedSender<PoolStateEvent>>,
    was_connected: bool,
}

#[derive(Debug)]
struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

impl PoolRefiller {
    fn new(
        address: SocketAddr,
        pool_config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
        pool_state_sender: Option<mpsc::UnboundedSender<PoolStateEvent>>,
    ) -> Self {
        let shared_conns = Arc::new(ArcSwap::new(Arc::new(PoolConnections::Filling)));
        let fill_delay = FillDelay::new(pool_config.reconnection_policy.clone());

        Self {
            address,
            pool_config,

            shared_conns,
            conns: Vec::new(),

            had_error_since_last_refill: false,
            fill_delay,

            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),

            current_keyspace,

            pool_updated_notify,
            pool_state_sender,
            was_connected: false,
        }
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<PoolConnections>> {
        self.shared_conns.clone()
    }

    async fn run(mut self, mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>) {
        debug!("[{}] Pool refiller started", self.address);

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = true;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!("[{}] Connection {:p} broke: {:?}", self.address, Arc::as_ptr(&conn), evt.error);
                        self.remove_connection(conn, evt.error);
                    }
                }

                req = use_keyspace_request_receiver.recv() => {
                    if let Some(req) = req {
                        debug!("[{}] Switching pool to keyspace {}", self.address, req.keyspace_name.as_str());
                        self.use_keyspace(req.keyspace_name, req.response_sender);
                    } else {
                        // Every pool handle is gone.
                        trace!("[{}] Pool dropped, refiller exits", self.address);
                        return;
                    }
                }
            }
            trace!(pool_state = ?ConnectionsDebug(&self.conns));

            if !refill_scheduled && self.need_filling() {
                let delay = if self.had_error_since_last_refill {
                    self.fill_delay.after_failed_fill()
                } else {
                    self.fill_delay.after_successful_fill()
                };
                debug!("[{}] Next fill in {:?}", self.address, delay);

                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn is_full(&self) -> bool {
        self.conns.len() >= self.pool_config.pool_size.target()
    }

    fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn need_filling(&self) -> bool {
        !self.is_filling() && !self.is_full()
    }

    fn start_filling(&mut self) {
        if self.is_empty() {
            // The host may well be down. Try a single connection first.
            trace!("[{}] Opening a first connection", self.address);
            self.start_opening_connection();
            return;
        }

        let to_open_count = self
            .pool_config
            .pool_size
            .target()
            .saturating_sub(self.conns.len());
        trace!("[{}] Opening {} connections", self.address, to_open_count);
        for _ in 0..to_open_count {
            self.start_opening_connection();
        }
    }

    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                self.had_error_since_last_refill = true;
                debug!("[{}] Could not open connection: {:?}", self.address, err);

                if !self.is_filling() && self.is_empty() {
                    self.update_shared_conns(Some(err));
                }
            }
            Ok((connection, error_receiver)) => {
                // Comes back through `ready_connections` once switched.
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        self.start_setting_keyspace_for_connection(connection, error_receiver);
                        return;
                    }
                }

                if self.is_full() {
                    trace!("[{}] Pool already full, closing extra connection", self.address);
                    return;
                }

                let conn = Arc::new(connection);
                trace!(
                    "[{}] Connection {:p} joined the pool ({} total)",
                    self.address,
                    Arc::as_ptr(&conn),
                    self.conns.len() + 1,
                );

                self.connection_errors
                    .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                self.conns.push(conn);

                self.update_shared_conns(None);
            }
        }
    }

    fn start_opening_connection(&self) {
        let cfg = self.pool_config.connection_config.clone();
        let address = self.address;

        let fut = async move {
            let result = open_connection(address, &cfg, None).await;
            OpenedConnectionEvent {
                result,
                keyspace_name: None,
            }
        }
        .boxed();
        self.ready_connections.push(fut);
    }

    /// Publishes `conns`. An empty pool is published as broken with
    /// `last_error`.
    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.is_empty() {
            let last_error = last_error.unwrap_or_else(|| {
                ConnectionError::BrokenConnection(BrokenConnectionErrorKind::Closed.into())
            });
            Arc::new(PoolConnections::Broken(last_error))
        } else {
            Arc::new(PoolConnections::Ready(self.conns.clone()))
        };

        self.shared_conns.store(new_conns);
        self.pool_updated_notify.notify_waiters();

        let connected = !self.is_empty();
        if connected != self.was_connected {
            self.was_connected = connected;
            if let Some(sender) = &self.pool_state_sender {
                let _ = sender.send(PoolStateEvent {
                    address: self.address,
                    connected,
                });
            }
        }
    }

    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        let maybe_idx = self
            .conns
            .iter()
            .position(|other_conn| Arc::ptr_eq(&connection, other_conn));
        match maybe_idx {
            Some(idx) => {
                self.conns.swap_remove(idx);
                trace!(
                    "[{}] Connection {:p} left the pool ({} remaining)",
                    self.address,
                    ptr,
                    self.conns.len(),
                );
                self.update_shared_conns(Some(last_error));
            }
            None => {
                trace!("[{}] Connection {:p} not in the pool", self.address, ptr);
            }
        }
    }

    /// Switches every pooled connection and remembers the keyspace for the
    /// ones opened later. Answers on `response_sender` once the current
    /// connections are switched.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns = self.conns.clone();
        let address = self.address;
        let connect_timeout = self.pool_config.connection_config.connect_timeout;

        let fut = async move {
            if conns.is_empty() {
                return Ok(());
            }
            let switches = conns.iter().map(|conn| conn.use_keyspace(&keyspace_name));
            let results = tokio::time::timeout(connect_timeout, futures::future::join_all(switches))
                .await
                .map_err(|_| UseKeyspaceError::RequestTimeout(connect_timeout))?;

            crate::cluster::use_keyspace_result(results.into_iter())
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!("[{}] Keyspace switched", address),
                Err(err) => warn!("[{}] Keyspace switch failed: {:?}", address, err),
            }
            let _ = response_sender.send(res);
        });
    }

    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
    ) {
        let Some(keyspace_name) = self.current_keyspace.clone() else {
            return;
        };
        let connect_timeout = self.pool_config.connection_config.connect_timeout;
        self.ready_connections.push(
            async move {
                let result =
                    tokio::time::timeout(connect_timeout, connection.use_keyspace(&keyspace_name))
                        .await
                        .unwrap_or(Err(UseKeyspaceError::RequestTimeout(connect_timeout)));
                if let Err(err) = result {
                    warn!(
                        "[{}] New connection could not switch keyspace: {}",
                        connection.get_connect_address(),
                        err,
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}
