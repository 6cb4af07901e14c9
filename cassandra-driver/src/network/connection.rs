use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, CqlEventHandlingError,
    ConnectionError, ConnectionSetupRequestError, ConnectionSetupRequestErrorKind,
    InvalidArgumentError, RequestAttemptError, UseKeyspaceError,
};
use crate::frame::request::{self, options, query, RequestOpcode, SerializableRequest};
use crate::frame::response::authenticate::{AuthChallenge, AuthSuccess, Authenticate};
use crate::frame::response::event::Event;
use crate::frame::response::{result, Response, ResponseOpcode, Supported};
use crate::frame::server_event_type::EventType;
use crate::frame::types::{Consistency, SerialConsistency};
use crate::frame::{
    self, Compression, CompressionSettings, FrameParams, SerializedRequest,
};
use crate::network::stream_table::{Completion, StreamTable, MAX_STREAMS, MIN_STREAMS};
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::response::QueryResponse;
use crate::statement::Statement;

// An orphan is a stream id whose caller stopped waiting (timeout or dropped
// future). The slot stays taken until the late response arrives. Orphans
// older than OLD_AGE_ORPHAN_THRESHOLD count as old; a connection holding more
// than OLD_ORPHAN_COUNT_THRESHOLD of them is broken and the pool replaces it.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(1);

/// Resolves with the error that broke the connection.
pub type ErrorReceiver = oneshot::Receiver<ConnectionError>;

/// Callback invoked for every event the server pushes on stream -1.
pub type EventListener = Arc<dyn Fn(&Event) + Send + Sync>;

/// A single CQL connection, multiplexing many requests over one socket.
///
/// All socket I/O happens in a router task owned by the connection;
/// dropping the connection stops the task.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    // Compression actually negotiated with the server.
    compression: Option<CompressionSettings>,
    router_handle: Arc<RouterHandle>,

    close_sender: StdMutex<Option<oneshot::Sender<BrokenConnectionError>>>,
    stopped: watch::Receiver<bool>,
    event_listeners: Arc<ArcSwap<Vec<EventListener>>>,
    current_keyspace: ArcSwapOption<String>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    request_id_generator: AtomicU64,
    // Fed from `Drop`, hence unbounded.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,

    // Set as soon as closing begins; requests sent afterwards fail fast.
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<CompressionSettings>,
        tracing: bool,
    ) -> Result<TaskResponse, RequestAttemptError> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(RequestAttemptError::NotConnected);
        }

        let serialized_request = SerializedRequest::make(request, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        let _in_flight = InFlightGuard::new(&self.in_flight);

        // Dropped without `disable()` means the caller gave up: the router
        // then orphans the request's stream id.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| RequestAttemptError::NotConnected)?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        notifier.disable();

        task_response
    }
}

type RequestId = u64;

#[derive(Debug)]
struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    request_id: RequestId,
}

// Used to notify `Connection::orphaner` about `Connection::send`
// future being dropped before receiving response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

#[derive(Debug)]
struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

// Last time something was read from and written to the socket.
struct Activity {
    last_read: Instant,
    last_write: Instant,
}

/// Configuration of a single connection.
#[derive(Clone)]
#[non_exhaustive]
pub struct ConnectionConfig {
    /// Compression to request from the server. If the server does not
    /// support it, the connection falls back to no compression.
    pub compression: Option<Compression>,
    /// Bodies shorter than this are sent uncompressed.
    pub compression_threshold: usize,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,
    pub connect_timeout: Duration,
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// A heartbeat (OPTIONS) is sent after this long without writing anything.
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for the heartbeat response before closing.
    pub heartbeat_timeout: Duration,
    /// The connection is closed after this long without reading anything.
    pub idle_timeout: Option<Duration>,

    /// Size of the stream id table, between 128 and 32767.
    pub max_streams: usize,
    /// Events to REGISTER for once the connection is ready.
    pub event_types: Vec<EventType>,
    /// Fills in the timestamp of statements that do not set one.
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            compression_threshold: frame::DEFAULT_COMPRESSION_THRESHOLD,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            authenticator: None,
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(60)),
            max_streams: MAX_STREAMS,
            event_types: Vec::new(),
            timestamp_generator: None,
        }
    }
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("compression", &self.compression)
            .field("compression_threshold", &self.compression_threshold)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .field("tcp_keepalive_interval", &self.tcp_keepalive_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("authenticator", &self.authenticator.as_ref().map(|_| "..."))
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_streams", &self.max_streams)
            .field("event_types", &self.event_types)
            .field(
                "timestamp_generator",
                &self.timestamp_generator.as_ref().map(|_| "..."),
            )
            .finish()
    }
}

impl ConnectionConfig {
    pub(crate) fn validate(&self) -> Result<(), InvalidArgumentError> {
        if !(MIN_STREAMS..=MAX_STREAMS).contains(&self.max_streams) {
            return Err(InvalidArgumentError::new(format!(
                "max_streams must be between {} and {}, got {}",
                MIN_STREAMS, MAX_STREAMS, self.max_streams
            )));
        }
        if self.heartbeat_interval == Some(Duration::ZERO) {
            return Err(InvalidArgumentError::new("heartbeat_interval must be positive"));
        }
        if self.idle_timeout == Some(Duration::ZERO) {
            return Err(InvalidArgumentError::new("idle_timeout must be positive"));
        }
        Ok(())
    }
}

enum NonErrorStartupResponse {
    Ready,
    Authenticate(Authenticate),
}

enum NonErrorAuthResponse {
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}

impl Connection {
    /// TCP connect and router startup. No frame is exchanged yet.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector =
            tokio::time::timeout(config.connect_timeout, connect(connect_address)).await;
        let stream = match stream_connector {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();
        let (close_sender, close_receiver) = oneshot::channel();
        let (stopped_sender, stopped) = watch::channel(false);

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            closed: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        });
        let event_listeners = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let (task, _worker_handle) = Self::router(
            RouterConfig::from(&config),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            close_receiver,
            stopped_sender,
            router_handle.clone(),
            event_listeners.clone(),
            connect_address.ip(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            compression: None,
            router_handle,
            close_sender: StdMutex::new(Some(close_sender)),
            stopped,
            event_listeners,
            current_keyspace: ArcSwapOption::empty(),
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval means time after connection becomes idle until keepalives
        // begin to be sent (socket2 calls it "time"); their interval is time between
        // sending keepalives.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        // Same platform list as socket2 uses for `with_interval`.
        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Startup, kind)
        };

        let response = self
            .send_request(&request::Startup { options }, false, false, None)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )
            .into())),
        }
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Options, kind)
        };

        let response = self
            .send_request(&request::Options, false, false, None)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )
            .into())),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let authenticator = &authenticate.authenticator_name as &str;

        match self.config.authenticator {
            Some(ref authenticator_provider) => {
                let (mut response, mut auth_session) = authenticator_provider
                    .start_authentication_session(authenticator)
                    .await
                    .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

                loop {
                    match self.authenticate_response(response).await? {
                        NonErrorAuthResponse::AuthChallenge(challenge) => {
                            response = auth_session
                                .evaluate_challenge(challenge.authenticate_message.as_deref())
                                .await
                                .map_err(|e| {
                                    err(
                                        ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(
                                            e,
                                        ),
                                    )
                                })?;
                        }
                        NonErrorAuthResponse::AuthSuccess(success) => {
                            auth_session
                                .success(success.success_message.as_deref())
                                .await
                                .map_err(|e| {
                                    err(ConnectionSetupRequestErrorKind::AuthFinishError(e))
                                })?;
                            break;
                        }
                    }
                }
            }
            None => return Err(err(ConnectionSetupRequestErrorKind::MissingAuthentication)),
        }

        Ok(())
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::AuthResponse, kind)
        };

        let response = self
            .send_request(&request::AuthResponse { response }, false, false, None)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::AuthSuccess(auth_success) => Ok(NonErrorAuthResponse::AuthSuccess(auth_success)),
            Response::AuthChallenge(auth_challenge) => {
                Ok(NonErrorAuthResponse::AuthChallenge(auth_challenge))
            }
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )
            .into())),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(RequestOpcode::Register, kind)
        };

        let register_frame = request::Register {
            event_types_to_register_for,
        };

        let response = self
            .send_request(&register_frame, true, false, None)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(()),
            Response::Error(error) => Err(err(RequestAttemptError::from(error).into())),
            other => Err(err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )
            .into())),
        }
    }

    /// Sends a request and waits for its response.
    ///
    /// Fails with [`RequestAttemptError::NotConnected`] if the connection
    /// is closed or closing. If `timeout` elapses first, the stream id is
    /// left abandoned until the late response arrives and
    /// [`RequestAttemptError::Timeout`] is returned.
    pub async fn send(
        &self,
        request: &impl SerializableRequest,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        self.send_request(request, true, false, timeout).await
    }

    /// Executes a statement with a QUERY request.
    ///
    /// A SetKeyspace result updates the keyspace of the connection.
    pub async fn query(
        &self,
        statement: &Statement,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let generated_timestamp = || {
            self.config
                .timestamp_generator
                .as_ref()
                .map(|generator| generator.next_timestamp())
        };
        let query_frame = query::Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                timestamp: statement.get_timestamp().or_else(generated_timestamp),
                page_size: statement.get_page_size(),
                paging_state: statement.get_paging_state().cloned(),
                values: Cow::Borrowed(statement.get_values()),
            },
        };

        let response = self
            .send_request(&query_frame, true, statement.get_tracing(), timeout)
            .await?;

        if let Response::Result(result::Result::SetKeyspace(set_keyspace)) = &response.response {
            self.current_keyspace
                .store(Some(Arc::new(set_keyspace.keyspace_name.clone())));
        }

        Ok(response)
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // USE does not accept bind markers.
        let statement: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let query_response = self
            .query(&statement, Consistency::default(), None, None)
            .await?;
        Self::verify_use_keyspace_result(keyspace_name, query_response)
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    let expected_keyspace_name_lowercase = keyspace_name.as_str().to_lowercase();
                    let result_keyspace_name_lowercase = set_keyspace.keyspace_name.to_lowercase();

                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase,
                        result_keyspace_name_lowercase,
                    });
                }

                Ok(())
            }
            Response::Error(err) => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::DbError(err.error, err.reason),
            )),
            other => Err(UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            )),
        }
    }

    /// Registers a callback for server pushed events.
    ///
    /// Events are only pushed for types the connection REGISTERed for,
    /// see [`ConnectionConfig::event_types`] and [`Connection::register_for_events`].
    pub fn on_event(&self, listener: impl Fn(&Event) + Send + Sync + 'static) {
        let listener: EventListener = Arc::new(listener);
        self.event_listeners.rcu(|listeners| {
            let mut listeners = Vec::clone(listeners);
            listeners.push(listener.clone());
            listeners
        });
    }

    /// Asks the server to push events of the given types on this connection.
    pub async fn register_for_events(
        &self,
        event_types: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        self.register(event_types).await
    }

    /// Closes the connection.
    ///
    /// Every request in flight or waiting for a stream id fails with
    /// `cause` (or a generic "closed" error). Resolves once the I/O loop
    /// has stopped. Closing an already closed connection just waits.
    pub async fn close(&self, cause: Option<BrokenConnectionError>) {
        self.router_handle
            .closed
            .store(true, std::sync::atomic::Ordering::Release);

        let close_sender = self
            .close_sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(close_sender) = close_sender {
            let cause = cause.unwrap_or_else(|| BrokenConnectionErrorKind::Closed.into());
            let _ = close_sender.send(cause);
        }

        let mut stopped = self.stopped.clone();
        // An error means the router is gone, which is just as good.
        let _ = stopped.wait_for(|stopped| *stopped).await;
    }

    pub fn is_closed(&self) -> bool {
        self.router_handle
            .closed
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Number of requests submitted and not answered yet.
    pub fn in_flight(&self) -> usize {
        self.router_handle
            .in_flight
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn max_streams(&self) -> usize {
        self.config.max_streams
    }

    pub fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Compression negotiated with the server.
    pub fn compression(&self) -> Option<Compression> {
        self.compression.map(|settings| settings.algorithm)
    }

    /// Keyspace set by the last successful `USE`.
    pub fn current_keyspace(&self) -> Option<Arc<String>> {
        self.current_keyspace.load_full()
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let compression = if compress { self.compression } else { None };

        let request_fut = self
            .router_handle
            .send_request(request, compression, tracing);
        let task_response = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, request_fut)
                .await
                .map_err(|_| RequestAttemptError::Timeout(timeout))??,
            None => request_fut.await?,
        };

        Self::parse_response(task_response, self.config.compression)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: RouterConfig,
        stream: impl AsyncRead + AsyncWrite,
        mut receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        close_receiver: oneshot::Receiver<BrokenConnectionError>,
        stopped_sender: watch::Sender<bool>,
        router_handle: Arc<RouterHandle>,
        event_listeners: Arc<ArcSwap<Vec<EventListener>>>,
        node_address: IpAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // The handler_map is shared between the reader, writer and orphaner
        // futures, which all run on this task. They never hold the lock
        // across an .await, so it is never contended; a RefCell would make
        // the future !Sync.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.max_streams));
        let slot_freed = Notify::new();
        let now = Instant::now();
        let activity = StdMutex::new(Activity {
            last_read: now,
            last_write: now,
        });

        let k = Self::keepaliver(
            router_handle.clone(),
            &activity,
            config.heartbeat_interval,
            config.heartbeat_timeout,
            config.idle_timeout,
            node_address,
        );

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &slot_freed,
            &activity,
            &event_listeners,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            &mut receiver,
            &slot_freed,
            &activity,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);
        let c = Self::closer(close_receiver);

        let result = futures::try_join!(r, w, o, k, c);

        let error: BrokenConnectionError = match result {
            Ok(_) => return,
            Err(err) => err,
        };

        debug!("Connection to {} broken: {}", node_address, error);
        router_handle
            .closed
            .store(true, std::sync::atomic::Ordering::Release);

        // Nothing gets into the channel from now on; whatever is already
        // there is failed together with the rest.
        receiver.close();
        let mut handler_map = handler_map
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        while let Ok(task) = receiver.try_recv() {
            handler_map.enqueue(task);
        }

        let response_handlers = handler_map.into_handlers();
        trace!(
            "Failing {} outstanding requests on connection to {}",
            response_handlers.len(),
            node_address
        );
        for handler in response_handlers {
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        let _ = stopped_sender.send(true);

        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        slot_freed: &Notify,
        activity: &StdMutex<Activity>,
        event_listeners: &ArcSwap<Vec<EventListener>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;
            activity
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .last_read = Instant::now();

            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&frame::EVENT_STREAM_ID) {
                Ordering::Less => {
                    // Negative streams other than -1 are not used by the
                    // protocol, so ignore them.
                    continue;
                }
                Ordering::Equal => {
                    Self::handle_event(response, compression, event_listeners)
                        .map_err(BrokenConnectionErrorKind::CqlEventHandlingError)?;
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = handler_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .lookup(params.stream);

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    let _ = handler.response_sender.send(Ok(response));
                    slot_freed.notify_one();
                }
                Missing => {
                    // Nobody asked for this stream id.
                    debug!(
                        "Received response with unexpected StreamId {}",
                        params.stream
                    );
                    return Err(BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into());
                }
                Orphaned => {
                    // The late response of an abandoned request; the slot is free now.
                    slot_freed.notify_one();
                }
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        task_receiver: &mut mpsc::Receiver<Task>,
        slot_freed: &Notify,
        activity: &StdMutex<Activity>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let has_queued = handler_map
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .has_queued();

            tokio::select! {
                task = task_receiver.recv() => {
                    let Some(task) = task else {
                        // All senders are gone, the connection was dropped.
                        return Ok(());
                    };
                    let mut handler_map_guard = handler_map.lock().unwrap_or_else(PoisonError::into_inner);
                    handler_map_guard.enqueue(task);
                    while let Ok(task) = task_receiver.try_recv() {
                        handler_map_guard.enqueue(task);
                    }
                }
                _ = slot_freed.notified(), if has_queued => {}
            }

            let mut num_requests = 0;
            let mut total_sent = 0;
            loop {
                let next = handler_map
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .next_writable();
                let Some((stream_id, mut req)) = next else {
                    break;
                };
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
            }

            if num_requests > 0 {
                trace!("Sending {} requests; {} bytes", num_requests, total_sent);
                write_half
                    .flush()
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
                activity
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .last_write = Instant::now();
            }
        }
    }

    // Abandons the stream ids of requests whose caller gave up, and breaks
    // the connection once too many of them linger.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = handler_map
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(old_orphan_count as u16).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    handler_map
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    // Sends a heartbeat after `heartbeat_interval` without writes, and breaks
    // the connection after `idle_timeout` without reads. Only one heartbeat
    // is ever in flight, since the next one is issued after this one resolves.
    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        activity: &StdMutex<Activity>,
        heartbeat_interval: Option<Duration>,
        heartbeat_timeout: Duration,
        idle_timeout: Option<Duration>,
        node_address: IpAddr, // for logs
    ) -> Result<(), BrokenConnectionError> {
        if heartbeat_interval.is_none() && idle_timeout.is_none() {
            return Ok(());
        }

        loop {
            let (last_read, last_write) = {
                let activity = activity.lock().unwrap_or_else(PoisonError::into_inner);
                (activity.last_read, activity.last_write)
            };
            let now = Instant::now();

            let idle_deadline = idle_timeout.map(|timeout| last_read + timeout);
            if let (Some(deadline), Some(timeout)) = (idle_deadline, idle_timeout) {
                if now >= deadline {
                    warn!(
                        "No data received from node {} for {:?}, closing the connection",
                        node_address, timeout
                    );
                    return Err(BrokenConnectionErrorKind::IdleTimeout(node_address, timeout).into());
                }
            }

            let heartbeat_deadline = heartbeat_interval.map(|interval| last_write + interval);
            if heartbeat_deadline.is_some_and(|deadline| now >= deadline) {
                let heartbeat = router_handle.send_request(&request::Options, None, false);
                match tokio::time::timeout(heartbeat_timeout, heartbeat).await {
                    Ok(Ok(_)) => {
                        trace!(
                            "Heartbeat request successful on connection to node {}",
                            node_address
                        );
                    }
                    Ok(Err(err)) => {
                        warn!(
                            "Failed to execute heartbeat request on connection to node {} - {}",
                            node_address, err
                        );
                        return Err(BrokenConnectionErrorKind::HeartbeatRequestError(err).into());
                    }
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to heartbeat request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::HeartbeatTimeout(node_address).into());
                    }
                }
                continue;
            }

            let next_deadline = match (idle_deadline, heartbeat_deadline) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) | (None, Some(a)) => a,
                (None, None) => return Ok(()),
            };
            tokio::time::sleep_until(next_deadline).await;
        }
    }

    async fn closer(
        close_receiver: oneshot::Receiver<BrokenConnectionError>,
    ) -> Result<(), BrokenConnectionError> {
        match close_receiver.await {
            Ok(cause) => Err(cause),
            // The connection is being dropped; the router is stopped by that.
            Err(_) => futures::future::pending().await,
        }
    }

    fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_listeners: &ArcSwap<Vec<EventListener>>,
    ) -> Result<(), CqlEventHandlingError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;
        let response = Response::deserialize(task_response.opcode, &mut &*body_with_ext.body)?;

        let event = match response {
            Response::Event(event) => event,
            other => {
                error!("Expected to receive Event response, got {:?}", other);
                return Err(CqlEventHandlingError::UnexpectedResponse(
                    other.to_response_kind(),
                ));
            }
        };

        trace!("Received event: {:?}", event);
        for listener in event_listeners.load().iter() {
            listener(&event);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .field("compression", &self.compression)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// Parts of the configuration used by the router task.
struct RouterConfig {
    compression: Option<Compression>,
    max_streams: usize,
    heartbeat_interval: Option<Duration>,
    heartbeat_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl From<&ConnectionConfig> for RouterConfig {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            compression: config.compression,
            max_streams: config.max_streams,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            idle_timeout: config.idle_timeout,
        }
    }
}

async fn connect(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.connect(addr).await
}

/// Opens a connection and performs the handshake:
/// OPTIONS, compression negotiation, STARTUP, authentication, then
/// optionally `USE <keyspace>` and REGISTER.
pub async fn open_connection(
    addr: SocketAddr,
    config: &ConnectionConfig,
    keyspace: Option<&VerifiedKeyspaceName>,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    config.validate()?;

    /* Setup connection on TCP level and prepare for sending/receiving CQL frames. */
    let (mut connection, error_receiver) = Connection::new(addr, config.clone()).await?;

    /* Perform OPTIONS/SUPPORTED/STARTUP handshake. */
    let mut supported = connection.get_options().await?;

    let supported_compression = supported
        .options
        .remove(options::COMPRESSION)
        .unwrap_or_default();

    /* Prepare options that the driver opts-in in STARTUP frame. */
    let mut options = HashMap::new();
    options.insert(
        Cow::Borrowed(options::CQL_VERSION),
        Cow::Borrowed(options::DEFAULT_CQL_PROTOCOL_VERSION),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_NAME),
        Cow::Borrowed(options::DEFAULT_DRIVER_NAME),
    );
    options.insert(
        Cow::Borrowed(options::DRIVER_VERSION),
        Cow::Borrowed(options::DEFAULT_DRIVER_VERSION),
    );

    // Optional compression.
    if let Some(compression) = config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            options.insert(
                Cow::Borrowed(options::COMPRESSION),
                Cow::Borrowed(compression_str),
            );
        } else {
            // Fall back to no compression
            warn!(
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression_str
            );
        }
    }
    let negotiated_compression = options
        .get(options::COMPRESSION)
        .and(config.compression)
        .map(|algorithm| CompressionSettings {
            algorithm,
            min_size: config.compression_threshold,
        });

    /* Send the STARTUP frame with all the requested options. */
    let startup_result = connection.startup(options).await?;
    match startup_result {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }
    // From now on requests are compressed.
    connection.compression = negotiated_compression;

    if let Some(keyspace) = keyspace {
        connection.use_keyspace(keyspace).await?;
    }

    if !config.event_types.is_empty() {
        connection.register(config.event_types.clone()).await?;
    }

    Ok((connection, error_receiver))
}

struct ResponseHandlerMap {
    streams: StreamTable<ResponseHandler>,
    request_to_stream: HashMap<RequestId, i16>,
    // Requests waiting for a free stream id, in submission order.
    queue: VecDeque<Task>,
}

#[derive(Debug)]
enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(max_streams: usize) -> Self {
        Self {
            streams: StreamTable::new(max_streams),
            request_to_stream: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, task: Task) {
        self.queue.push_back(task);
    }

    fn has_queued(&self) -> bool {
        !self.queue.is_empty()
    }

    // Assigns a stream id to the oldest queued request whose caller is
    // still waiting. Returns `None` if the queue is empty or no id is free.
    fn next_writable(&mut self) -> Option<(i16, SerializedRequest)> {
        while let Some(task) = self.queue.pop_front() {
            let Task {
                serialized_request,
                response_handler,
            } = task;

            if response_handler.response_sender.is_closed() {
                trace!(
                    "Skipping queued request_id = {}, the caller gave up",
                    response_handler.request_id
                );
                continue;
            }

            let request_id = response_handler.request_id;
            match self.streams.allocate(response_handler) {
                Ok(stream_id) => {
                    self.request_to_stream.insert(request_id, stream_id);
                    return Some((stream_id, serialized_request));
                }
                Err(response_handler) => {
                    self.queue.push_front(Task {
                        serialized_request,
                        response_handler,
                    });
                    return None;
                }
            }
        }
        None
    }

    // Queued requests have no stream id yet; they are skipped when dequeued.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.streams.abandon(stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.streams.abandoned_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        match self.streams.complete(stream_id) {
            Completion::Pending(handler) => {
                // The id may be reused right away; a late orphan
                // notification must not hit the new owner.
                self.request_to_stream.remove(&handler.request_id);
                HandlerLookupResult::Handler(handler)
            }
            Completion::Abandoned => HandlerLookupResult::Orphaned,
            Completion::Free => HandlerLookupResult::Missing,
        }
    }

    // Retrieves every handler still waiting for a response, in flight or
    // queued. Used after connection breaks and we have to respond to all
    // of them with an error
    fn into_handlers(mut self) -> Vec<ResponseHandler> {
        let mut handlers: Vec<ResponseHandler> = self.streams.drain_pending().collect();
        handlers.extend(self.queue.into_iter().map(|task| task.response_handler));
        handlers
    }
}

/// Keyspace name checked against the server's naming rules.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names can have up to 48 alphanumeric characters and contain
    // underscores. Cassandra accepts an underscore as the first character too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ));
                }
            };
        }

        Ok(())
    }
}
