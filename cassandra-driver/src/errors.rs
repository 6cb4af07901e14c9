//! This module contains various errors which can be returned by [`Session`](crate::Session)
//! and the layers below it.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

pub use cassandra_cql::errors::{DbError, WriteType};
pub use cassandra_cql::frame::frame_errors::{
    CqlEventParseError, CqlRequestSerializationError, CqlResponseParseError,
    FrameBodyExtensionsParseError, FrameHeaderParseError,
};
pub use cassandra_cql::frame::request::RequestOpcode;
pub use cassandra_cql::frame::response::CqlResponseKind;

use itertools::Itertools;
use thiserror::Error;

use crate::authentication::AuthError;

/// Error that occurred during request execution
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// No host in the plan could serve the request.
    #[error(transparent)]
    NoHostsAvailable(#[from] NoHostsAvailableError),

    /// The error of the last attempt, surfaced unchanged.
    ///
    /// This is either a fatal error, or a retryable server error that
    /// the retry policy decided not to retry anymore.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// Client timeout occurred before any response arrived
    #[error("Request timeout: {0:?}")]
    RequestTimeout(Duration),

    /// Passed invalid keyspace name to use
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// `USE <keyspace>` succeeded on the coordinator, but could not be
    /// propagated to the pools.
    #[error("Failed to switch the session to the new keyspace: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

impl ExecutionError {
    /// Returns the database error carried by this error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            ExecutionError::LastAttemptError(RequestAttemptError::DbError(db_error, _)) => {
                Some(db_error)
            }
            _ => None,
        }
    }
}

/// Every host of the plan was tried and none of them served the request.
///
/// Holds the last error observed for each attempted host.
#[derive(Debug, Clone, Default)]
pub struct NoHostsAvailableError {
    errors: HashMap<SocketAddr, RequestError>,
}

impl NoHostsAvailableError {
    pub(crate) fn new(errors: HashMap<SocketAddr, RequestError>) -> Self {
        Self { errors }
    }

    /// Last error observed for each attempted host.
    pub fn errors(&self) -> &HashMap<SocketAddr, RequestError> {
        &self.errors
    }
}

impl fmt::Display for NoHostsAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            return write!(f, "No hosts available: the query plan was empty");
        }
        write!(
            f,
            "No hosts available, tried: [{}]",
            self.errors
                .iter()
                .sorted_by_key(|(addr, _)| **addr)
                .map(|(addr, err)| format!("{addr}: {err}"))
                .join("; ")
        )
    }
}

impl std::error::Error for NoHostsAvailableError {}

/// Why a single host could not serve the request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// No connection to the host could be obtained.
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// The attempt on the host failed.
    #[error(transparent)]
    AttemptError(#[from] RequestAttemptError),
}

/// An error that occurred during a single attempt of executing a request
/// on one connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Failed to serialize the request into a frame.
    #[error("Failed to serialize the request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// Failed to decompress the body or to read its extensions.
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Failed to deserialize the response body.
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Received a response of a kind that does not answer the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// The connection broke while the request was in flight.
    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// The connection was already closed or closing when the request was sent.
    #[error("Connection is closed")]
    NotConnected,

    /// No response arrived before the per-attempt deadline.
    #[error("Timeout Error: no response after {0:?}")]
    Timeout(Duration),
}

impl From<cassandra_cql::frame::response::Error> for RequestAttemptError {
    fn from(error: cassandra_cql::frame::response::Error) -> Self {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

/// Error that occurred during session creation
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// Failed to resolve hostname passed in Session creation
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// List of known nodes passed to Session constructor is empty
    /// There needs to be at least one node to connect to
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Configuration passed to the builder is inconsistent.
    #[error(transparent)]
    InvalidArgument(#[from] InvalidArgumentError),

    /// None of the known nodes accepted a connection.
    #[error("Could not connect to any known node: {0}")]
    NoConnectedHost(NoHostsAvailableError),

    /// Setting the keyspace passed to the builder failed.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),
}

/// Invalid keyspace name given to `Session::use_keyspace()`
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// An error that occurred when performing a `USE <keyspace>` request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Passed invalid keyspace name to use.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// An error during request execution.
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    /// Keyspace name mismatch.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name_lowercase}, received: {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    /// Pools did not acknowledge the keyspace change in time.
    #[error("Request timeout: {0:?}")]
    RequestTimeout(Duration),
}

/// A policy or a configuration value was rejected at construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid argument: {reason}")]
pub struct InvalidArgumentError {
    reason: String,
}

impl InvalidArgumentError {
    pub(crate) fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Describes what was wrong with the argument.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// An error that occurred when selecting a connection from the pool.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    /// A connection pool is broken. Includes an error of a last connection.
    #[error("The pool is broken; Last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    /// A connection pool is still being initialized.
    #[error("Pool is still being initialized")]
    Initializing,

    /// The host has no pool, because it is down or unknown to the session.
    #[error("No connection pool exists for the host")]
    Missing,
}

/// An error that appeared on a connection level.
/// It indicated that connection can no longer be used
/// and should be dropped.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Provided connect timeout elapsed.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error occurred.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// Connection broke after being established.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// A request required to initialize a connection failed.
    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    /// The keyspace could not be set on the new connection.
    #[error("Failed to set the keyspace on a new connection: {0}")]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// Connection configuration is invalid.
    #[error(transparent)]
    InvalidConfig(#[from] InvalidArgumentError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// An error that occurred during connection setup request execution.
/// It indicates that request needed to initiate a connection failed.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request_kind: RequestOpcode,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: RequestOpcode, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }

    /// The request that failed.
    pub fn request_kind(&self) -> RequestOpcode {
        self.request_kind
    }

    /// Why it failed.
    pub fn error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }
}

/// Why a connection setup request failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    /// The request itself failed, or the server answered with an error.
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    /// Failed to start a client's auth session.
    #[error("Failed to start client's auth session: {0}")]
    StartAuthSessionError(AuthError),

    /// Failed to evaluate auth token challenge on client side.
    #[error("Failed to evaluate auth challenge on client side: {0}")]
    AuthChallengeEvaluationError(AuthError),

    /// Failed to finish auth challenge on client side.
    #[error("Failed to finish auth challenge on client side: {0}")]
    AuthFinishError(AuthError),

    /// User did not provide authentication while the cluster requires it.
    #[error("Authentication is required. You can use SessionBuilder::user(\"user\", \"pass\") to provide credentials or SessionBuilder::authenticator_provider to provide custom authenticator")]
    MissingAuthentication,
}

/// An error indicating that a connection was broken.
/// Possible error reasons are listed in [`BrokenConnectionErrorKind`].
///
/// The same error is handed to every request that was in flight on the
/// connection, hence the reference counting.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    /// Why the connection broke.
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// A reason why connection was broken.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// Driver was unable to read a frame from the server.
    #[error("Failed to deserialize frame: {0}")]
    FrameHeaderParseError(FrameHeaderParseError),

    /// Failed to handle a CQL event (server pushed an invalid frame on stream -1).
    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(#[from] CqlEventHandlingError),

    /// Received a response to a stream id that has no request waiting for it.
    #[error("Received a server frame with unexpected stream id: {0}")]
    UnexpectedStreamId(i16),

    /// Failed to write data to the socket.
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// Too many stream ids stayed abandoned for too long.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// The heartbeat request got no response in time.
    #[error("Timed out while waiting for response to heartbeat request on connection to node {0}")]
    HeartbeatTimeout(IpAddr),

    /// The heartbeat request failed.
    #[error("Failed to execute heartbeat request: {0}")]
    HeartbeatRequestError(RequestAttemptError),

    /// Nothing was read from the socket for the whole idle timeout.
    #[error("No data received from node {0} for {1:?}")]
    IdleTimeout(IpAddr, Duration),

    /// The connection was closed on request of the client.
    #[error("Connection closed by the client")]
    Closed,

    /// Driver was unable to allocate a stream id for a request, or to pass
    /// the request to the connection router.
    #[error(
        "Failed to send/receive data needed to perform a request via tokio channel.
        It implies that other half of the channel has been dropped.
        The connection was already broken for some other reason."
    )]
    ChannelError,
}

/// Failed to handle a CQL event received on a stream -1.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    /// Received an event whose body extensions could not be read.
    #[error("Failed to read event body extensions: {0}")]
    BodyExtensionParseError(#[from] FrameBodyExtensionsParseError),

    /// Received an event that could not be deserialized.
    #[error("Failed to deserialize a response received on stream -1: {0}")]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// Received a response of different kind than EVENT on stream -1.
    #[error("Received unexpected server response on stream -1: {0}. Expected EVENT response")]
    UnexpectedResponse(CqlResponseKind),
}
