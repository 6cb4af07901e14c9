//! Defines the [`Statement`] type, a CQL statement sent with a QUERY request.
//!
//! Values are bound already encoded: the driver does not know about CQL
//! types, it only places the bytes in the request.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::client::execution_profile::ExecutionProfileHandle;
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::retry::RetryPolicy;

pub use crate::frame::types::{Consistency, SerialConsistency};

#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,
    pub(crate) attempt_timeout: Option<Option<Duration>>,

    pub(crate) execution_profile_handle: Option<ExecutionProfileHandle>,
    pub(crate) load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl StatementConfig {
    #[must_use]
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}

/// CQL statement, executed with [`Session::execute`](crate::Session::execute).
#[derive(Debug, Clone)]
pub struct Statement {
    pub(crate) config: StatementConfig,

    /// The CQL statement text.
    pub contents: String,
    values: Vec<Option<Bytes>>,
    page_size: Option<i32>,
    paging_state: Option<Bytes>,
    keyspace: Option<String>,
    routing_key: Option<Bytes>,
}

impl Statement {
    /// Statement with default options and no bound values.
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            contents: query_text.into(),
            config: Default::default(),
            values: Vec::new(),
            page_size: None,
            paging_state: None,
            keyspace: None,
            routing_key: None,
        }
    }

    /// Sets the positional values bound to the statement's markers.
    /// Each value is already serialized; `None` is sent as CQL null.
    pub fn set_values(&mut self, values: Vec<Option<Bytes>>) {
        self.values = values;
    }

    pub fn get_values(&self) -> &[Option<Bytes>] {
        &self.values
    }

    /// Rows per page requested from the server. Zero or less turns paging off.
    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = (page_size > 0).then_some(page_size);
    }

    pub fn get_page_size(&self) -> Option<i32> {
        self.page_size
    }

    /// Sets the paging state returned with the previous page,
    /// to fetch the next one.
    pub fn set_paging_state(&mut self, paging_state: Option<Bytes>) {
        self.paging_state = paging_state;
    }

    pub fn get_paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    /// Sets the keyspace the statement operates on.
    /// It is only used for routing; the statement text must still
    /// qualify its tables (or rely on `USE`).
    pub fn set_keyspace(&mut self, keyspace: Option<String>) {
        self.keyspace = keyspace;
    }

    pub fn get_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    /// Sets the serialized partition key, used by token aware routing.
    pub fn set_routing_key(&mut self, routing_key: Option<Bytes>) {
        self.routing_key = routing_key;
    }

    pub fn get_routing_key(&self) -> Option<&[u8]> {
        self.routing_key.as_deref()
    }

    /// Overrides the execution profile's consistency.
    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    /// Goes back to the execution profile's consistency.
    pub fn unset_consistency(&mut self) {
        self.config.consistency = None;
    }

    /// Consistency override, if any.
    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    /// Overrides the serial consistency used by conditional updates.
    /// `None` sends no serial consistency at all.
    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    /// Goes back to the execution profile's serial consistency.
    pub fn unset_serial_consistency(&mut self) {
        self.config.serial_consistency = None;
    }

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency.flatten()
    }

    /// Marks the statement as safe to apply more than once.
    ///
    /// Statements are not idempotent by default. Only idempotent statements
    /// are sent again after a client-side timeout or a write timeout.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    /// Asks the server to trace the execution. The trace id is then
    /// available on the returned [`QueryResult`](crate::QueryResult).
    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.config.tracing
    }

    /// Client-side write timestamp, in microseconds since the epoch.
    /// A `USING TIMESTAMP` clause in the statement takes precedence.
    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    /// Bounds the whole execution, retries included. `None` falls back to
    /// the execution profile's timeout.
    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout
    }

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }

    /// Bounds every single attempt, overriding the execution profile.
    /// `Some(None)` removes the per-attempt bound, `None` goes back to the
    /// profile's setting.
    pub fn set_attempt_timeout(&mut self, timeout: Option<Option<Duration>>) {
        self.config.attempt_timeout = timeout
    }

    pub fn get_attempt_timeout(&self) -> Option<Option<Duration>> {
        self.config.attempt_timeout
    }

    /// Retry policy used instead of the execution profile's.
    #[inline]
    pub fn set_retry_policy(&mut self, retry_policy: Option<Arc<dyn RetryPolicy>>) {
        self.config.retry_policy = retry_policy;
    }

    /// The statement's own retry policy, ignoring the execution profile.
    #[inline]
    pub fn get_retry_policy(&self) -> Option<&Arc<dyn RetryPolicy>> {
        self.config.retry_policy.as_ref()
    }

    /// Load balancing policy used instead of the execution profile's.
    #[inline]
    pub fn set_load_balancing_policy(
        &mut self,
        load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    ) {
        self.config.load_balancing_policy = load_balancing_policy;
    }

    #[inline]
    pub fn get_load_balancing_policy(&self) -> Option<&Arc<dyn LoadBalancingPolicy>> {
        self.config.load_balancing_policy.as_ref()
    }

    /// Runs the statement with the profile behind `profile_handle` rather
    /// than the session default. Remapping the handle later affects the
    /// statement too.
    pub fn set_execution_profile_handle(&mut self, profile_handle: Option<ExecutionProfileHandle>) {
        self.config.execution_profile_handle = profile_handle;
    }

    pub fn get_execution_profile_handle(&self) -> Option<&ExecutionProfileHandle> {
        self.config.execution_profile_handle.as_ref()
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Statement {
        Statement::new(contents)
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Statement {
        Statement::new(contents)
    }
}
