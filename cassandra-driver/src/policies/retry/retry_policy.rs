//! Request retries configurations\
//! To decide what to do after the database reported a timeout or unavailability,
//! the `Session` consults an object which implements the `RetryPolicy` trait

use crate::errors::{DbError, WriteType};
use crate::frame::types::Consistency;
use crate::statement::Statement;

/// Outcome of consulting a [`RetryPolicy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Send the request again to the same host, with the given consistency.
    Retry(Consistency),
    /// Pretend the request succeeded; the caller gets an empty result.
    Ignore,
    /// Give up on this host.
    Reraise,
}

/// Specifies a policy used to decide what to do when the coordinator
/// reports a read timeout, a write timeout or unavailable replicas.
///
/// All methods receive `retry_count`: how many times the request has been
/// retried or moved on to another host so far. Implementations must be pure
/// functions of their arguments.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// The coordinator did not get enough replica responses in time for a read.
    fn read_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: usize,
    ) -> RetryDecision;

    /// The coordinator did not get enough replica acknowledgements in time for a write.
    fn write_timeout(
        &self,
        statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retry_count: usize,
    ) -> RetryDecision;

    /// The coordinator knew up front that too few replicas were alive.
    fn unavailable(
        &self,
        statement: &Statement,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: usize,
    ) -> RetryDecision;
}

/// Consults `policy` if `error` is one of the errors it is responsible for.
/// Returns `None` for every other error.
pub(crate) fn decide(
    policy: &dyn RetryPolicy,
    statement: &Statement,
    error: &DbError,
    retry_count: usize,
) -> Option<RetryDecision> {
    let decision = match error {
        DbError::ReadTimeout {
            consistency,
            received,
            required,
            data_present,
        } => policy.read_timeout(
            statement,
            *consistency,
            *required,
            *received,
            *data_present,
            retry_count,
        ),
        DbError::WriteTimeout {
            consistency,
            received,
            required,
            write_type,
        } => policy.write_timeout(
            statement,
            *consistency,
            write_type,
            *required,
            *received,
            retry_count,
        ),
        DbError::Unavailable {
            consistency,
            required,
            alive,
        } => policy.unavailable(statement, *consistency, *required, *alive, retry_count),
        _ => return None,
    };
    Some(decision)
}
