use crate::errors::WriteType;
use crate::frame::types::Consistency;
use crate::statement::Statement;

use super::{RetryDecision, RetryPolicy};

/// Default retry policy - retries only when there is a high chance that a
/// retry on the same host might help, and never more than once.
#[derive(Debug)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    /// Creates a new instance of [DefaultRetryPolicy].
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> DefaultRetryPolicy {
        DefaultRetryPolicy::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    // Retry at most once and only if there were actually enough replies
    // to satisfy consistency but they were all just digests (no data).
    // This happens when the coordinator picked replicas that were
    // overloaded or dying.
    fn read_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: usize,
    ) -> RetryDecision {
        if retry_count > 0 || received < required || data_retrieved {
            return RetryDecision::Reraise;
        }
        RetryDecision::Retry(consistency)
    }

    // Only a batch log write is retried: the coordinator probably did not
    // notice the dead replicas yet.
    fn write_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        _required: i32,
        _received: i32,
        retry_count: usize,
    ) -> RetryDecision {
        if retry_count == 0 && *write_type == WriteType::BatchLog {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }

    fn unavailable(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
        _retry_count: usize,
    ) -> RetryDecision {
        RetryDecision::Reraise
    }
}
