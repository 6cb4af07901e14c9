use super::{RetryDecision, RetryPolicy};
use crate::errors::WriteType;
use crate::frame::types::Consistency;
use crate::statement::Statement;

/// Forwards all errors directly to the user, never retries
#[derive(Debug)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    /// Creates a new instance of [FallthroughRetryPolicy].
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl Default for FallthroughRetryPolicy {
    fn default() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn read_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _required: i32,
        _received: i32,
        _data_retrieved: bool,
        _retry_count: usize,
    ) -> RetryDecision {
        RetryDecision::Reraise
    }

    fn write_timeout(
        &self,
        _statement: &Statement,
        _consistency: Consistency,
        _write_type: &WriteType,
        _required: i32,
        _received: i32,
        _retry_count: usize,
    ) -> RetryDecision {
        RetryDecision::Reraise
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
