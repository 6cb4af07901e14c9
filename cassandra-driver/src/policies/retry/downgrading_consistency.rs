use tracing::debug;

use super::{RetryDecision, RetryPolicy};
use crate::errors::WriteType;
use crate::frame::types::Consistency;
use crate::statement::Statement;

/// Downgrading consistency retry policy - retries with lower consistency level if it knows\
/// that the initial CL is unreachable. Also, it behaves as [DefaultRetryPolicy](crate::policies::retry::DefaultRetryPolicy)
/// when it believes that the initial CL is reachable.
///
/// Using this policy trades consistency for availability: a read may see
/// stale data and a write may be acknowledged by fewer replicas than asked for.
#[derive(Debug)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    /// Creates a new instance of [DowngradingConsistencyRetryPolicy].
    pub fn new() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy
    }
}

impl Default for DowngradingConsistencyRetryPolicy {
    fn default() -> DowngradingConsistencyRetryPolicy {
        DowngradingConsistencyRetryPolicy::new()
    }
}

fn max_likely_to_work_cl(
    previous_cl: Consistency,
    required: i32,
    known_ok: i32,
) -> RetryDecision {
    let decision = if previous_cl == Consistency::All && required > 1 && known_ok > required / 2 {
        RetryDecision::Retry(Consistency::Quorum)
    } else if known_ok >= 3 {
        RetryDecision::Retry(Consistency::Three)
    } else if known_ok == 2 {
        RetryDecision::Retry(Consistency::Two)
    } else if known_ok == 1 {
        RetryDecision::Retry(Consistency::One)
    } else {
        RetryDecision::Reraise
    };
    if let RetryDecision::Retry(new_cl) = decision {
        debug!(
            "Decided to lower required consistency from {} to {}.",
            previous_cl, new_cl
        );
    }
    decision
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn read_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        required: i32,
        received: i32,
        data_retrieved: bool,
        retry_count: usize,
    ) -> RetryDecision {
        if retry_count > 0 || consistency.is_serial() {
            return RetryDecision::Reraise;
        }
        if received < required {
            max_likely_to_work_cl(consistency, required, received)
        } else if !data_retrieved {
            RetryDecision::Retry(consistency)
        } else {
            RetryDecision::Reraise
        }
    }

    fn write_timeout(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        write_type: &WriteType,
        required: i32,
        received: i32,
        retry_count: usize,
    ) -> RetryDecision {
        if retry_count > 0 || consistency.is_serial() {
            return RetryDecision::Reraise;
        }
        match write_type {
            // At least one replica has the write; it will be propagated.
            WriteType::Simple | WriteType::Batch => RetryDecision::Ignore,
            // Since only part of the batch could have been persisted,
            // retry with whatever consistency should allow to persist all
            WriteType::UnloggedBatch => max_likely_to_work_cl(consistency, required, received),
            WriteType::BatchLog => RetryDecision::Retry(consistency),
            _ => RetryDecision::Reraise,
        }
    }

    fn unavailable(
        &self,
        _statement: &Statement,
        consistency: Consistency,
        required: i32,
        alive: i32,
        retry_count: usize,
    ) -> RetryDecision {
        if retry_count > 0 || consistency.is_serial() {
            return RetryDecision::Reraise;
        }
        max_likely_to_work_cl(consistency, required, alive)
    }
}

#[cfg(test)]
mod tests {
    use super::{DowngradingConsistencyRetryPolicy, RetryDecision, RetryPolicy};
    use crate::errors::WriteType;
    use crate::statement::{Consistency, Statement};
    use crate::test_utils::setup_tracing;

    fn statement() -> Statement {
        Statement::new("UPDATE ks.t SET v = 1 WHERE k = 0")
    }

    #[test]
    fn downgrading_unavailable() {
        setup_tracing();
        let policy = DowngradingConsistencyRetryPolicy::new();
        let s = statement();

        assert_eq!(
            policy.unavailable(&s, Consistency::All, 7, 4, 0),
            RetryDecision::Retry(Consistency::Quorum)
        );
        // 3 alive out of 7 is no quorum.
        assert_eq!(
            policy.unavailable(&s, Consistency::All, 7, 3, 0),
            RetryDecision::Retry(Consistency::Three)
        );
        assert_eq!(
            policy.unavailable(&s, Consistency::Quorum, 2, 1, 0),
            RetryDecision::Retry(Consistency::One)
        );
        assert_eq!(
            policy.unavailable(&s, Consistency::All, 7, 0, 0),
            RetryDecision::Reraise
        );
        assert_eq!(
            policy.unavailable(&s, Consistency::All, 7, 4, 1),
            RetryDecision::Reraise
        );
    }

    #[test]
    fn downgrading_read_timeout() {
        setup_tracing();
        let policy = DowngradingConsistencyRetryPolicy::new();
        let s = statement();

        assert_eq!(
            policy.read_timeout(&s, Consistency::Three, 3, 2, false, 0),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.read_timeout(&s, Consistency::Two, 2, 2, false, 0),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.read_timeout(&s, Consistency::Two, 2, 2, true, 0),
            RetryDecision::Reraise
        );
        assert_eq!(
            policy.read_timeout(&s, Consistency::Serial, 2, 1, false, 0),
            RetryDecision::Reraise
        );
    }

    #[test]
    fn downgrading_write_timeout() {
        setup_tracing();
        let policy = DowngradingConsistencyRetryPolicy::new();
        let s = statement();

        assert_eq!(
            policy.write_timeout(&s, Consistency::Two, &WriteType::Simple, 2, 1, 0),
            RetryDecision::Ignore
        );
        assert_eq!(
            policy.write_timeout(&s, Consistency::Two, &WriteType::Batch, 2, 1, 0),
            RetryDecision::Ignore
        );
        assert_eq!(
            policy.write_timeout(&s, Consistency::Three, &WriteType::UnloggedBatch, 3, 2, 0),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.write_timeout(&s, Consistency::Two, &WriteType::BatchLog, 2, 1, 0),
            RetryDecision::Retry(Consistency::Two)
        );
        assert_eq!(
            policy.write_timeout(&s, Consistency::Two, &WriteType::Counter, 2, 1, 0),
            RetryDecision::Reraise
        );
        assert_eq!(
            policy.write_timeout(&s, Consistency::Two, &WriteType::Simple, 2, 1, 1),
            RetryDecision::Reraise
        );
    }
}
