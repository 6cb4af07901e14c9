use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::cluster::host::Host;
use crate::frame::response::result;
use crate::frame::types::Consistency;

/// How a request got executed: which hosts were tried and how many
/// times the retry policy was consulted with a retrying outcome.
#[derive(Debug, Clone, Default)]
pub struct ExecutionInfo {
    attempted_hosts: Vec<Arc<Host>>,
    retries: usize,
    consistency: Consistency,
}

impl ExecutionInfo {
    pub(crate) fn new(
        attempted_hosts: Vec<Arc<Host>>,
        retries: usize,
        consistency: Consistency,
    ) -> Self {
        Self {
            attempted_hosts,
            retries,
            consistency,
        }
    }

    /// Hosts the request was sent to, in plan order. Each host appears
    /// once, however many times it was retried; see
    /// [`retries`](Self::retries) for the attempt count.
    pub fn attempted_hosts(&self) -> &[Arc<Host>] {
        &self.attempted_hosts
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    /// Consistency of the attempt that succeeded.
    pub fn consistency(&self) -> Consistency {
        self.consistency
    }
}

/// Result of a single request to the database.
///
/// Rows are kept encoded, exactly as received.
#[derive(Debug)]
pub struct QueryResult {
    result: result::Result,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
    execution_info: ExecutionInfo,
}

impl QueryResult {
    pub(crate) fn new(
        result: result::Result,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
        execution_info: ExecutionInfo,
    ) -> Self {
        Self {
            result,
            tracing_id,
            warnings,
            execution_info,
        }
    }

    /// Result returned when the retry policy decided to ignore an error.
    pub(crate) fn mock_empty(execution_info: ExecutionInfo) -> Self {
        Self::new(result::Result::Void, None, Vec::new(), execution_info)
    }

    /// The RESULT body.
    pub fn result(&self) -> &result::Result {
        &self.result
    }

    /// Returns `true` if the response was a RESULT of kind ROWS.
    pub fn is_rows(&self) -> bool {
        matches!(self.result, result::Result::Rows(_))
    }

    /// Encoded rows, if the result carries rows.
    pub fn raw_rows(&self) -> Option<&result::RawRows> {
        match &self.result {
            result::Result::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    /// Paging state to fetch the next page with, if there are more pages.
    pub fn paging_state(&self) -> Option<&Bytes> {
        self.raw_rows().and_then(|rows| rows.paging_state.as_ref())
    }

    /// Tracing id, set when tracing was enabled on the statement.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    pub fn warnings(&self) -> impl Iterator<Item = &str> {
        self.warnings.iter().map(String::as_str)
    }

    pub fn execution_info(&self) -> &ExecutionInfo {
        &self.execution_info
    }
}
