//! Responses as they come out of a connection, before the orchestrator
//! turns them into a [`QueryResult`](query_result::QueryResult).

pub mod query_result;

use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use crate::errors::RequestAttemptError;
use crate::frame::response::{NonErrorResponse, Response};

/// A parsed response frame together with its body extensions.
#[derive(Debug)]
pub struct QueryResponse {
    pub response: Response,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

/// Like [`QueryResponse`], but it cannot be an error.
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        Ok(NonErrorQueryResponse {
            response: self.response.into_non_error_response()?,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}
