//! Plan execution with row and time bounds.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::backend::{Connection, Record, document_to_record};
use crate::cache::ConnectionHandle;
use crate::error::DispatchError;
use crate::translate::{DocumentPlan, QueryPlan};

/// Bounded, structured result of one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub records: Vec<Record>,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Run `fut` under a deadline. Nothing partial survives a timeout.
pub(crate) async fn within<F: Future>(timeout: Duration, fut: F) -> Result<F::Output, DispatchError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| DispatchError::Timeout(timeout))
}

/// Execute a validated plan against `handle`.
///
/// Reasoned plans already carry their rows and answer and pass through.
/// Document plans fetch at most `max_rows` records under `timeout`; one extra
/// record is requested to detect truncation.
pub async fn execute(
    plan: QueryPlan,
    handle: &ConnectionHandle,
    max_rows: usize,
    timeout: Duration,
) -> Result<QueryResult, DispatchError> {
    match plan {
        QueryPlan::Reasoned(trace) => Ok(QueryResult {
            records: trace.rows,
            truncated: trace.truncated,
            summary: Some(trace.final_answer),
        }),
        QueryPlan::Document(plan) => {
            let Connection::Document(source) = handle.connection() else {
                return Err(DispatchError::Execution(format!(
                    "{} cannot run a document filter",
                    handle.label()
                )));
            };

            let filter = match &plan {
                DocumentPlan::MatchAll => bson::Document::new(),
                DocumentPlan::Filter(filter) => filter.to_document(),
            };
            info!("find on {} with {}", source.namespace(), plan);

            let limit = max_rows.saturating_add(1);
            let mut docs = within(timeout, source.find(filter, limit)).await??;

            let truncated = docs.len() > max_rows;
            docs.truncate(max_rows);
            let count = docs.len();
            Ok(QueryResult {
                records: docs.into_iter().map(document_to_record).collect(),
                truncated,
                summary: Some(document_summary(count, truncated)),
            })
        }
    }
}

fn document_summary(count: usize, truncated: bool) -> String {
    match (count, truncated) {
        (0, _) => "No matching documents.".to_string(),
        (1, _) => "Found 1 matching document.".to_string(),
        (n, false) => format!("Found {n} matching documents."),
        (n, true) => format!("Found more than {n} matching documents; showing the first {n}."),
    }
}

// ============================================================================
// Tests
// ============================================================================
