//! One adapter per backend kind. The dispatcher picks one at selection time
//! and routes every question through it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{ReasoningOptions, reason};
use crate::backend::{Connection, StatementSource};
use crate::cache::ConnectionHandle;
use crate::config::{BackendKind, DispatchSettings};
use crate::error::DispatchError;
use crate::executor::{self, QueryResult};
use crate::llm::LlmClient;
use crate::schema::{self, SchemaDescriptor};
use crate::translate::{QueryIntent, QueryPlan, translate_document};

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether [`translate`](Self::translate) needs a schema descriptor.
    fn uses_schema(&self) -> bool;

    async fn describe_schema(
        &self,
        handle: &ConnectionHandle,
    ) -> Result<SchemaDescriptor, DispatchError>;

    async fn translate(
        &self,
        intent: &QueryIntent,
        schema: Option<&SchemaDescriptor>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> Result<QueryPlan, DispatchError>;

    async fn execute(
        &self,
        plan: QueryPlan,
        handle: &ConnectionHandle,
    ) -> Result<QueryResult, DispatchError>;
}

pub fn adapter_for(
    kind: BackendKind,
    llm: Arc<dyn LlmClient>,
    settings: &DispatchSettings,
) -> Box<dyn BackendAdapter> {
    let shared = Shared {
        llm,
        settings: settings.clone(),
    };
    match kind {
        BackendKind::Relational => Box::new(RelationalAdapter(shared)),
        BackendKind::Graph => Box::new(GraphAdapter(shared)),
        BackendKind::Document => Box::new(DocumentAdapter(shared)),
    }
}

struct Shared {
    llm: Arc<dyn LlmClient>,
    settings: DispatchSettings,
}

impl Shared {
    async fn describe(&self, handle: &ConnectionHandle) -> Result<SchemaDescriptor, DispatchError> {
        schema::describe(
            handle,
            self.settings.schema_sample_size,
            self.settings.query_timeout,
        )
        .await
    }

    async fn reason(
        &self,
        intent: &QueryIntent,
        context: Option<&SchemaDescriptor>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> Result<QueryPlan, DispatchError> {
        let source = statement_source(handle)?;
        let trace = reason(
            self.llm.as_ref(),
            source,
            &intent.text,
            context,
            &ReasoningOptions::from(&self.settings),
            cancel,
        )
        .await?;
        Ok(QueryPlan::Reasoned(trace))
    }

    async fn execute(&self, plan: QueryPlan, handle: &ConnectionHandle) -> Result<QueryResult, DispatchError> {
        executor::execute(plan, handle, self.settings.max_rows, self.settings.query_timeout).await
    }
}

fn statement_source(handle: &ConnectionHandle) -> Result<&dyn StatementSource, DispatchError> {
    match handle.connection() {
        Connection::Statement(source) => Ok(source.as_ref()),
        Connection::Document(_) => Err(DispatchError::Execution(format!(
            "{} does not accept statements",
            handle.label()
        ))),
    }
}

// ============================================================================
// Relational
// ============================================================================

/// SQL backends. The reasoning loop discovers tables itself, so no schema is
/// computed up front.
pub struct RelationalAdapter(Shared);

#[async_trait]
impl BackendAdapter for RelationalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    fn uses_schema(&self) -> bool {
        false
    }

    async fn describe_schema(&self, handle: &ConnectionHandle) -> Result<SchemaDescriptor, DispatchError> {
        self.0.describe(handle).await
    }

    async fn translate(
        &self,
        intent: &QueryIntent,
        _schema: Option<&SchemaDescriptor>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> Result<QueryPlan, DispatchError> {
        self.0.reason(intent, None, handle, cancel).await
    }

    async fn execute(&self, plan: QueryPlan, handle: &ConnectionHandle) -> Result<QueryResult, DispatchError> {
        self.0.execute(plan, handle).await
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Neo4j. Label properties are passed to the model as context.
pub struct GraphAdapter(Shared);

#[async_trait]
impl BackendAdapter for GraphAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Graph
    }

    fn uses_schema(&self) -> bool {
        true
    }

    async fn describe_schema(&self, handle: &ConnectionHandle) -> Result<SchemaDescriptor, DispatchError> {
        self.0.describe(handle).await
    }

    async fn translate(
        &self,
        intent: &QueryIntent,
        schema: Option<&SchemaDescriptor>,
        handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> Result<QueryPlan, DispatchError> {
        self.0.reason(intent, schema, handle, cancel).await
    }

    async fn execute(&self, plan: QueryPlan, handle: &ConnectionHandle) -> Result<QueryResult, DispatchError> {
        self.0.execute(plan, handle).await
    }
}

// ============================================================================
// Document
// ============================================================================

pub struct DocumentAdapter(Shared);

#[async_trait]
impl BackendAdapter for DocumentAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn uses_schema(&self) -> bool {
        true
    }

    async fn describe_schema(&self, handle: &ConnectionHandle) -> Result<SchemaDescriptor, DispatchError> {
        self.0.describe(handle).await
    }

    async fn translate(
        &self,
        intent: &QueryIntent,
        schema: Option<&SchemaDescriptor>,
        _handle: &ConnectionHandle,
        cancel: &CancellationToken,
    ) -> Result<QueryPlan, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }
        let empty = SchemaDescriptor::default();
        let plan = translate_document(
            self.0.llm.as_ref(),
            &intent.text,
            schema.unwrap_or(&empty),
            self.0.settings.reasoning_budget,
        )
        .await?;
        Ok(QueryPlan::Document(plan))
    }

    async fn execute(&self, plan: QueryPlan, handle: &ConnectionHandle) -> Result<QueryResult, DispatchError> {
        self.0.execute(plan, handle).await
    }
}
