//! Session façade: backend selection, question routing and history.
//!
//! ```text
//! Unconfigured ──select_backend──▶ BackendSelected ──ok──▶ Ready ◀──┐
//!                                         │                 │        │
//!                                       error              ask      done / error
//!                                         ▼                 ▼        │
//!                                      Failed ◀─lost conn─ Querying ─┘
//! ```

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{BackendAdapter, adapter_for};
use crate::cache::{ConnectionCache, ConnectionHandle};
use crate::config::{BackendConfig, BackendKind, DispatchSettings};
use crate::conversation::{Conversation, ConversationTurn};
use crate::error::{DispatchError, ErrorKind};
use crate::executor::QueryResult;
use crate::llm::LlmClient;
use crate::schema::SchemaDescriptor;
use crate::translate::QueryIntent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unconfigured,
    BackendSelected,
    Ready,
    Querying,
    /// Configuration or connection failed; a new `select_backend` is needed.
    Failed,
}

/// What a caller gets back from [`Dispatcher::ask`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueryOutcome {
    Answer {
        answer: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<QueryResult>,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl QueryOutcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Answer { .. } => None,
            Self::Error { kind, .. } => Some(*kind),
        }
    }
}

struct ActiveBackend {
    config: BackendConfig,
    adapter: Box<dyn BackendAdapter>,
    handle: Arc<ConnectionHandle>,
    /// Schema for `handle`; cleared whenever the handle is rebuilt.
    schema: Option<SchemaDescriptor>,
}

impl ActiveBackend {
    async fn schema(&mut self) -> Result<&SchemaDescriptor, DispatchError> {
        if self.schema.is_none() {
            self.schema = Some(self.adapter.describe_schema(&self.handle).await?);
        }
        self.schema
            .as_ref()
            .ok_or_else(|| DispatchError::Execution("schema unavailable".into()))
    }
}

pub struct Dispatcher {
    cache: Arc<ConnectionCache>,
    llm: Arc<dyn LlmClient>,
    settings: DispatchSettings,
    state: SessionState,
    active: Option<ActiveBackend>,
    conversation: Conversation,
}

impl Dispatcher {
    pub fn new(cache: Arc<ConnectionCache>, llm: Arc<dyn LlmClient>, settings: DispatchSettings) -> Self {
        Self {
            cache,
            llm,
            settings,
            state: SessionState::Unconfigured,
            active: None,
            conversation: Conversation::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Label of the active backend, without credentials.
    pub fn active_backend(&self) -> Option<String> {
        self.active.as_ref().map(|a| a.config.label())
    }

    pub fn history(&self) -> &[ConversationTurn] {
        self.conversation.history()
    }

    pub fn reset_history(&mut self) -> &[ConversationTurn] {
        self.conversation.reset()
    }

    /// Validate `config`, connect, and (for document stores) describe the
    /// schema. On failure the session is left `Failed`.
    pub async fn select_backend(&mut self, config: BackendConfig) -> Result<(), DispatchError> {
        info!("Selecting {}", config.label());
        self.active = None;
        self.state = SessionState::BackendSelected;

        match self.connect(config).await {
            Ok(active) => {
                self.active = Some(active);
                self.state = SessionState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!("Backend selection failed: {e}");
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn connect(&self, config: BackendConfig) -> Result<ActiveBackend, DispatchError> {
        config.validate()?;
        let handle = self.cache.get_or_create(&config).await?;
        let adapter = adapter_for(config.kind(), self.llm.clone(), &self.settings);

        let mut active = ActiveBackend {
            config,
            adapter,
            handle,
            schema: None,
        };
        if active.adapter.kind() == BackendKind::Document {
            active.schema().await?;
        }
        Ok(active)
    }

    pub async fn ask(&mut self, text: &str) -> QueryOutcome {
        self.ask_with_cancel(text, &CancellationToken::new()).await
    }

    /// Answer one question. Always records the user turn and exactly one
    /// assistant turn, the answer or an `Error: ...` message.
    pub async fn ask_with_cancel(&mut self, text: &str, cancel: &CancellationToken) -> QueryOutcome {
        self.conversation.append(ConversationTurn::user(text));

        if self.state != SessionState::Ready {
            return self.record_error(DispatchError::NoBackend);
        }

        self.state = SessionState::Querying;
        match self.run(text, cancel).await {
            Ok(result) => {
                self.state = SessionState::Ready;
                let answer = result.summary.clone().unwrap_or_default();
                self.conversation.append(ConversationTurn::assistant(answer.clone()));
                QueryOutcome::Answer {
                    answer,
                    result: Some(result),
                }
            }
            Err(e) => {
                self.settle_after(&e).await;
                self.record_error(e)
            }
        }
    }

    /// Schema of the active backend, computed once per connection.
    pub async fn describe_schema(&mut self) -> Result<SchemaDescriptor, DispatchError> {
        if self.state != SessionState::Ready {
            return Err(DispatchError::NoBackend);
        }
        let described = async {
            let active = self.refresh().await?;
            active.schema().await.cloned()
        }
        .await;
        if let Err(e) = &described {
            self.settle_after(e).await;
        }
        described
    }

    async fn run(&mut self, text: &str, cancel: &CancellationToken) -> Result<QueryResult, DispatchError> {
        let active = self.refresh().await?;
        if active.adapter.uses_schema() {
            active.schema().await?;
        }

        let intent = QueryIntent::new(text, active.adapter.kind());
        let plan = active
            .adapter
            .translate(&intent, active.schema.as_ref(), &active.handle, cancel)
            .await?;
        active.adapter.execute(plan, &active.handle).await
    }

    /// Look the connection up again; an expired one is rebuilt by the cache.
    async fn refresh(&mut self) -> Result<&mut ActiveBackend, DispatchError> {
        let active = self.active.as_mut().ok_or(DispatchError::NoBackend)?;
        let handle = self.cache.get_or_create(&active.config).await?;
        if handle.id() != active.handle.id() {
            debug!("Connection to {} was rebuilt, dropping cached schema", handle.label());
            active.handle = handle;
            active.schema = None;
        }
        Ok(active)
    }

    async fn settle_after(&mut self, err: &DispatchError) {
        if err.kind() == ErrorKind::ConnectionError {
            if let Some(active) = self.active.take() {
                self.cache.invalidate(&active.config).await;
            }
            self.state = SessionState::Failed;
        } else {
            self.state = SessionState::Ready;
        }
    }

    fn record_error(&mut self, err: DispatchError) -> QueryOutcome {
        warn!("Question failed: {err}");
        let message = err.to_string();
        self.conversation
            .append(ConversationTurn::assistant(format!("Error: {message}")));
        QueryOutcome::Error {
            kind: err.kind(),
            message,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
