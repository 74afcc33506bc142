//! Natural-language intent to validated query plans.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent::ReasoningTrace;
use crate::config::BackendKind;
use crate::error::DispatchError;
use crate::filter::DocumentFilter;
use crate::llm::LlmClient;
use crate::schema::SchemaDescriptor;

/// Phrases that select every document without asking the model.
const MATCH_ALL_PHRASES: &[&str] = &["all the data", "fetch all"];

#[derive(Debug, Clone, PartialEq)]
pub struct QueryIntent {
    pub text: String,
    pub kind: BackendKind,
}

impl QueryIntent {
    pub fn new(text: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            text: text.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentPlan {
    MatchAll,
    Filter(DocumentFilter),
}

impl fmt::Display for DocumentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MatchAll => f.write_str("{}"),
            Self::Filter(filter) => write!(f, "{filter}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Relational and graph backends: the completed reasoning loop.
    Reasoned(ReasoningTrace),
    Document(DocumentPlan),
}

pub fn is_match_all_intent(text: &str) -> bool {
    let lowered = text.to_lowercase();
    MATCH_ALL_PHRASES.iter().any(|p| lowered.contains(p))
}

const DOCUMENT_SYSTEM_PROMPT: &str = r#"You are a MongoDB query generator. Given a collection schema and a natural language request, produce the filter document to pass to collection.find().

Respond with ONLY a JSON object (no markdown, no explanation, no function call).

Allowed:
- field equality: {"field": value}
- dotted paths for embedded fields: {"address.city": "Paris"}
- operators on a field: $eq, $ne, $gt, $gte, $lt, $lte (scalar), $in, $nin (array of scalars), $exists (boolean), $regex (string) with optional $options (i, m, s, x)
- $and / $or with an array of filters
- {} to match every document

Values must be JSON scalars: strings, numbers, true, false or null."#;

/// Translate a request against a document collection.
///
/// Match-all phrasing short-circuits without a model call. Otherwise the
/// model output, which must arrive within `budget`, must parse as a
/// [`DocumentFilter`].
pub async fn translate_document(
    llm: &dyn LlmClient,
    text: &str,
    schema: &SchemaDescriptor,
    budget: Duration,
) -> Result<DocumentPlan, DispatchError> {
    if is_match_all_intent(text) {
        debug!("Match-all intent: {text:?}");
        return Ok(DocumentPlan::MatchAll);
    }

    let user_msg = format!(
        "Collection schema (field: type):\n{}\n\nRequest: {text}",
        schema.render()
    );
    let completion = tokio::time::timeout(budget, llm.complete(DOCUMENT_SYSTEM_PROMPT, &user_msg))
        .await
        .map_err(|_| {
            DispatchError::TranslationRejected(format!(
                "time budget of {}s exhausted before a filter was generated",
                budget.as_secs_f64()
            ))
        })?
        .map_err(|e| DispatchError::TranslationRejected(format!("model call failed: {e}")))?;

    let filter = DocumentFilter::parse(&completion.text).map_err(|e| {
        warn!("Rejected generated filter {:?}: {e}", completion.text);
        DispatchError::TranslationRejected(format!("generated filter is invalid: {e}"))
    })?;

    if filter.is_match_all() {
        Ok(DocumentPlan::MatchAll)
    } else {
        Ok(DocumentPlan::Filter(filter))
    }
}

// ============================================================================
// Tests
// ============================================================================
