//! Bounded reasoning loop for statement backends (SQL and Cypher).
//!
//! Each iteration asks the model for one JSON step: either a tool call or a
//! final answer. Tool results are appended to the transcript as observations.
//! The loop stops on a final answer, after `max_iterations` steps, when the
//! wall-clock budget runs out, or when the caller cancels.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backend::{Dialect, Record, Rows, StatementSource};
use crate::config::DispatchSettings;
use crate::error::{BackendError, DispatchError};
use crate::executor::within;
use crate::llm::{LlmClient, strip_markdown_fences};
use crate::schema::SchemaDescriptor;

// ============================================================================
// Options and Trace
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReasoningOptions {
    pub max_iterations: usize,
    pub budget: Duration,
    /// Deadline for each tool call.
    pub tool_timeout: Duration,
    pub max_rows: usize,
    pub observation_chars: usize,
}

impl From<&DispatchSettings> for ReasoningOptions {
    fn from(settings: &DispatchSettings) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            budget: settings.reasoning_budget,
            tool_timeout: settings.query_timeout,
            max_rows: settings.max_rows,
            observation_chars: settings.observation_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningStep {
    pub thought: String,
    pub action: String,
    pub action_input: String,
    pub observation: String,
}

/// Completed loop: the steps taken, the answer, and the rows of the last
/// successful `run_query`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReasoningTrace {
    pub steps: Vec<ReasoningStep>,
    pub final_answer: String,
    pub rows: Vec<Record>,
    pub truncated: bool,
}

// ============================================================================
// Step parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct StepReply {
    #[serde(default)]
    thought: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    action_input: Option<Value>,
    #[serde(default)]
    final_answer: Option<Value>,
}

#[derive(Debug, PartialEq)]
enum Step {
    Act {
        thought: String,
        tool: String,
        input: String,
    },
    Finish {
        thought: String,
        answer: String,
    },
}

fn value_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn parse_step(text: &str) -> Result<Step, String> {
    let cleaned = strip_markdown_fences(text);
    let reply: StepReply = match serde_json::from_str(&cleaned) {
        Ok(reply) => reply,
        // Tolerate prose around a single JSON object.
        Err(e) => match (cleaned.find('{'), cleaned.rfind('}')) {
            (Some(start), Some(end)) if start < end => {
                serde_json::from_str(&cleaned[start..=end]).map_err(|_| e.to_string())?
            }
            _ => return Err(e.to_string()),
        },
    };

    let thought = reply.thought.unwrap_or_default();
    if let Some(answer) = reply.final_answer {
        return Ok(Step::Finish {
            thought,
            answer: value_text(answer),
        });
    }
    match reply.action {
        Some(tool) if !tool.trim().is_empty() => Ok(Step::Act {
            thought,
            tool: tool.trim().to_string(),
            input: reply.action_input.map(value_text).unwrap_or_default(),
        }),
        _ => Err("missing \"action\" or \"final_answer\"".to_string()),
    }
}

// ============================================================================
// Prompts
// ============================================================================

fn system_prompt(dialect: Dialect, max_rows: usize) -> String {
    let noun = dialect.object_noun();
    let language = dialect.language();
    format!(
        r#"You answer questions about a database by querying it with {language}.

Work step by step. Each reply must be ONLY a JSON object (no markdown, no explanation), either a tool call:
{{"thought": "what you will do next", "action": "<tool>", "action_input": "<input>"}}
or, once you can answer:
{{"thought": "why you are done", "final_answer": "the answer in plain language"}}

Tools:
- list_{noun}s: list every {noun}. action_input is ignored.
- describe_{noun}: columns, types and a few sample rows of one {noun}. action_input is the {noun} name.
- run_query: run ONE read-only {language} statement and return up to {max_rows} rows. action_input is the statement.

Rules:
- Look at the relevant {noun}s before querying them.
- Only read. Statements that modify data are refused.
- If a tool reports an error, fix the statement and try again.
- Base the final answer on query results, not on guesses."#
    )
}

fn user_prompt(question: &str, context: Option<&SchemaDescriptor>, steps: &[ReasoningStep]) -> String {
    let mut prompt = format!("Question: {question}\n");
    if let Some(schema) = context.filter(|s| !s.is_empty()) {
        prompt.push_str(&format!("\nKnown properties:\n{}\n", schema.render()));
    }
    if !steps.is_empty() {
        prompt.push_str("\nPrevious steps:\n");
        for (i, step) in steps.iter().enumerate() {
            prompt.push_str(&format!(
                "\nStep {}\nThought: {}\nAction: {}\nAction input: {}\nObservation: {}\n",
                i + 1,
                step.thought,
                step.action,
                step.action_input,
                step.observation
            ));
        }
    }
    prompt.push_str("\nReply with your next step as a JSON object.");
    prompt
}

fn clip(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}\n... (output clipped)", &text[..cut]),
        None => text,
    }
}

fn render_rows(rows: &Rows) -> String {
    if rows.records.is_empty() {
        return "(no rows)".to_string();
    }
    let mut lines: Vec<String> = rows
        .records
        .iter()
        .map(|r| Value::Object(r.clone()).to_string())
        .collect();
    if rows.truncated {
        lines.push(format!("(only the first {} rows are shown)", rows.records.len()));
    }
    lines.join("\n")
}

// ============================================================================
// Loop
// ============================================================================

/// Answer `question` by letting the model drive `source` through the tools.
///
/// # Errors
///
/// - [`DispatchError::TranslationRejected`] when the iteration cap or time
///   budget is exhausted, or the model call fails.
/// - [`DispatchError::Connection`] / [`DispatchError::Timeout`] when a tool
///   call loses the backend or exceeds its deadline.
/// - [`DispatchError::Cancelled`] when `cancel` fires between iterations.
pub async fn reason(
    llm: &dyn LlmClient,
    source: &dyn StatementSource,
    question: &str,
    context: Option<&SchemaDescriptor>,
    options: &ReasoningOptions,
    cancel: &CancellationToken,
) -> Result<ReasoningTrace, DispatchError> {
    let dialect = source.dialect();
    let deadline = Instant::now() + options.budget;
    let budget_exhausted = || {
        DispatchError::TranslationRejected(format!(
            "time budget of {}s exhausted before a final answer",
            options.budget.as_secs_f64()
        ))
    };

    let system = system_prompt(dialect, options.max_rows);
    let mut trace = ReasoningTrace::default();

    for iteration in 1..=options.max_iterations {
        if cancel.is_cancelled() {
            info!("Reasoning cancelled after {} steps", trace.steps.len());
            return Err(DispatchError::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(budget_exhausted());
        }

        let prompt = user_prompt(question, context, &trace.steps);
        let completion = tokio::time::timeout_at(deadline, llm.complete(&system, &prompt))
            .await
            .map_err(|_| budget_exhausted())?
            .map_err(|e| DispatchError::TranslationRejected(format!("model call failed: {e}")))?;

        let (thought, tool, input) = match parse_step(&completion.text) {
            Ok(Step::Finish { thought, answer }) => {
                debug!("Step {iteration}: final answer");
                trace.steps.push(ReasoningStep {
                    thought,
                    action: "final_answer".into(),
                    action_input: String::new(),
                    observation: String::new(),
                });
                trace.final_answer = answer;
                return Ok(trace);
            }
            Ok(Step::Act {
                thought,
                tool,
                input,
            }) => (thought, tool, input),
            Err(reason) => {
                debug!("Step {iteration}: unparseable reply: {reason}");
                trace.steps.push(ReasoningStep {
                    thought: String::new(),
                    action: "invalid".into(),
                    action_input: String::new(),
                    observation: format!(
                        "Error: could not read your reply ({reason}). Reply with a single JSON object."
                    ),
                });
                continue;
            }
        };

        debug!("Step {iteration}: {tool}({input})");
        let observation = match run_tool(source, &tool, &input, options).await {
            Ok(ToolOutput::Text(text)) => text,
            Ok(ToolOutput::Rows(rows)) => {
                let text = render_rows(&rows);
                trace.truncated = rows.truncated;
                trace.rows = rows.records;
                text
            }
            Err(ToolError::Recoverable(e)) => format!("Error: {e}"),
            Err(ToolError::Fatal(e)) => return Err(e),
        };

        trace.steps.push(ReasoningStep {
            thought,
            action: tool,
            action_input: input,
            observation: clip(observation, options.observation_chars),
        });
    }

    Err(DispatchError::TranslationRejected(format!(
        "iteration limit of {} reached without a final answer",
        options.max_iterations
    )))
}

enum ToolOutput {
    Text(String),
    Rows(Rows),
}

enum ToolError {
    /// Reported back to the model.
    Recoverable(BackendError),
    /// Ends the loop.
    Fatal(DispatchError),
}

impl From<BackendError> for ToolError {
    fn from(err: BackendError) -> Self {
        if err.is_recoverable() {
            Self::Recoverable(err)
        } else {
            Self::Fatal(err.into())
        }
    }
}

impl From<DispatchError> for ToolError {
    fn from(err: DispatchError) -> Self {
        Self::Fatal(err)
    }
}

async fn run_tool(
    source: &dyn StatementSource,
    tool: &str,
    input: &str,
    options: &ReasoningOptions,
) -> Result<ToolOutput, ToolError> {
    let dialect = source.dialect();
    let noun = dialect.object_noun();
    let timeout = options.tool_timeout;

    if tool == format!("list_{noun}s") {
        let objects = within(timeout, source.list_objects()).await??;
        return Ok(ToolOutput::Text(if objects.is_empty() {
            format!("(no {noun}s)")
        } else {
            objects.join(", ")
        }));
    }
    if tool == format!("describe_{noun}") {
        let description = within(timeout, source.describe_object(input)).await??;
        return Ok(ToolOutput::Text(description.to_string()));
    }
    if tool == "run_query" {
        dialect.ensure_read_only(input)?;
        let rows = within(timeout, source.run_read_query(input, options.max_rows)).await??;
        return Ok(ToolOutput::Rows(rows));
    }

    Err(ToolError::Recoverable(BackendError::Rejected(format!(
        "unknown tool '{tool}'. Available: list_{noun}s, describe_{noun}, run_query"
    ))))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::backend::sqlite::{SqliteSource, create_sample_database};
    use crate::llm::{Completion, LlmError, MockLlmClient};

    fn options() -> ReasoningOptions {
        ReasoningOptions::from(&DispatchSettings::default())
    }

    fn act(tool: &str, input: &str) -> String {
        json!({ "thought": format!("use {tool}"), "action": tool, "action_input": input }).to_string()
    }

    fn finish(answer: &str) -> String {
        json!({ "thought": "done", "final_answer": answer }).to_string()
    }

    async fn sample_source() -> (SqliteSource, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_sample_database(&path).await.unwrap();
        (SqliteSource::open_read_only(&path).await.unwrap(), dir)
    }

    #[test]
    fn test_parse_step_variants() {
        assert_eq!(
            parse_step(&act("list_tables", "")).unwrap(),
            Step::Act {
                thought: "use list_tables".into(),
                tool: "list_tables".into(),
                input: String::new()
            }
        );
        assert_eq!(
            parse_step("```json\n{\"final_answer\": 3}\n```").unwrap(),
            Step::Finish {
                thought: String::new(),
                answer: "3".into()
            }
        );
        assert!(matches!(
            parse_step("Let me check.\n{\"action\": \"run_query\", \"action_input\": \"SELECT 1\"}"),
            Ok(Step::Act { .. })
        ));
        assert!(parse_step("I think the answer is 42").is_err());
        assert!(parse_step("{\"thought\": \"hmm\"}").is_err());
    }

    #[test]
    fn test_clip_respects_char_boundaries() {
        assert_eq!(clip("short".into(), 10), "short");
        let clipped = clip("ééééé".into(), 2);
        assert!(clipped.starts_with("éé\n"));
    }

    #[tokio::test]
    async fn test_describe_then_query_then_answer() {
        let (source, _dir) = sample_source().await;
        let llm = MockLlmClient::new(vec![
            act("describe_table", "STUDENT"),
            act("run_query", "SELECT NAME FROM STUDENT WHERE CLASS = 'AIML' ORDER BY NAME"),
            finish("Aditya, Kamlesh and Vaidehi are in AIML."),
        ]);

        let trace = reason(
            &llm,
            &source,
            "list students in class AIML",
            None,
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(trace.steps.len(), 3);
        assert!(trace.steps[0].observation.contains("MARKS INT"));
        assert_eq!(trace.rows.len(), 3);
        assert_eq!(trace.rows[0]["NAME"], "Aditya");
        assert!(!trace.truncated);
        assert_eq!(trace.final_answer, "Aditya, Kamlesh and Vaidehi are in AIML.");

        // Observations are fed back in the next prompt.
        let prompts = llm.prompts.lock().unwrap();
        assert!(prompts[2].contains("\"NAME\":\"Kamlesh\""));
    }

    #[tokio::test]
    async fn test_recoverable_errors_become_observations() {
        let (source, _dir) = sample_source().await;
        let llm = MockLlmClient::new(vec![
            "not json at all".into(),
            act("drop_everything", ""),
            act("run_query", "DELETE FROM STUDENT"),
            act("run_query", "SELECT * FROM courses"),
            act("describe_table", "courses"),
            finish("I could not find any courses."),
        ]);

        let trace = reason(&llm, &source, "who teaches?", None, &options(), &CancellationToken::new())
            .await
            .unwrap();

        let observations: Vec<&str> = trace.steps.iter().map(|s| s.observation.as_str()).collect();
        assert!(observations[0].contains("could not read your reply"));
        assert!(observations[1].contains("unknown tool"));
        assert!(observations[2].contains("read-only"));
        assert!(observations[3].starts_with("Error:"));
        assert!(observations[4].contains("Available: STUDENT"));
        assert!(trace.rows.is_empty());
    }

    #[tokio::test]
    async fn test_iteration_limit_rejected() {
        let (source, _dir) = sample_source().await;
        let llm = MockLlmClient::new(vec![act("list_tables", ""); 3]);
        let opts = ReasoningOptions {
            max_iterations: 3,
            ..options()
        };

        let err = reason(&llm, &source, "loop forever", None, &opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TranslationRejected(ref m) if m.contains("iteration limit")));
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_step() {
        let (source, _dir) = sample_source().await;
        let llm = MockLlmClient::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = reason(&llm, &source, "anything", None, &options(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
        assert_eq!(llm.calls(), 0);
    }

    struct SlowLlm;

    #[async_trait]
    impl LlmClient for SlowLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<Completion, LlmError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Completion {
                text: finish("too late"),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_budget_rejected() {
        let (source, _dir) = sample_source().await;
        let opts = ReasoningOptions {
            budget: Duration::from_secs(5),
            ..options()
        };

        let err = reason(&SlowLlm, &source, "slow", None, &opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::TranslationRejected(ref m) if m.contains("time budget")));
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn complete(&self, _system: &str, _user: &str) -> Result<Completion, LlmError> {
            Err(LlmError::Http("503 Service Unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_model_failure_rejected() {
        let (source, _dir) = sample_source().await;
        let err = reason(
            &FailingLlm,
            &source,
            "anything",
            None,
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DispatchError::TranslationRejected(ref m) if m.contains("503")));
    }

    #[tokio::test]
    async fn test_schema_context_in_prompt() {
        let (source, _dir) = sample_source().await;
        let llm = Arc::new(MockLlmClient::new(vec![finish("ok")]));
        let schema = crate::schema::infer_document_schema(&[bson::doc! { "Person.name": "x" }]);

        reason(
            llm.as_ref(),
            &source,
            "who?",
            Some(&schema),
            &options(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(llm.prompts.lock().unwrap()[0].contains("Person.name: string"));
    }
}
