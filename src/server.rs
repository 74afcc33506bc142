use std::path::PathBuf;
use std::sync::Arc;

use rmcp::handler::server::{router::tool::ToolRouter, wrapper::Parameters};
use rmcp::model::{CallToolResult, Content, ServerCapabilities, ServerInfo};
use rmcp::{ErrorData, ServerHandler, tool, tool_handler, tool_router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::ConnectionParams;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, ErrorKind};

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, rmcp::schemars::JsonSchema)]
pub struct AskParams {
    #[schemars(
        description = "Question in plain language, e.g. 'list students in class AIML'. Say 'fetch all' to return a whole collection."
    )]
    pub question: String,
}

// ---------------------------------------------------------------------------
// MCP Server
// ---------------------------------------------------------------------------

/// One MCP session over one [`Dispatcher`].
#[derive(Clone)]
pub struct QueryServer {
    dispatcher: Arc<Mutex<Dispatcher>>,
    sample_db: PathBuf,
    tool_router: ToolRouter<Self>,
}

fn to_json<T: Serialize>(value: &T) -> Result<CallToolResult, ErrorData> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| ErrorData::internal_error(format!("Serialize error: {e}"), None))?;
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn dispatch_error(err: DispatchError) -> ErrorData {
    match err.kind() {
        ErrorKind::ConfigIncomplete => ErrorData::invalid_params(err.to_string(), None),
        _ => ErrorData::internal_error(err.to_string(), None),
    }
}

#[tool_router]
impl QueryServer {
    pub fn new(dispatcher: Dispatcher, sample_db: PathBuf) -> Self {
        Self {
            dispatcher: Arc::new(Mutex::new(dispatcher)),
            sample_db,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(
        description = "Choose the database to query. backend is one of sqlite (the bundled sample, default), mysql (host, user, password, database), neo4j (uri as http://host:7474, user, password, optional database) or mongodb (uri, database, collection)."
    )]
    async fn select_backend(
        &self,
        Parameters(p): Parameters<ConnectionParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let config = p.into_config(self.sample_db.clone());
        let label = config.label();

        let mut dispatcher = self.dispatcher.lock().await;
        dispatcher
            .select_backend(config)
            .await
            .map_err(dispatch_error)?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "Connected to {label}. Ask a question with the 'ask' tool."
        ))]))
    }

    #[tool(
        description = "Ask a question about the selected database. Returns JSON with status 'answer' (answer text plus the records read) or 'error' (kind and message)."
    )]
    async fn ask(&self, Parameters(p): Parameters<AskParams>) -> Result<CallToolResult, ErrorData> {
        let question = p.question.trim();
        if question.is_empty() {
            return Err(ErrorData::invalid_params("'question' must not be empty", None));
        }
        let outcome = self.dispatcher.lock().await.ask(question).await;
        to_json(&outcome)
    }

    #[tool(description = "Show the conversation so far as a JSON array of {role, content} turns.")]
    async fn history(&self) -> Result<CallToolResult, ErrorData> {
        let dispatcher = self.dispatcher.lock().await;
        to_json(&dispatcher.history())
    }

    #[tool(description = "Clear the conversation, leaving only the greeting.")]
    async fn reset_history(&self) -> Result<CallToolResult, ErrorData> {
        let mut dispatcher = self.dispatcher.lock().await;
        to_json(&dispatcher.reset_history())
    }

    #[tool(
        description = "Describe the selected database as a JSON object mapping field names (table.column, Label.property or document field) to types. 'mixed' marks fields seen with more than one type."
    )]
    async fn describe_schema(&self) -> Result<CallToolResult, ErrorData> {
        let schema = self
            .dispatcher
            .lock()
            .await
            .describe_schema()
            .await
            .map_err(dispatch_error)?;
        to_json(&schema)
    }
}

#[tool_handler]
impl ServerHandler for QueryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Natural-language questions over SQLite, MySQL, Neo4j and MongoDB. Call \
                 'select_backend' first, then 'ask'. 'describe_schema' shows the fields the \
                 database exposes; 'history' and 'reset_history' manage the conversation."
                    .to_string(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::create_sample_database;
    use crate::cache::ConnectionCache;
    use crate::config::{BackendChoice, DispatchSettings};
    use crate::llm::{LlmClient, MockLlmClient};
    use crate::ttl::CONNECTION_DEFAULT_TTL;
    use serde_json::{Value, json};

    fn setup_server(sample_db: PathBuf, mock_responses: Vec<String>) -> QueryServer {
        let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::new(mock_responses));
        let dispatcher = Dispatcher::new(
            Arc::new(ConnectionCache::native(CONNECTION_DEFAULT_TTL)),
            llm,
            DispatchSettings::default(),
        );
        QueryServer::new(dispatcher, sample_db)
    }

    fn text(result: &CallToolResult) -> String {
        result.content[0].raw.as_text().unwrap().text.clone()
    }

    async fn sample_db() -> (PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_sample_database(&path).await.unwrap();
        (path, dir)
    }

    #[tokio::test]
    async fn test_select_default_sample_and_ask() {
        let (path, _dir) = sample_db().await;
        let server = setup_server(
            path,
            vec![
                json!({"thought": "count", "action": "run_query", "action_input": "SELECT COUNT(*) AS n FROM STUDENT"})
                    .to_string(),
                json!({"thought": "done", "final_answer": "There are 5 students."}).to_string(),
            ],
        );

        let result = server
            .select_backend(Parameters(ConnectionParams::default()))
            .await
            .unwrap();
        assert!(text(&result).starts_with("Connected to sqlite:"));

        let result = server
            .ask(Parameters(AskParams {
                question: "how many students are there?".into(),
            }))
            .await
            .unwrap();
        let outcome: Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(outcome["status"], "answer");
        assert_eq!(outcome["answer"], "There are 5 students.");
        assert_eq!(outcome["result"]["records"][0]["n"], 5);
    }

    #[tokio::test]
    async fn test_select_incomplete_mysql_is_invalid_params() {
        let (path, _dir) = sample_db().await;
        let server = setup_server(path, vec![]);

        let err = server
            .select_backend(Parameters(ConnectionParams {
                backend: Some(BackendChoice::Mysql),
                host: Some("localhost".into()),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert!(err.message.contains("user"));
        assert!(err.message.contains("database"));
    }

    #[tokio::test]
    async fn test_ask_before_select_reports_error_outcome() {
        let (path, _dir) = sample_db().await;
        let server = setup_server(path, vec![]);

        let result = server
            .ask(Parameters(AskParams {
                question: "anything".into(),
            }))
            .await
            .unwrap();
        let outcome: Value = serde_json::from_str(&text(&result)).unwrap();
        assert_eq!(outcome["status"], "error");
        assert_eq!(outcome["kind"], "ConfigIncomplete");

        let history: Value = serde_json::from_str(&text(&server.history().await.unwrap())).unwrap();
        assert_eq!(history.as_array().unwrap().len(), 3);

        let reset: Value =
            serde_json::from_str(&text(&server.reset_history().await.unwrap())).unwrap();
        assert_eq!(
            reset,
            json!([{ "role": "assistant", "content": "How can I help you?" }])
        );
    }

    #[tokio::test]
    async fn test_ask_rejects_empty_question() {
        let (path, _dir) = sample_db().await;
        let server = setup_server(path, vec![]);
        let err = server
            .ask(Parameters(AskParams {
                question: "   ".into(),
            }))
            .await
            .unwrap_err();
        assert!(err.message.contains("question"));
    }

    #[tokio::test]
    async fn test_describe_schema_tool() {
        let (path, _dir) = sample_db().await;
        let server = setup_server(path, vec![]);

        assert!(server.describe_schema().await.is_err());

        server
            .select_backend(Parameters(ConnectionParams::default()))
            .await
            .unwrap();
        let schema: Value =
            serde_json::from_str(&text(&server.describe_schema().await.unwrap())).unwrap();
        assert_eq!(schema["STUDENT.NAME"], "string");
        assert_eq!(schema["STUDENT.MARKS"], "int");
    }
}
