//! Neo4j driver over the HTTP transactional Cypher endpoint
//! (`POST {uri}/db/{database}/tx/commit`).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{
    ColumnInfo, Dialect, ObjectDescription, Record, Rows, StatementSource, match_object,
    quote_ident,
};
use crate::config::GraphConfig;
use crate::error::BackendError;

const SAMPLE_ROWS: usize = 3;

pub struct Neo4jSource {
    endpoint: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    statements: Vec<Statement<'a>>,
}

#[derive(Debug, Serialize)]
struct Statement<'a> {
    statement: &'a str,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<Neo4jError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    columns: Vec<String>,
    data: Vec<DataRow>,
}

#[derive(Debug, Deserialize)]
struct DataRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct Neo4jError {
    code: String,
    message: String,
}

impl Neo4jSource {
    pub async fn connect(config: &GraphConfig) -> Result<Self, BackendError> {
        let base = config.uri.trim().trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(BackendError::Connection(format!(
                "Neo4j URI must be an http(s) URL such as http://localhost:7474, got '{base}'"
            )));
        }

        let source = Self {
            endpoint: format!("{base}/db/{}/tx/commit", config.database),
            username: config.username.clone(),
            password: config.password.clone(),
            client: reqwest::Client::new(),
        };

        source
            .run("RETURN 1 AS ok", json!({}))
            .await
            .map_err(|e| BackendError::Connection(format!("Failed to connect to Neo4j: {e}")))?;
        Ok(source)
    }

    async fn run(&self, statement: &str, parameters: Value) -> Result<StatementResult, BackendError> {
        let body = CommitRequest {
            statements: vec![Statement {
                statement,
                parameters,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("access-mode", "READ")
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Connection(format!("Neo4j: {e}")))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BackendError::Connection(
                    "Neo4j: authentication failed".into(),
                ));
            }
            status if !status.is_success() => {
                return Err(BackendError::Connection(format!("Neo4j: HTTP {status}")));
            }
            _ => {}
        }

        let parsed: CommitResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Connection(format!("Neo4j: bad response: {e}")))?;
        into_result(parsed)
    }

    async fn labels(&self) -> Result<Vec<String>, BackendError> {
        let result = self
            .run("CALL db.labels() YIELD label RETURN label ORDER BY label", json!({}))
            .await?;
        Ok(result
            .data
            .into_iter()
            .filter_map(|r| r.row.into_iter().next())
            .filter_map(|v| v.as_str().map(String::from))
            .collect())
    }
}

fn into_result(mut response: CommitResponse) -> Result<StatementResult, BackendError> {
    if let Some(err) = response.errors.into_iter().next() {
        let msg = format!("Neo4j {}: {}", err.code, err.message);
        return Err(if err.code.contains("Security") {
            BackendError::Connection(msg)
        } else {
            BackendError::Query(msg)
        });
    }
    if response.results.is_empty() {
        return Err(BackendError::Query("Neo4j returned no result".into()));
    }
    Ok(response.results.remove(0))
}

/// Bound a query server-side to `max_rows + 1` rows by running it as a
/// subquery. Standalone procedure calls are metadata-sized and left alone.
fn capped(statement: &str, max_rows: usize) -> String {
    let body = statement.trim().trim_end_matches(';').trim_end();
    let is_procedure = body
        .get(..4)
        .is_some_and(|head| head.eq_ignore_ascii_case("CALL"))
        && !body[4..].trim_start().starts_with('{');
    if is_procedure {
        return body.to_string();
    }
    format!("CALL {{\n{body}\n}}\nRETURN * LIMIT {}", max_rows + 1)
}

fn to_rows(result: StatementResult, max_rows: usize) -> Rows {
    let truncated = result.data.len() > max_rows;
    let records = result
        .data
        .into_iter()
        .take(max_rows)
        .map(|data| {
            result
                .columns
                .iter()
                .cloned()
                .zip(data.row)
                .collect::<Record>()
        })
        .collect();
    Rows { records, truncated }
}

#[async_trait]
impl StatementSource for Neo4jSource {
    fn dialect(&self) -> Dialect {
        Dialect::Cypher
    }

    async fn list_objects(&self) -> Result<Vec<String>, BackendError> {
        self.labels().await
    }

    async fn describe_object(&self, name: &str) -> Result<ObjectDescription, BackendError> {
        let labels = self.labels().await?;
        let label = match_object(&labels, name, "label")?;

        let props = self
            .run(
                "CALL db.schema.nodeTypeProperties() \
                 YIELD nodeLabels, propertyName, propertyTypes \
                 WHERE $label IN nodeLabels AND propertyName IS NOT NULL \
                 RETURN propertyName, propertyTypes",
                json!({ "label": label }),
            )
            .await?;
        let columns = props
            .data
            .into_iter()
            .filter_map(|data| {
                let mut cells = data.row.into_iter();
                let name = cells.next()?.as_str()?.to_string();
                let types = cells
                    .next()
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|t| t.as_str().map(String::from))
                    .collect::<Vec<_>>()
                    .join("|");
                Some(ColumnInfo {
                    name,
                    data_type: types,
                })
            })
            .collect();

        let sample = self
            .run(
                &format!(
                    "MATCH (n:{}) RETURN n LIMIT {SAMPLE_ROWS}",
                    quote_ident(&label, '`')
                ),
                json!({}),
            )
            .await?;

        Ok(ObjectDescription {
            definition: Some(format!("(:{label})")),
            name: label,
            columns,
            sample_rows: to_rows(sample, SAMPLE_ROWS).records,
        })
    }

    async fn run_read_query(&self, statement: &str, max_rows: usize) -> Result<Rows, BackendError> {
        let result = self.run(&capped(statement, max_rows), json!({})).await?;
        Ok(to_rows(result, max_rows))
    }

    async fn close(&self) {}
}
