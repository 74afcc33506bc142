//! Backend drivers: one per concrete engine, behind two interfaces.
//!
//! `Statement` sources take textual statements (SQL or Cypher) and are driven
//! by the reasoning agent. `Document` sources take structured filters and are
//! driven by the document translator.

pub mod mongo;
pub mod mysql;
pub mod neo4j;
pub mod sqlite;

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use futures::{Stream, TryStreamExt};
use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::config::{BackendConfig, BackendKind, RelationalConfig};
use crate::error::BackendError;

/// One result row or document: field name → value, in column order.
pub type Record = serde_json::Map<String, Value>;

/// Rows returned by a bounded read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub records: Vec<Record>,
    /// More rows were available than the caller asked for.
    pub truncated: bool,
}

/// Pull at most `max_rows + 1` items from a row stream, converting the first
/// `max_rows`. The rest of the stream is never read.
pub(crate) async fn take_capped<S, T, E>(
    stream: S,
    max_rows: usize,
    mut convert: impl FnMut(T) -> Record,
) -> Result<Rows, E>
where
    S: Stream<Item = Result<T, E>>,
{
    futures::pin_mut!(stream);
    let mut out = Rows::default();
    while let Some(item) = stream.try_next().await? {
        if out.records.len() == max_rows {
            out.truncated = true;
            break;
        }
        out.records.push(convert(item));
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// Type as declared by the backend (`VARCHAR(25)`, `String|Long`, ...).
    pub data_type: String,
}

/// Metadata for one table or node label.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescription {
    pub name: String,
    /// Native definition, e.g. the `CREATE TABLE` statement.
    pub definition: Option<String>,
    pub columns: Vec<ColumnInfo>,
    pub sample_rows: Vec<Record>,
}

impl fmt::Display for ObjectDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.definition {
            Some(def) => writeln!(f, "{}", def.trim())?,
            None => writeln!(f, "{}", self.name)?,
        }
        writeln!(f, "Columns:")?;
        for col in &self.columns {
            writeln!(f, "  {} {}", col.name, col.data_type)?;
        }
        if !self.sample_rows.is_empty() {
            writeln!(f, "{} sample rows:", self.sample_rows.len())?;
            for row in &self.sample_rows {
                writeln!(f, "  {}", Value::Object(row.clone()))?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// Dialects and read-only guards
// ============================================================================

/// Statement language spoken by a statement source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Mysql,
    Cypher,
}

impl Dialect {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Sqlite | Self::Mysql => BackendKind::Relational,
            Self::Cypher => BackendKind::Graph,
        }
    }

    pub fn language(&self) -> &'static str {
        match self {
            Self::Sqlite => "SQLite SQL",
            Self::Mysql => "MySQL SQL",
            Self::Cypher => "Neo4j Cypher",
        }
    }

    /// What the listable objects are called.
    pub fn object_noun(&self) -> &'static str {
        match self {
            Self::Sqlite | Self::Mysql => "table",
            Self::Cypher => "label",
        }
    }

    /// Refuse anything that could modify the backend.
    pub fn ensure_read_only(&self, statement: &str) -> Result<(), BackendError> {
        match self {
            Self::Sqlite | Self::Mysql => ensure_read_only_sql(statement),
            Self::Cypher => ensure_read_only_cypher(statement),
        }
    }
}

static SQL_COMMENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)--[^\n]*|/\*.*?\*/").expect("valid regex"));

static QUOTED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"'(?:[^'\\]|\\.|'')*'|"(?:[^"\\]|\\.|"")*""#).expect("valid regex")
});

static SQL_WRITES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|MERGE|UPSERT|DROP|ALTER|CREATE|TRUNCATE|RENAME|GRANT|REVOKE|ATTACH|DETACH|VACUUM|REINDEX|CALL|LOCK|HANDLER)\b|\bINTO\s+(OUT|DUMP)FILE\b|\bLOAD\s+DATA\b",
    )
    .expect("valid regex")
});

static CYPHER_WRITES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(CREATE|MERGE|DELETE|DETACH|SET|REMOVE|DROP|FOREACH)\b|\bLOAD\s+CSV\b")
        .expect("valid regex")
});

static CYPHER_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCALL\s+([A-Za-z_`][\w.`]*)").expect("valid regex")
});

/// Procedures that only read metadata. Anything else reached through `CALL`
/// (APOC, `dbms.*`, label and index management) is refused.
const CYPHER_READ_PROCEDURES: &[&str] = &[
    "db.labels",
    "db.relationshiptypes",
    "db.propertykeys",
    "db.schema.nodetypeproperties",
    "db.schema.reltypeproperties",
    "db.schema.visualization",
];

const SQL_READ_KEYWORDS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA"];

/// Remove comments and the contents of string literals so keyword scans
/// only see statement structure.
fn scrub(statement: &str) -> String {
    let no_literals = QUOTED.replace_all(statement, "''");
    SQL_COMMENTS.replace_all(&no_literals, " ").into_owned()
}

fn single_statement(scrubbed: &str) -> Result<&str, BackendError> {
    let body = scrubbed.trim().trim_end_matches(';').trim();
    if body.is_empty() {
        return Err(BackendError::Rejected("Empty statement".into()));
    }
    if body.contains(';') {
        return Err(BackendError::Rejected(
            "Only a single statement is allowed".into(),
        ));
    }
    Ok(body)
}

pub fn ensure_read_only_sql(statement: &str) -> Result<(), BackendError> {
    let scrubbed = scrub(statement);
    let body = single_statement(&scrubbed)?;

    let first = body
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    if !SQL_READ_KEYWORDS.contains(&first.as_str()) {
        return Err(BackendError::Rejected(format!(
            "Only read-only statements are allowed, got {first}"
        )));
    }
    if first == "PRAGMA" && body.contains('=') {
        return Err(BackendError::Rejected(
            "PRAGMA assignments are not allowed".into(),
        ));
    }
    if let Some(m) = SQL_WRITES.find(body) {
        return Err(BackendError::Rejected(format!(
            "Only read-only statements are allowed, found {}",
            m.as_str().to_uppercase()
        )));
    }
    Ok(())
}

pub fn ensure_read_only_cypher(statement: &str) -> Result<(), BackendError> {
    let scrubbed = scrub(statement);
    let body = single_statement(&scrubbed)?;
    if let Some(m) = CYPHER_WRITES.find(body) {
        return Err(BackendError::Rejected(format!(
            "Only read-only Cypher is allowed, found {}",
            m.as_str().to_uppercase()
        )));
    }
    for call in CYPHER_CALL.captures_iter(body) {
        let procedure = call[1].replace('`', "");
        if !CYPHER_READ_PROCEDURES.contains(&procedure.to_lowercase().as_str()) {
            return Err(BackendError::Rejected(format!(
                "Procedure {procedure} is not allowed; only db.labels, db.relationshipTypes, \
                 db.propertyKeys and db.schema.* may be called"
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Source interfaces
// ============================================================================

/// A backend queried with textual statements.
#[async_trait]
pub trait StatementSource: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Tables (relational) or node labels (graph).
    async fn list_objects(&self) -> Result<Vec<String>, BackendError>;

    async fn describe_object(&self, name: &str) -> Result<ObjectDescription, BackendError>;

    /// Run a statement that has already passed [`Dialect::ensure_read_only`],
    /// keeping at most `max_rows` rows.
    async fn run_read_query(&self, statement: &str, max_rows: usize)
    -> Result<Rows, BackendError>;

    /// Release the underlying resources.
    async fn close(&self);
}

/// A schemaless collection queried with structured filters.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// `database.collection`.
    fn namespace(&self) -> String;

    /// Up to `limit` documents in natural order.
    async fn sample(&self, limit: usize) -> Result<Vec<Document>, BackendError>;

    async fn find(&self, filter: Document, limit: usize) -> Result<Vec<Document>, BackendError>;

    async fn close(&self);
}

/// A live backend session.
pub enum Connection {
    Statement(Box<dyn StatementSource>),
    Document(Box<dyn DocumentSource>),
}

impl Connection {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Statement(source) => source.dialect().kind(),
            Self::Document(_) => BackendKind::Document,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Statement(source) => source.close().await,
            Self::Document(source) => source.close().await,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Statement(source) => write!(f, "Connection::Statement({:?})", source.dialect()),
            Self::Document(source) => write!(f, "Connection::Document({})", source.namespace()),
        }
    }
}

/// Convert a BSON document into a JSON record (relaxed extended JSON).
pub fn document_to_record(doc: Document) -> Record {
    match Bson::Document(doc).into_relaxed_extjson() {
        Value::Object(map) => map,
        _ => Record::new(),
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Builds a live connection for a config. Used by the connection cache.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &BackendConfig) -> Result<Connection, BackendError>;
}

/// Connects to real backends.
#[derive(Debug, Clone)]
pub struct NativeConnector {
    pub connect_timeout: Duration,
}

impl Default for NativeConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl Connector for NativeConnector {
    async fn connect(&self, config: &BackendConfig) -> Result<Connection, BackendError> {
        info!("Connecting to {}", config.label());
        let connect = async {
            let conn = match config {
                BackendConfig::Relational(RelationalConfig::Sqlite { path }) => {
                    Connection::Statement(Box::new(sqlite::SqliteSource::open_read_only(path).await?))
                }
                BackendConfig::Relational(RelationalConfig::Mysql(c)) => {
                    Connection::Statement(Box::new(mysql::MysqlSource::connect(c).await?))
                }
                BackendConfig::Graph(c) => {
                    Connection::Statement(Box::new(neo4j::Neo4jSource::connect(c).await?))
                }
                BackendConfig::Document(c) => {
                    Connection::Document(Box::new(mongo::MongoSource::connect(c).await?))
                }
            };
            Ok(conn)
        };

        tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| {
                BackendError::Connection(format!(
                    "Timed out connecting to {} after {}s",
                    config.label(),
                    self.connect_timeout.as_secs()
                ))
            })?
    }
}

/// Quote an identifier with the given quote character, doubling embedded
/// quotes.
pub(crate) fn quote_ident(name: &str, quote: char) -> String {
    let escaped = name.replace(quote, &format!("{quote}{quote}"));
    format!("{quote}{escaped}{quote}")
}

/// Resolve a model-supplied object name against the real list, ignoring case.
pub(crate) fn match_object(objects: &[String], name: &str, noun: &str) -> Result<String, BackendError> {
    let wanted = name.trim().trim_matches(|c| c == '"' || c == '`' || c == '\'');
    objects
        .iter()
        .find(|o| o.as_str() == wanted)
        .or_else(|| objects.iter().find(|o| o.eq_ignore_ascii_case(wanted)))
        .cloned()
        .ok_or_else(|| {
            BackendError::Query(format!(
                "Unknown {noun} '{wanted}'. Available: {}",
                objects.join(", ")
            ))
        })
}

// ============================================================================
// Test doubles
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    // --- SQL guard ---

    #[test]
    fn test_sql_select_allowed() {
        assert!(ensure_read_only_sql("SELECT * FROM STUDENT WHERE CLASS = 'AIML'").is_ok());
        assert!(ensure_read_only_sql("  select count(*) from student;  ").is_ok());
        assert!(ensure_read_only_sql("WITH t AS (SELECT 1) SELECT * FROM t").is_ok());
        assert!(ensure_read_only_sql("PRAGMA table_info(STUDENT)").is_ok());
        assert!(ensure_read_only_sql("SHOW TABLES").is_ok());
    }

    #[test]
    fn test_sql_write_keywords_in_literals_are_ignored() {
        assert!(ensure_read_only_sql("SELECT * FROM notes WHERE body = 'DROP TABLE x; --'").is_ok());
    }

    #[test]
    fn test_sql_writes_rejected() {
        for stmt in [
            "DELETE FROM STUDENT",
            "INSERT INTO STUDENT VALUES ('x', 'y', 'z', 1)",
            "update STUDENT set MARKS = 100",
            "DROP TABLE STUDENT",
            "PRAGMA journal_mode = WAL",
            "SELECT * INTO OUTFILE '/tmp/x' FROM STUDENT",
        ] {
            let err = ensure_read_only_sql(stmt).unwrap_err();
            assert!(matches!(err, BackendError::Rejected(_)), "{stmt}");
        }
    }

    #[test]
    fn test_sql_multiple_statements_rejected() {
        let err = ensure_read_only_sql("SELECT 1; DELETE FROM STUDENT").unwrap_err();
        assert!(err.to_string().contains("single statement"));
    }

    #[test]
    fn test_sql_comment_cannot_hide_write() {
        assert!(ensure_read_only_sql("/* SELECT */ DELETE FROM STUDENT").is_err());
        assert!(ensure_read_only_sql("-- just a comment").is_err());
    }

    // --- Cypher guard ---

    #[test]
    fn test_cypher_reads_allowed() {
        assert!(ensure_read_only_cypher("MATCH (p:Person)-[:KNOWS]->(f) RETURN f.name LIMIT 5").is_ok());
        assert!(ensure_read_only_cypher("CALL db.labels()").is_ok());
        assert!(
            ensure_read_only_cypher(
                "CALL db.schema.nodeTypeProperties() YIELD nodeLabels RETURN nodeLabels"
            )
            .is_ok()
        );
        assert!(ensure_read_only_cypher("CALL { MATCH (n) RETURN n } RETURN n LIMIT 3").is_ok());
        assert!(ensure_read_only_cypher("MATCH (n) WHERE n.note = 'create me' RETURN n").is_ok());
    }

    #[test]
    fn test_cypher_writes_rejected() {
        for stmt in [
            "CREATE (n:Device {id:'x'}) RETURN 1 as result",
            "MATCH (n) DETACH DELETE n",
            "MATCH (n) SET n.x = 1",
            "MERGE (n:Person {name: 'a'})",
            "LOAD CSV FROM 'file:///x.csv' AS row RETURN row",
            "CALL apoc.cypher.doIt('MATCH (n) DETACH DELETE n', {}) YIELD value RETURN value",
            "CALL db.createLabel('Pwned')",
            "CALL dbms.security.createUser('eve','pw',false)",
            "CALL `apoc`.`periodic`.iterate('MATCH (n) RETURN n', 'DELETE n', {})",
        ] {
            assert!(ensure_read_only_cypher(stmt).is_err(), "{stmt}");
        }
    }

    #[test]
    fn test_cypher_procedure_rejection_names_allowed_calls() {
        let err = ensure_read_only_cypher("CALL db.createLabel('x')").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("db.createLabel"));
        assert!(msg.contains("db.labels"));
        assert!(msg.contains("db.schema.*"));
    }

    // --- helpers ---

    #[tokio::test]
    async fn test_take_capped_stops_after_one_extra_row() {
        let pulled = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = pulled.clone();
        let endless = futures::stream::repeat_with(move || {
            let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok::<_, BackendError>(n)
        });

        let rows = take_capped(endless, 3, |n| {
            let mut record = Record::new();
            record.insert("n".into(), Value::from(n));
            record
        })
        .await
        .unwrap();

        assert!(rows.truncated);
        assert_eq!(rows.records.len(), 3);
        assert_eq!(rows.records[2]["n"], 2);
        assert_eq!(pulled.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_take_capped_short_stream_not_truncated() {
        let short = futures::stream::iter(vec![Ok::<_, BackendError>(1), Ok(2)]);
        let rows = take_capped(short, 5, |_| Record::new()).await.unwrap();
        assert!(!rows.truncated);
        assert_eq!(rows.records.len(), 2);
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("STUDENT", '"'), "\"STUDENT\"");
        assert_eq!(quote_ident("we\"ird", '"'), "\"we\"\"ird\"");
        assert_eq!(quote_ident("a`b", '`'), "`a``b`");
    }

    #[test]
    fn test_match_object_case_insensitive() {
        let objects = vec!["STUDENT".to_string(), "Course".to_string()];
        assert_eq!(match_object(&objects, "student", "table").unwrap(), "STUDENT");
        assert_eq!(match_object(&objects, "`Course`", "table").unwrap(), "Course");
        let err = match_object(&objects, "course", "table").unwrap_err();
        assert!(err.to_string().contains("Available: STUDENT, Course"));
    }

    #[test]
    fn test_document_to_record_relaxed_json() {
        let record = document_to_record(doc! { "name": "Aditya", "marks": 27, "tags": ["a"] });
        assert_eq!(record["name"], "Aditya");
        assert_eq!(record["marks"], 27);
        assert_eq!(record["tags"][0], "a");
        let keys: Vec<&str> = record.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["name", "marks", "tags"]);
    }

    #[test]
    fn test_object_description_display() {
        let desc = ObjectDescription {
            name: "STUDENT".into(),
            definition: Some("CREATE TABLE STUDENT(NAME VARCHAR(25))".into()),
            columns: vec![ColumnInfo {
                name: "NAME".into(),
                data_type: "VARCHAR(25)".into(),
            }],
            sample_rows: vec![],
        };
        let text = desc.to_string();
        assert!(text.starts_with("CREATE TABLE STUDENT"));
        assert!(text.contains("  NAME VARCHAR(25)"));
    }
}
