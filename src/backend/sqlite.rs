//! SQLite driver. The bundled sample database is always opened read-only.

use std::fmt;
use std::path::{Path, PathBuf};

use async_sqlite::rusqlite::types::ValueRef;
use async_sqlite::rusqlite::{self, OpenFlags};
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{
    ColumnInfo, Dialect, ObjectDescription, Record, Rows, StatementSource, match_object,
    quote_ident,
};
use crate::error::BackendError;

const SAMPLE_ROWS: usize = 3;

pub struct SqliteSource {
    path: PathBuf,
    client: async_sqlite::Client,
}

impl fmt::Debug for SqliteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SqliteSource({})", self.path.to_string_lossy())
    }
}

impl SqliteSource {
    pub async fn open_read_only(path: &Path) -> Result<Self, BackendError> {
        if !path.exists() {
            return Err(BackendError::Connection(format!(
                "SQLite database not found at {}",
                path.display()
            )));
        }
        let client = async_sqlite::ClientBuilder::new()
            .path(path)
            .flags(OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX)
            .open()
            .await
            .map_err(|e| BackendError::Connection(format!("Failed to open {}: {e}", path.display())))?;

        Ok(Self {
            path: path.to_path_buf(),
            client,
        })
    }
}

#[async_trait]
impl StatementSource for SqliteSource {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn list_objects(&self) -> Result<Vec<String>, BackendError> {
        self.client
            .conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(names)
            })
            .await
            .map_err(sqlite_err)
    }

    async fn describe_object(&self, name: &str) -> Result<ObjectDescription, BackendError> {
        let tables = self.list_objects().await?;
        let table = match_object(&tables, name, "table")?;

        self.client
            .conn(move |conn| {
                let definition: Option<String> = conn.query_row(
                    "SELECT sql FROM sqlite_master WHERE name = ?1",
                    [&table],
                    |row| row.get(0),
                )?;

                let quoted = quote_ident(&table, '"');
                let mut stmt = conn.prepare(&format!("PRAGMA table_info({quoted})"))?;
                let columns = stmt
                    .query_map([], |row| {
                        Ok(ColumnInfo {
                            name: row.get(1)?,
                            data_type: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                let sample = read_rows(conn, &format!("SELECT * FROM {quoted}"), SAMPLE_ROWS)?;

                Ok(ObjectDescription {
                    name: table,
                    definition,
                    columns,
                    sample_rows: sample.records,
                })
            })
            .await
            .map_err(sqlite_err)
    }

    async fn run_read_query(&self, statement: &str, max_rows: usize) -> Result<Rows, BackendError> {
        let statement = statement.to_string();
        self.client
            .conn(move |conn| read_rows(conn, &statement, max_rows))
            .await
            .map_err(sqlite_err)
    }

    async fn close(&self) {
        if let Err(e) = self.client.close().await {
            warn!("Failed to close SQLite database {}: {e}", self.path.display());
        }
    }
}

fn read_rows(
    conn: &rusqlite::Connection,
    sql: &str,
    max_rows: usize,
) -> Result<Rows, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query([])?;
    let mut out = Rows::default();
    while let Some(row) = rows.next()? {
        if out.records.len() == max_rows {
            out.truncated = true;
            break;
        }
        let mut record = Record::new();
        for (idx, name) in names.iter().enumerate() {
            record.insert(name.clone(), value_to_json(row.get_ref(idx)?));
        }
        out.records.push(record);
    }
    Ok(out)
}

fn value_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

fn sqlite_err(err: async_sqlite::Error) -> BackendError {
    match err {
        async_sqlite::Error::Rusqlite(e) => BackendError::Query(e.to_string()),
        other => BackendError::Connection(other.to_string()),
    }
}

// ============================================================================
// Sample database
// ============================================================================

const SAMPLE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS STUDENT(\
     NAME VARCHAR(25), CLASS VARCHAR(25), SECTION VARCHAR(25), MARKS INT)";

const SAMPLE_STUDENTS: &[(&str, &str, &str, i64)] = &[
    ("Aditya", "AIML", "C", 27),
    ("Vaidehi", "AIML", "C", 21),
    ("Atharva", "IT", "A", 26),
    ("Pooja", "DS", "A", 16),
    ("Kamlesh", "AIML", "B", 43),
];

/// Create the sample `STUDENT` database at `path` if it has no rows yet.
///
/// Returns the number of rows inserted.
pub async fn create_sample_database(path: &Path) -> Result<usize, BackendError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| BackendError::Connection(format!("Failed to create {}: {e}", parent.display())))?;
    }

    let client = async_sqlite::ClientBuilder::new()
        .path(path)
        .open()
        .await
        .map_err(|e| BackendError::Connection(format!("Failed to create {}: {e}", path.display())))?;

    let inserted = client
        .conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(SAMPLE_SCHEMA, [])?;
            let existing: i64 = tx.query_row("SELECT COUNT(*) FROM STUDENT", [], |row| row.get(0))?;
            let mut inserted = 0;
            if existing == 0 {
                for (name, class, section, marks) in SAMPLE_STUDENTS {
                    inserted += tx.execute(
                        "INSERT INTO STUDENT VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![name, class, section, marks],
                    )?;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
        .map_err(sqlite_err)?;

    if let Err(e) = client.close().await {
        warn!("Failed to close {}: {e}", path.display());
    }
    info!("Sample database at {} ({inserted} rows inserted)", path.display());
    Ok(inserted)
}

// ============================================================================
// Tests
// ============================================================================
