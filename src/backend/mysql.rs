//! MySQL driver over a small `mysql_async` pool.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Pool, Row, TxOpts, Value as MysqlValue};
use serde_json::Value;
use tracing::warn;

use super::{
    ColumnInfo, Dialect, ObjectDescription, Record, Rows, StatementSource, match_object,
    quote_ident, take_capped,
};
use crate::config::MysqlConfig;
use crate::error::BackendError;

const DEFAULT_PORT: u16 = 3306;
const SAMPLE_ROWS: usize = 3;

#[derive(Debug)]
pub struct MysqlSource {
    pool: Pool,
}

impl MysqlSource {
    pub async fn connect(config: &MysqlConfig) -> Result<Self, BackendError> {
        let (host, port) = split_host_port(&config.host)?;
        let opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .user(Some(config.user.clone()))
            .pass(Some(config.password.clone()))
            .db_name(Some(config.database.clone()));
        let pool = Pool::new(opts);

        // Fail fast on bad credentials instead of on the first question.
        let mut conn = pool.get_conn().await.map_err(connection_err)?;
        conn.ping().await.map_err(connection_err)?;
        drop(conn);

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<Conn, BackendError> {
        self.pool.get_conn().await.map_err(connection_err)
    }
}

#[async_trait]
impl StatementSource for MysqlSource {
    fn dialect(&self) -> Dialect {
        Dialect::Mysql
    }

    async fn list_objects(&self) -> Result<Vec<String>, BackendError> {
        let mut conn = self.conn().await?;
        conn.query::<String, _>("SHOW TABLES").await.map_err(query_err)
    }

    async fn describe_object(&self, name: &str) -> Result<ObjectDescription, BackendError> {
        let tables = self.list_objects().await?;
        let table = match_object(&tables, name, "table")?;
        let quoted = quote_ident(&table, '`');

        let mut conn = self.conn().await?;
        let definition: Option<(String, String)> = conn
            .query_first(format!("SHOW CREATE TABLE {quoted}"))
            .await
            .map_err(query_err)?;

        let column_rows: Vec<Row> = conn
            .query(format!("SHOW COLUMNS FROM {quoted}"))
            .await
            .map_err(query_err)?;
        let columns = column_rows
            .iter()
            .map(|row| ColumnInfo {
                name: row.get::<String, _>("Field").unwrap_or_default(),
                data_type: row.get::<String, _>("Type").unwrap_or_default(),
            })
            .collect();

        let sample: Vec<Row> = conn
            .query(format!("SELECT * FROM {quoted} LIMIT {SAMPLE_ROWS}"))
            .await
            .map_err(query_err)?;

        Ok(ObjectDescription {
            name: table,
            definition: definition.map(|(_, ddl)| ddl),
            columns,
            sample_rows: sample.iter().map(row_to_record).collect(),
        })
    }

    async fn run_read_query(&self, statement: &str, max_rows: usize) -> Result<Rows, BackendError> {
        let mut conn = self.conn().await?;
        let mut tx_options = TxOpts::new();
        tx_options.with_readonly(true);
        let mut tx = conn.start_transaction(tx_options).await.map_err(query_err)?;

        let rows = {
            let mut result = tx.query_iter(statement).await.map_err(query_err)?;
            match result.stream::<Row>().await.map_err(query_err)? {
                Some(stream) => take_capped(stream, max_rows, |row| row_to_record(&row))
                    .await
                    .map_err(query_err)?,
                None => Rows::default(),
            }
        };

        // Unread rows are discarded by the driver; nothing was written.
        if let Err(e) = tx.rollback().await {
            warn!("Failed to end MySQL read transaction: {e}");
        }
        Ok(rows)
    }

    async fn close(&self) {
        if let Err(e) = self.pool.clone().disconnect().await {
            warn!("Failed to disconnect MySQL pool: {e}");
        }
    }
}

fn split_host_port(host: &str) -> Result<(String, u16), BackendError> {
    match host.rsplit_once(':') {
        Some((name, port)) => {
            let port = port
                .parse()
                .map_err(|_| BackendError::Connection(format!("Invalid MySQL port in '{host}'")))?;
            Ok((name.to_string(), port))
        }
        None => Ok((host.to_string(), DEFAULT_PORT)),
    }
}

fn row_to_record(row: &Row) -> Record {
    let mut record = Record::new();
    for (idx, column) in row.columns_ref().iter().enumerate() {
        let value = row.as_ref(idx).map(value_to_json).unwrap_or(Value::Null);
        record.insert(column.name_str().into_owned(), value);
    }
    record
}

fn value_to_json(value: &MysqlValue) -> Value {
    match value {
        MysqlValue::NULL => Value::Null,
        MysqlValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        MysqlValue::Int(i) => Value::from(*i),
        MysqlValue::UInt(u) => Value::from(*u),
        MysqlValue::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        MysqlValue::Double(d) => serde_json::Number::from_f64(*d)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        MysqlValue::Date(y, m, d, h, mi, s, _) => Value::String(format!(
            "{y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02}"
        )),
        MysqlValue::Time(neg, days, h, m, s, _) => {
            let sign = if *neg { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            Value::String(format!("{sign}{hours:02}:{m:02}:{s:02}"))
        }
    }
}

fn connection_err(err: mysql_async::Error) -> BackendError {
    BackendError::Connection(format!("MySQL: {err}"))
}

fn query_err(err: mysql_async::Error) -> BackendError {
    match err {
        mysql_async::Error::Server(e) => BackendError::Query(format!("MySQL: {e}")),
        other => connection_err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("db.internal").unwrap(),
            ("db.internal".to_string(), 3306)
        );
        assert_eq!(
            split_host_port("localhost:3307").unwrap(),
            ("localhost".to_string(), 3307)
        );
        assert!(split_host_port("localhost:abc").is_err());
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(value_to_json(&MysqlValue::NULL), Value::Null);
        assert_eq!(value_to_json(&MysqlValue::Bytes(b"AIML".to_vec())), "AIML");
        assert_eq!(value_to_json(&MysqlValue::Int(-4)), -4);
        assert_eq!(value_to_json(&MysqlValue::UInt(7)), 7);
        assert_eq!(value_to_json(&MysqlValue::Double(1.5)), 1.5);
        assert_eq!(
            value_to_json(&MysqlValue::Date(2024, 3, 9, 8, 5, 0, 0)),
            "2024-03-09 08:05:00"
        );
        assert_eq!(
            value_to_json(&MysqlValue::Time(true, 1, 2, 3, 4, 0)),
            "-26:03:04"
        );
    }
}
