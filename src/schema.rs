//! Schema introspection.
//!
//! A [`SchemaDescriptor`] is a best-effort map of field name to [`TypeTag`]
//! used to ground query generation. Relational and graph backends report
//! their declared types; document collections are sampled and each field's
//! observed BSON type is recorded, collapsing to [`TypeTag::Mixed`] when
//! samples disagree.

use std::fmt;
use std::time::Duration;

use bson::{Bson, Document};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::backend::{Connection, Dialect, StatementSource};
use crate::cache::ConnectionHandle;
use crate::error::DispatchError;
use crate::executor::within;

// ============================================================================
// Type Tags
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeTag {
    Null,
    Bool,
    Int,
    Double,
    Decimal,
    String,
    DateTime,
    Binary,
    Array,
    Object,
    ObjectId,
    Other,
    /// Observed with more than one type.
    Mixed,
}

impl TypeTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Double => "double",
            Self::Decimal => "decimal",
            Self::String => "string",
            Self::DateTime => "datetime",
            Self::Binary => "binary",
            Self::Array => "array",
            Self::Object => "object",
            Self::ObjectId => "objectid",
            Self::Other => "other",
            Self::Mixed => "mixed",
        }
    }

    pub fn from_bson(value: &Bson) -> Self {
        match value {
            Bson::Null | Bson::Undefined => Self::Null,
            Bson::Boolean(_) => Self::Bool,
            Bson::Int32(_) | Bson::Int64(_) => Self::Int,
            Bson::Double(_) => Self::Double,
            Bson::Decimal128(_) => Self::Decimal,
            Bson::String(_) | Bson::Symbol(_) => Self::String,
            Bson::DateTime(_) | Bson::Timestamp(_) => Self::DateTime,
            Bson::Binary(_) => Self::Binary,
            Bson::Array(_) => Self::Array,
            Bson::Document(_) => Self::Object,
            Bson::ObjectId(_) => Self::ObjectId,
            _ => Self::Other,
        }
    }

    /// Map a declared SQL column type (`VARCHAR(25)`, `bigint unsigned`, ...).
    pub fn from_sql_type(declared: &str) -> Self {
        let base = declared
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_uppercase();

        if base.is_empty() {
            Self::Other
        } else if base.starts_with("BOOL") || base == "BIT" {
            Self::Bool
        } else if base
            .split_whitespace()
            .any(|word| word.starts_with("INTERVAL") || word.ends_with("POINT"))
        {
            Self::Other
        } else if base.contains("INT") {
            Self::Int
        } else if base.contains("CHAR")
            || base.contains("TEXT")
            || base.contains("CLOB")
            || base.starts_with("ENUM")
            || base.starts_with("SET")
        {
            Self::String
        } else if base.contains("REAL") || base.contains("FLOA") || base.contains("DOUB") {
            Self::Double
        } else if base.starts_with("DEC") || base.starts_with("NUMERIC") {
            Self::Decimal
        } else if base.contains("DATE") || base.contains("TIME") || base == "YEAR" {
            Self::DateTime
        } else if base.contains("BLOB") || base.contains("BINARY") {
            Self::Binary
        } else if base == "JSON" {
            Self::Object
        } else {
            Self::Other
        }
    }

    /// Map Neo4j property types as reported by `db.schema.nodeTypeProperties()`,
    /// joined with `|`. More than one type is [`TypeTag::Mixed`].
    pub fn from_cypher_types(types: &str) -> Self {
        let types: Vec<&str> = types
            .split('|')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect();
        match types.as_slice() {
            [] => Self::Other,
            [single] => Self::from_cypher_type(single),
            _ => Self::Mixed,
        }
    }

    fn from_cypher_type(name: &str) -> Self {
        if name.ends_with("Array") {
            return Self::Array;
        }
        match name {
            "String" => Self::String,
            "Long" | "Integer" => Self::Int,
            "Double" | "Float" => Self::Double,
            "Boolean" => Self::Bool,
            "Date" | "DateTime" | "LocalDateTime" | "Time" | "LocalTime" => Self::DateTime,
            "Map" => Self::Object,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Schema Descriptor
// ============================================================================

/// Ordered field name → type tag map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SchemaDescriptor {
    pub fields: IndexMap<String, TypeTag>,
}

impl SchemaDescriptor {
    pub fn get(&self, field: &str) -> Option<TypeTag> {
        self.fields.get(field).copied()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Record an observation, collapsing to `mixed` on disagreement.
    fn observe(&mut self, field: String, tag: TypeTag) {
        self.fields
            .entry(field)
            .and_modify(|existing| {
                if *existing != tag {
                    *existing = TypeTag::Mixed;
                }
            })
            .or_insert(tag);
    }

    /// One `field: tag` line per field, for prompts.
    pub fn render(&self) -> String {
        if self.fields.is_empty() {
            return "(no fields observed)".to_string();
        }
        self.fields
            .iter()
            .map(|(name, tag)| format!("{name}: {tag}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Infer a schema from sampled documents. Only top-level fields are tagged.
pub fn infer_document_schema(docs: &[Document]) -> SchemaDescriptor {
    let mut schema = SchemaDescriptor::default();
    for doc in docs {
        for (field, value) in doc {
            schema.observe(field.clone(), TypeTag::from_bson(value));
        }
    }
    schema
}

// ============================================================================
// Introspection
// ============================================================================

/// Describe the backend behind `handle`.
///
/// Each backend call runs under `timeout`. Document collections are sampled
/// up to `sample_size` documents.
pub async fn describe(
    handle: &ConnectionHandle,
    sample_size: usize,
    timeout: Duration,
) -> Result<SchemaDescriptor, DispatchError> {
    let schema = match handle.connection() {
        Connection::Statement(source) => describe_statement_source(source.as_ref(), timeout).await?,
        Connection::Document(source) => {
            let docs = within(timeout, source.sample(sample_size)).await??;
            infer_document_schema(&docs)
        }
    };
    debug!("Described {} ({} fields)", handle.label(), schema.len());
    Ok(schema)
}

async fn describe_statement_source(
    source: &dyn StatementSource,
    timeout: Duration,
) -> Result<SchemaDescriptor, DispatchError> {
    let dialect = source.dialect();
    let mut schema = SchemaDescriptor::default();

    for object in within(timeout, source.list_objects()).await?? {
        let description = within(timeout, source.describe_object(&object)).await??;
        for column in description.columns {
            let tag = match dialect {
                Dialect::Cypher => TypeTag::from_cypher_types(&column.data_type),
                Dialect::Sqlite | Dialect::Mysql => TypeTag::from_sql_type(&column.data_type),
            };
            schema.observe(format!("{}.{}", description.name, column.name), tag);
        }
    }
    Ok(schema)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bson::{Decimal128, doc, oid::ObjectId};

    use super::*;
    use crate::backend::sqlite::create_sample_database;
    use crate::backend::testing::{FakeConnector, FakeDocumentSource};
    use crate::cache::ConnectionCache;
    use crate::config::{BackendConfig, DocumentConfig, RelationalConfig};
    use crate::ttl::{CONNECTION_DEFAULT_TTL, SystemClock};

    #[test]
    fn test_mixed_field_marked() {
        let schema = infer_document_schema(&[doc! { "a": 1 }, doc! { "a": "x" }]);
        assert_eq!(schema.get("a"), Some(TypeTag::Mixed));
        assert_eq!(schema.len(), 1);
    }

    #[test]
    fn test_consistent_fields_never_mixed() {
        let docs = vec![
            doc! { "_id": ObjectId::new(), "name": "Ada", "age": 36, "tags": ["x"] },
            doc! { "_id": ObjectId::new(), "name": "Alan", "age": 41_i64, "tags": [] },
            doc! { "_id": ObjectId::new(), "name": "Grace" },
        ];
        let schema = infer_document_schema(&docs);
        assert_eq!(schema.get("_id"), Some(TypeTag::ObjectId));
        assert_eq!(schema.get("name"), Some(TypeTag::String));
        // Int32 and Int64 are both `int`; absence in the third doc is not a conflict.
        assert_eq!(schema.get("age"), Some(TypeTag::Int));
        assert_eq!(schema.get("tags"), Some(TypeTag::Array));
        assert!(!schema.fields.values().any(|t| *t == TypeTag::Mixed));
    }

    #[test]
    fn test_null_against_value_is_mixed() {
        let schema = infer_document_schema(&[doc! { "email": null }, doc! { "email": "a@b.c" }]);
        assert_eq!(schema.get("email"), Some(TypeTag::Mixed));
    }

    #[test]
    fn test_field_order_is_first_seen_and_deterministic() {
        let docs = vec![doc! { "b": 1, "a": 2.5 }, doc! { "c": true, "a": 1.0 }];
        let first = infer_document_schema(&docs);
        let second = infer_document_schema(&docs);
        assert_eq!(first, second);
        let keys: Vec<&str> = first.fields.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(first.render(), "b: int\na: double\nc: bool");
    }

    #[test]
    fn test_bson_tags() {
        let decimal: Decimal128 = "1.5".parse().unwrap();
        assert_eq!(TypeTag::from_bson(&Bson::Decimal128(decimal)), TypeTag::Decimal);
        assert_eq!(
            TypeTag::from_bson(&Bson::DateTime(bson::DateTime::now())),
            TypeTag::DateTime
        );
        assert_eq!(TypeTag::from_bson(&Bson::Document(doc! {})), TypeTag::Object);
    }

    #[test]
    fn test_sql_type_mapping() {
        assert_eq!(TypeTag::from_sql_type("VARCHAR(25)"), TypeTag::String);
        assert_eq!(TypeTag::from_sql_type("INT"), TypeTag::Int);
        assert_eq!(TypeTag::from_sql_type("bigint unsigned"), TypeTag::Int);
        assert_eq!(TypeTag::from_sql_type("decimal(10,2)"), TypeTag::Decimal);
        assert_eq!(TypeTag::from_sql_type("REAL"), TypeTag::Double);
        assert_eq!(TypeTag::from_sql_type("datetime"), TypeTag::DateTime);
        assert_eq!(TypeTag::from_sql_type("BLOB"), TypeTag::Binary);
        assert_eq!(TypeTag::from_sql_type("BOOLEAN"), TypeTag::Bool);
        assert_eq!(TypeTag::from_sql_type(""), TypeTag::Other);
        assert_eq!(TypeTag::from_sql_type("UNSIGNED BIG INT"), TypeTag::Int);
        assert_eq!(TypeTag::from_sql_type("MEDIUMINT(8)"), TypeTag::Int);
    }

    #[test]
    fn test_sql_spatial_and_interval_types_are_not_int() {
        assert_eq!(TypeTag::from_sql_type("POINT"), TypeTag::Other);
        assert_eq!(TypeTag::from_sql_type("multipoint"), TypeTag::Other);
        assert_eq!(TypeTag::from_sql_type("INTERVAL DAY TO SECOND"), TypeTag::Other);
    }

    #[test]
    fn test_cypher_type_mapping() {
        assert_eq!(TypeTag::from_cypher_types("String"), TypeTag::String);
        assert_eq!(TypeTag::from_cypher_types("Long"), TypeTag::Int);
        assert_eq!(TypeTag::from_cypher_types("StringArray"), TypeTag::Array);
        assert_eq!(TypeTag::from_cypher_types("String|Long"), TypeTag::Mixed);
        assert_eq!(TypeTag::from_cypher_types(""), TypeTag::Other);
    }

    #[test]
    fn test_descriptor_serializes_as_object() {
        let schema = infer_document_schema(&[doc! { "a": 1, "b": "x" }]);
        assert_eq!(
            serde_json::to_string(&schema).unwrap(),
            r#"{"a":"int","b":"string"}"#
        );
    }

    #[tokio::test]
    async fn test_describe_sqlite_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        create_sample_database(&path).await.unwrap();

        let cache = ConnectionCache::native(CONNECTION_DEFAULT_TTL);
        let handle = cache
            .get_or_create(&BackendConfig::Relational(RelationalConfig::Sqlite { path }))
            .await
            .unwrap();

        let schema = describe(&handle, 10, Duration::from_secs(5)).await.unwrap();
        let keys: Vec<&str> = schema.fields.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["STUDENT.NAME", "STUDENT.CLASS", "STUDENT.SECTION", "STUDENT.MARKS"]
        );
        assert_eq!(schema.get("STUDENT.MARKS"), Some(TypeTag::Int));
        cache.shutdown().await;
    }

    #[tokio::test]
    async fn test_describe_document_respects_sample_size() {
        let connector = Arc::new(FakeConnector::new(|_| {
            Ok(Connection::Document(Box::new(FakeDocumentSource::new(vec![
                doc! { "a": 1 },
                doc! { "a": 2 },
                doc! { "a": "late" },
            ]))))
        }));
        let cache = ConnectionCache::new(connector, Arc::new(SystemClock), CONNECTION_DEFAULT_TTL);
        let handle = cache
            .get_or_create(&BackendConfig::Document(DocumentConfig {
                uri: "mongodb://localhost".into(),
                database: "db".into(),
                collection: "c".into(),
            }))
            .await
            .unwrap();

        let two = describe(&handle, 2, Duration::from_secs(5)).await.unwrap();
        assert_eq!(two.get("a"), Some(TypeTag::Int));
        let all = describe(&handle, 10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(all.get("a"), Some(TypeTag::Mixed));
    }
}
