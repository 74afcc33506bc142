//! Structured document filters.
//!
//! Model output for document backends is parsed as JSON and then against a
//! small fixed grammar: field criteria, the comparison/membership/existence/
//! regex operators, and `$and`/`$or` groups. Anything outside the grammar is
//! rejected before it can reach the database. Nothing is evaluated.

use std::fmt;

use bson::{Bson, Document};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::llm::strip_markdown_fences;

/// Operators that would run server-side code.
const FORBIDDEN_OPERATORS: &[&str] = &["$where", "$expr", "$function", "$accumulator"];

#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("not valid JSON: {0}")]
    NotJson(String),

    #[error("filter must be a JSON object")]
    NotAnObject,

    #[error("operator {0} is not allowed")]
    Forbidden(String),

    #[error("unsupported operator {0}")]
    UnknownOperator(String),

    #[error("invalid field name '{0}'")]
    InvalidField(String),

    #[error("{op} expects {expected}")]
    InvalidOperand { op: String, expected: &'static str },

    #[error("field '{0}' has an empty condition")]
    EmptyCondition(String),

    #[error("field '{0}': nested documents are not supported, use dotted field paths")]
    NestedDocument(String),

    #[error("{0} needs at least one filter")]
    EmptyGroup(&'static str),

    #[error("$options is only allowed alongside $regex")]
    OptionsWithoutRegex,
}

// ============================================================================
// Grammar
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Scalar),
    Ne(Scalar),
    Gt(Scalar),
    Gte(Scalar),
    Lt(Scalar),
    Lte(Scalar),
    In(Vec<Scalar>),
    Nin(Vec<Scalar>),
    Exists(bool),
    Regex {
        pattern: String,
        options: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Criterion {
    /// `field: scalar`
    Equals(Scalar),
    /// `field: { op: operand, ... }`
    Conditions(Vec<Condition>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    Field { path: String, criterion: Criterion },
    And(Vec<DocumentFilter>),
    Or(Vec<DocumentFilter>),
}

/// A validated filter. An empty filter matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentFilter {
    pub clauses: Vec<Clause>,
}

impl DocumentFilter {
    /// Parse raw model output. Markdown fences are stripped first.
    pub fn parse(text: &str) -> Result<Self, FilterError> {
        let cleaned = strip_markdown_fences(text);
        let value: Value =
            serde_json::from_str(&cleaned).map_err(|e| FilterError::NotJson(e.to_string()))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, FilterError> {
        let Value::Object(map) = value else {
            return Err(FilterError::NotAnObject);
        };
        parse_filter(map)
    }

    pub fn is_match_all(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        for clause in &self.clauses {
            match clause {
                Clause::Field { path, criterion } => {
                    doc.insert(path.clone(), criterion_to_bson(criterion));
                }
                Clause::And(filters) => {
                    doc.insert("$and", group_to_bson(filters));
                }
                Clause::Or(filters) => {
                    doc.insert("$or", group_to_bson(filters));
                }
            }
        }
        doc
    }
}

impl fmt::Display for DocumentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Bson::Document(self.to_document()).into_relaxed_extjson())
    }
}

// ============================================================================
// Parsing
// ============================================================================

fn parse_filter(map: &Map<String, Value>) -> Result<DocumentFilter, FilterError> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        let clause = match key.as_str() {
            "$and" => Clause::And(parse_group("$and", value)?),
            "$or" => Clause::Or(parse_group("$or", value)?),
            op if FORBIDDEN_OPERATORS.contains(&op) => {
                return Err(FilterError::Forbidden(op.to_string()));
            }
            op if op.starts_with('$') => return Err(FilterError::UnknownOperator(op.to_string())),
            field => {
                validate_field(field)?;
                Clause::Field {
                    path: field.to_string(),
                    criterion: parse_criterion(field, value)?,
                }
            }
        };
        clauses.push(clause);
    }
    Ok(DocumentFilter { clauses })
}

fn parse_group(op: &'static str, value: &Value) -> Result<Vec<DocumentFilter>, FilterError> {
    let Value::Array(items) = value else {
        return Err(FilterError::InvalidOperand {
            op: op.to_string(),
            expected: "an array of filters",
        });
    };
    if items.is_empty() {
        return Err(FilterError::EmptyGroup(op));
    }
    items.iter().map(DocumentFilter::from_json).collect()
}

fn validate_field(field: &str) -> Result<(), FilterError> {
    let valid = !field.is_empty()
        && field
            .split('.')
            .all(|segment| !segment.is_empty() && !segment.starts_with('$'));
    if valid {
        Ok(())
    } else {
        Err(FilterError::InvalidField(field.to_string()))
    }
}

fn parse_criterion(field: &str, value: &Value) -> Result<Criterion, FilterError> {
    let Value::Object(ops) = value else {
        return scalar(value)
            .map(Criterion::Equals)
            .ok_or_else(|| FilterError::NestedDocument(field.to_string()));
    };
    if ops.is_empty() {
        return Err(FilterError::EmptyCondition(field.to_string()));
    }
    if !ops.keys().all(|k| k.starts_with('$')) {
        return Err(FilterError::NestedDocument(field.to_string()));
    }
    if ops.contains_key("$options") && !ops.contains_key("$regex") {
        return Err(FilterError::OptionsWithoutRegex);
    }

    let mut conditions = Vec::with_capacity(ops.len());
    for (op, operand) in ops {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(scalar_operand(op, operand)?),
            "$ne" => Condition::Ne(scalar_operand(op, operand)?),
            "$gt" => Condition::Gt(scalar_operand(op, operand)?),
            "$gte" => Condition::Gte(scalar_operand(op, operand)?),
            "$lt" => Condition::Lt(scalar_operand(op, operand)?),
            "$lte" => Condition::Lte(scalar_operand(op, operand)?),
            "$in" => Condition::In(scalar_list(op, operand)?),
            "$nin" => Condition::Nin(scalar_list(op, operand)?),
            "$exists" => Condition::Exists(operand.as_bool().ok_or_else(|| {
                FilterError::InvalidOperand {
                    op: op.clone(),
                    expected: "a boolean",
                }
            })?),
            "$regex" => Condition::Regex {
                pattern: string_operand(op, operand)?,
                options: ops
                    .get("$options")
                    .map(regex_options)
                    .transpose()?,
            },
            "$options" => continue,
            other if FORBIDDEN_OPERATORS.contains(&other) => {
                return Err(FilterError::Forbidden(other.to_string()));
            }
            other => return Err(FilterError::UnknownOperator(other.to_string())),
        };
        conditions.push(condition);
    }
    Ok(Criterion::Conditions(conditions))
}

fn scalar(value: &Value) -> Option<Scalar> {
    match value {
        Value::Null => Some(Scalar::Null),
        Value::Bool(b) => Some(Scalar::Bool(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(Scalar::Int)
            .or_else(|| n.as_f64().map(Scalar::Double)),
        Value::String(s) => Some(Scalar::String(s.clone())),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn scalar_operand(op: &str, value: &Value) -> Result<Scalar, FilterError> {
    scalar(value).ok_or_else(|| FilterError::InvalidOperand {
        op: op.to_string(),
        expected: "a scalar value",
    })
}

fn scalar_list(op: &str, value: &Value) -> Result<Vec<Scalar>, FilterError> {
    let invalid = || FilterError::InvalidOperand {
        op: op.to_string(),
        expected: "an array of scalar values",
    };
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|v| scalar(v).ok_or_else(invalid))
        .collect()
}

fn string_operand(op: &str, value: &Value) -> Result<String, FilterError> {
    value
        .as_str()
        .map(String::from)
        .ok_or_else(|| FilterError::InvalidOperand {
            op: op.to_string(),
            expected: "a string",
        })
}

fn regex_options(value: &Value) -> Result<String, FilterError> {
    let options = string_operand("$options", value)?;
    if options.chars().all(|c| matches!(c, 'i' | 'm' | 's' | 'x')) {
        Ok(options)
    } else {
        Err(FilterError::InvalidOperand {
            op: "$options".to_string(),
            expected: "a combination of the flags i, m, s, x",
        })
    }
}

// ============================================================================
// BSON conversion
// ============================================================================

fn scalar_to_bson(scalar: &Scalar) -> Bson {
    match scalar {
        Scalar::Null => Bson::Null,
        Scalar::Bool(b) => Bson::Boolean(*b),
        Scalar::Int(i) => Bson::Int64(*i),
        Scalar::Double(d) => Bson::Double(*d),
        Scalar::String(s) => Bson::String(s.clone()),
    }
}

fn scalars_to_bson(values: &[Scalar]) -> Bson {
    Bson::Array(values.iter().map(scalar_to_bson).collect())
}

fn criterion_to_bson(criterion: &Criterion) -> Bson {
    match criterion {
        Criterion::Equals(value) => scalar_to_bson(value),
        Criterion::Conditions(conditions) => {
            let mut doc = Document::new();
            for condition in conditions {
                match condition {
                    Condition::Eq(v) => doc.insert("$eq", scalar_to_bson(v)),
                    Condition::Ne(v) => doc.insert("$ne", scalar_to_bson(v)),
                    Condition::Gt(v) => doc.insert("$gt", scalar_to_bson(v)),
                    Condition::Gte(v) => doc.insert("$gte", scalar_to_bson(v)),
                    Condition::Lt(v) => doc.insert("$lt", scalar_to_bson(v)),
                    Condition::Lte(v) => doc.insert("$lte", scalar_to_bson(v)),
                    Condition::In(vs) => doc.insert("$in", scalars_to_bson(vs)),
                    Condition::Nin(vs) => doc.insert("$nin", scalars_to_bson(vs)),
                    Condition::Exists(b) => doc.insert("$exists", *b),
                    Condition::Regex { pattern, options } => {
                        let previous = doc.insert("$regex", pattern.clone());
                        if let Some(options) = options {
                            doc.insert("$options", options.clone());
                        }
                        previous
                    }
                };
            }
            Bson::Document(doc)
        }
    }
}

fn group_to_bson(filters: &[DocumentFilter]) -> Bson {
    Bson::Array(
        filters
            .iter()
            .map(|f| Bson::Document(f.to_document()))
            .collect(),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use bson::doc;

    use super::*;

    #[test]
    fn test_empty_object_is_match_all() {
        let filter = DocumentFilter::parse("{}").unwrap();
        assert!(filter.is_match_all());
        assert_eq!(filter.to_document(), doc! {});
    }

    #[test]
    fn test_equality_and_fences() {
        let filter = DocumentFilter::parse("```json\n{\"city\": \"Paris\", \"age\": 30}\n```").unwrap();
        assert_eq!(filter.to_document(), doc! { "city": "Paris", "age": 30_i64 });
    }

    #[test]
    fn test_operators_and_groups() {
        let filter = DocumentFilter::parse(
            r#"{"$or": [{"age": {"$gte": 18, "$lt": 65}}, {"tags": {"$in": ["vip", "staff"]}}],
                "address.city": {"$exists": true},
                "name": {"$regex": "^a", "$options": "i"}}"#,
        )
        .unwrap();
        assert_eq!(
            filter.to_document(),
            doc! {
                "$or": [
                    { "age": { "$gte": 18_i64, "$lt": 65_i64 } },
                    { "tags": { "$in": ["vip", "staff"] } }
                ],
                "address.city": { "$exists": true },
                "name": { "$regex": "^a", "$options": "i" }
            }
        );
    }

    #[test]
    fn test_rejects_non_json_output() {
        for text in [
            "db.customers.find({'city': 'Paris'})",
            "{'city': 'Paris'}",
            "{\"active\": True}",
            "Sure! Here is the query.",
        ] {
            assert!(
                matches!(DocumentFilter::parse(text), Err(FilterError::NotJson(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn test_rejects_non_object() {
        assert_eq!(
            DocumentFilter::parse("[{\"a\": 1}]").unwrap_err(),
            FilterError::NotAnObject
        );
        assert_eq!(DocumentFilter::parse("\"a\"").unwrap_err(), FilterError::NotAnObject);
    }

    #[test]
    fn test_rejects_code_operators() {
        assert_eq!(
            DocumentFilter::parse(r#"{"$where": "this.a > 1"}"#).unwrap_err(),
            FilterError::Forbidden("$where".into())
        );
        assert_eq!(
            DocumentFilter::parse(r#"{"$expr": {"$gt": ["$a", "$b"]}}"#).unwrap_err(),
            FilterError::Forbidden("$expr".into())
        );
        assert_eq!(
            DocumentFilter::parse(r#"{"a": {"$function": {}}}"#).unwrap_err(),
            FilterError::Forbidden("$function".into())
        );
    }

    #[test]
    fn test_rejects_outside_grammar() {
        assert!(matches!(
            DocumentFilter::parse(r#"{"a": {"$elemMatch": {"b": 1}}}"#),
            Err(FilterError::UnknownOperator(_))
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"a": {"$gt": {"$date": "2024-01-01"}}}"#),
            Err(FilterError::InvalidOperand { .. })
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"a": {"b": 1}}"#),
            Err(FilterError::NestedDocument(_))
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"a": [1, 2]}"#),
            Err(FilterError::NestedDocument(_))
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"a..b": 1}"#),
            Err(FilterError::InvalidField(_))
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"a": {}}"#),
            Err(FilterError::EmptyCondition(_))
        ));
        assert!(matches!(
            DocumentFilter::parse(r#"{"$and": []}"#),
            Err(FilterError::EmptyGroup("$and"))
        ));
        assert_eq!(
            DocumentFilter::parse(r#"{"a": {"$options": "i"}}"#).unwrap_err(),
            FilterError::OptionsWithoutRegex
        );
        assert!(DocumentFilter::parse(r#"{"a": {"$regex": "x", "$options": "g"}}"#).is_err());
    }

    #[test]
    fn test_nested_groups_are_validated() {
        let err = DocumentFilter::parse(r#"{"$and": [{"a": 1}, {"$where": "1"}]}"#).unwrap_err();
        assert_eq!(err, FilterError::Forbidden("$where".into()));
    }

    #[test]
    fn test_display_is_json() {
        let filter = DocumentFilter::parse(r#"{"class": "AIML", "marks": {"$gt": 20.5}}"#).unwrap();
        assert_eq!(filter.to_string(), r#"{"class":"AIML","marks":{"$gt":20.5}}"#);
    }
}
