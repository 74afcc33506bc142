//! CypherQuery: natural-language questions over SQLite, MySQL, Neo4j and
//! MongoDB. Shared library for the MCP server and CLI.

pub mod adapter;
pub mod agent;
pub mod backend;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod filter;
pub mod llm;
pub mod schema;
pub mod server;
pub mod translate;
pub mod ttl;

use std::path::PathBuf;

/// Resolve the sample SQLite database path from env var or default location.
pub fn resolve_sample_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("CYPHERQUERY_SAMPLE_DB") {
        return PathBuf::from(path);
    }

    let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    data_dir.join("cypherquery").join("test.db")
}
