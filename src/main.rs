use std::sync::Arc;

use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;

use cypher_query::cache::ConnectionCache;
use cypher_query::config::DispatchSettings;
use cypher_query::dispatcher::Dispatcher;
use cypher_query::llm::client_from_env;
use cypher_query::resolve_sample_db_path;
use cypher_query::server::QueryServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // LLM client is required; fail early if missing.
    let llm = client_from_env().map_err(|e| {
        format!("{e}. Set GROQ_API_KEY or ANTHROPIC_API_KEY to answer questions.")
    })?;

    let settings = DispatchSettings::from_env();
    let sample_db = resolve_sample_db_path();
    if !sample_db.exists() {
        info!(
            "Sample database not found at {}; run `cypher-query-cli init-sample` to create it",
            sample_db.display()
        );
    }

    let cache = Arc::new(ConnectionCache::native(settings.connection_ttl));
    let dispatcher = Dispatcher::new(cache.clone(), Arc::from(llm), settings);

    let server = QueryServer::new(dispatcher, sample_db);
    let service = server.serve(stdio()).await?;
    service.waiting().await?;

    cache.shutdown().await;
    Ok(())
}
