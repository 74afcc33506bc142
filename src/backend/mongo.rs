//! MongoDB driver for a single collection.

use async_trait::async_trait;
use bson::{Document, doc};
use futures::TryStreamExt;
use mongodb::error::ErrorKind as MongoErrorKind;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection};

use super::DocumentSource;
use crate::config::DocumentConfig;
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct MongoSource {
    client: Client,
    collection: Collection<Document>,
}

impl MongoSource {
    pub async fn connect(config: &DocumentConfig) -> Result<Self, BackendError> {
        let mut opts = ClientOptions::parse(&config.uri)
            .await
            .map_err(|e| BackendError::Connection(format!("Invalid MongoDB URI: {e}")))?;
        opts.app_name = Some("cypher-query".to_string());
        let client = Client::with_options(opts).map_err(mongo_err)?;

        let database = client.database(&config.database);
        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| BackendError::Connection(format!("MongoDB: {e}")))?;

        Ok(Self {
            collection: database.collection(&config.collection),
            client,
        })
    }
}

#[async_trait]
impl DocumentSource for MongoSource {
    fn namespace(&self) -> String {
        self.collection.namespace().to_string()
    }

    async fn sample(&self, limit: usize) -> Result<Vec<Document>, BackendError> {
        self.find(Document::new(), limit).await
    }

    async fn find(&self, filter: Document, limit: usize) -> Result<Vec<Document>, BackendError> {
        let cursor = self
            .collection
            .find(filter)
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .await
            .map_err(mongo_err)?;
        cursor.try_collect().await.map_err(mongo_err)
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
    }
}

fn mongo_err(err: mongodb::error::Error) -> BackendError {
    let lost = matches!(
        *err.kind,
        MongoErrorKind::Io(_)
            | MongoErrorKind::ServerSelection { .. }
            | MongoErrorKind::ConnectionPoolCleared { .. }
            | MongoErrorKind::Authentication { .. }
    );
    if lost {
        BackendError::Connection(format!("MongoDB: {err}"))
    } else {
        BackendError::Query(format!("MongoDB: {err}"))
    }
}
