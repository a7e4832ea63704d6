//! MongoDB-backed [`DocumentStore`].

use super::{with_timeout, DocumentStore, StoreError};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, ReadConcern, ReadPreference, SelectionCriteria};
use mongodb::{Client, Database};
use std::time::Duration;
use tracing::info;

/// Read-only connection to the community database.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    /// Connect and ping, giving up after `timeout`.
    pub async fn connect(uri: &str, database: &str, timeout: Duration) -> Result<Self, StoreError> {
        let mut options = with_timeout(timeout, async {
            ClientOptions::parse(uri).await.map_err(StoreError::from)
        })
        .await?;
        options.read_concern = Some(ReadConcern::local());
        options.selection_criteria = Some(SelectionCriteria::ReadPreference(
            ReadPreference::SecondaryPreferred {
                options: Default::default(),
            },
        ));
        options.app_name = Some("kpi-collector".to_string());

        let client = Client::with_options(options)?;
        let database = client.database(database);

        with_timeout(timeout, async {
            database
                .run_command(doc! { "ping": 1 })
                .await
                .map_err(StoreError::from)
        })
        .await?;

        info!(database = %database.name(), "Connected to MongoDB");
        Ok(Self { client, database })
    }

    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>, StoreError> {
        let cursor = self
            .database
            .collection::<Document>(collection)
            .aggregate(pipeline)
            .await?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs)
    }

    async fn find(
        &self,
        collection: &str,
        filter: Document,
        projection: Document,
    ) -> Result<Vec<Document>, StoreError> {
        let cursor = self
            .database
            .collection::<Document>(collection)
            .find(filter)
            .projection(projection)
            .await?;
        let docs: Vec<Document> = cursor.try_collect().await?;
        Ok(docs)
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError> {
        Ok(self
            .database
            .collection::<Document>(collection)
            .count_documents(filter)
            .await?)
    }
}
