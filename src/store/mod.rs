//! Document store access.
//!
//! Aggregators only build pipelines and decode rows; running them is left to
//! a [`DocumentStore`] so the same code runs against MongoDB or an in-memory
//! fake.

pub mod mongo;

use async_trait::async_trait;
use mongodb::bson::Document;
use std::future::Future;
use std::time::Duration;

pub use mongo::MongoStore;

/// Errors from the document store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store query timed out after {0:?}")]
    Timeout(Duration),

    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Read-only query capability over named collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Run an aggregation pipeline and return every resulting document in
    /// cursor order.
    async fn aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
    ) -> Result<Vec<Document>, StoreError>;

    /// Find documents matching `filter`, restricted to `projection`.
    async fn find(
        &self,
        collection: &str,
        filter: Document,
        projection: Document,
    ) -> Result<Vec<Document>, StoreError>;

    /// Count documents matching `filter`.
    async fn count(&self, collection: &str, filter: Document) -> Result<u64, StoreError>;
}

/// Bound a store call by `timeout`.
pub async fn with_timeout<T, F>(timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| StoreError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_timeout_expires() {
        let result: Result<(), StoreError> = with_timeout(Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
    }

    #[tokio::test]
    async fn with_timeout_passes_errors_through() {
        let result: Result<(), StoreError> = with_timeout(Duration::from_secs(1), async {
            Err(StoreError::Backend("boom".into()))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Backend(msg)) if msg == "boom"));
    }
}
