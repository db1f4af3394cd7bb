//! Bulk loading of documents into the search index.
//!
//! Documents are written in fixed-size batches with the `index` action, so a
//! document rebuilt from the same source rows replaces its previous version
//! and re-running a load converges on the same index contents. Each batch is
//! one retried, time-bounded call; per-item rejections are collected rather
//! than aborting the remaining batches.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::index::{BulkItem, ItemOutcome, SearchIndex};
use crate::models::AggregateDocument;
use crate::retry::{with_timeout, RetryExecutor};

/// A document the index refused.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemFailure {
    pub id: String,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadResult {
    pub success_count: usize,
    pub failed_count: usize,
    pub failures: Vec<ItemFailure>,
}

impl LoadResult {
    pub fn is_clean(&self) -> bool {
        self.failed_count == 0
    }
}

#[derive(Clone)]
pub struct IndexLoader {
    index: Arc<dyn SearchIndex>,
    retry: RetryExecutor,
    batch_size: usize,
    call_timeout: Duration,
}

impl IndexLoader {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        retry: RetryExecutor,
        batch_size: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            index,
            retry,
            batch_size: batch_size.max(1),
            call_timeout,
        }
    }

    /// Upsert every document into `index_name`.
    ///
    /// Returns `Err` only when a batch could not be delivered at all after
    /// retries; item-level rejections are reported in the [`LoadResult`].
    pub async fn load<I>(&self, documents: I, index_name: &str) -> SyncResult<LoadResult>
    where
        I: IntoIterator<Item = AggregateDocument>,
    {
        let mut result = LoadResult::default();
        let mut batch: Vec<BulkItem> = Vec::with_capacity(self.batch_size);

        for doc in documents {
            batch.push(BulkItem {
                id: doc.id().to_string(),
                body: serde_json::to_value(&doc)?,
            });
            if batch.len() >= self.batch_size {
                self.flush(index_name, &batch, &mut result).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            self.flush(index_name, &batch, &mut result).await?;
        }

        Ok(result)
    }

    async fn flush(&self, index_name: &str, batch: &[BulkItem], result: &mut LoadResult) -> SyncResult<()> {
        let index = &self.index;
        let outcomes = self
            .retry
            .run_sync(|| with_timeout(self.call_timeout, index.bulk_upsert(index_name, batch)))
            .await?;

        let mut rejected = 0usize;
        for item in outcomes {
            match item.outcome {
                ItemOutcome::Indexed => result.success_count += 1,
                ItemOutcome::Rejected { status, reason } => {
                    rejected += 1;
                    warn!(index = index_name, id = %item.id, status, %reason, "document rejected");
                    result.failures.push(ItemFailure {
                        id: item.id,
                        status,
                        reason,
                    });
                }
            }
        }
        result.failed_count += rejected;

        debug!(
            index = index_name,
            batch = batch.len(),
            rejected,
            "batch flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::testing::FlakyIndex;
    use crate::models::GenreDocument;
    use crate::retry::RetryPolicy;
    use uuid::Uuid;

    fn genre(name: &str) -> AggregateDocument {
        AggregateDocument::Genre(GenreDocument {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            films: vec![],
        })
    }

    fn loader(index: Arc<FlakyIndex>, batch_size: usize, attempts: u32) -> IndexLoader {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(4),
            max_attempts: attempts,
        };
        IndexLoader::new(index, RetryExecutor::new(policy), batch_size, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn splits_into_batches() {
        let index = Arc::new(FlakyIndex::new());
        let docs: Vec<_> = (0..5).map(|i| genre(&format!("g{}", i))).collect();

        let result = loader(index.clone(), 2, 3).load(docs, "genres").await.unwrap();
        assert_eq!(result.success_count, 5);
        assert!(result.is_clean());
        assert_eq!(index.bulk_calls(), 3);
        assert_eq!(index.count("genres").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn empty_input_makes_no_calls() {
        let index = Arc::new(FlakyIndex::new());
        let result = loader(index.clone(), 10, 3)
            .load(Vec::new(), "genres")
            .await
            .unwrap();
        assert_eq!(result, LoadResult::default());
        assert_eq!(index.bulk_calls(), 0);
    }

    #[tokio::test]
    async fn rejected_items_are_counted_not_fatal() {
        let index = Arc::new(FlakyIndex::new());
        let bad = genre("bad");
        index.reject_id(bad.id().to_string());

        let result = loader(index.clone(), 10, 3)
            .load(vec![genre("ok"), bad.clone()], "genres")
            .await
            .unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.failures[0].id, bad.id().to_string());
        assert_eq!(result.failures[0].status, 400);
    }

    #[tokio::test]
    async fn transient_bulk_failure_is_retried() {
        let index = Arc::new(FlakyIndex::new());
        index.fail_next_bulk(2);

        let result = loader(index.clone(), 10, 3)
            .load(vec![genre("a")], "genres")
            .await
            .unwrap();
        assert_eq!(result.success_count, 1);
        assert_eq!(index.bulk_calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_load() {
        let index = Arc::new(FlakyIndex::new());
        index.fail_next_bulk(5);

        let err = loader(index, 10, 2)
            .load(vec![genre("a")], "genres")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IndexUnavailable(_)));
    }
}
