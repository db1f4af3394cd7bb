//! Fault-injecting wrappers around the in-memory backends, for unit tests.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::index::{BulkItem, InMemoryIndex, ItemOutcome, ItemResult, SearchIndex};
use crate::models::{ChangeBatch, ChangedRow, EntityKind, Link, RawFilmRow, RawGenreRow, RawPersonRow};
use crate::source::{InMemorySource, SourceStore};

#[derive(Default)]
struct SourceFaults {
    queries: usize,
    fail_next: usize,
    undecodable: HashSet<Uuid>,
}

/// [`InMemorySource`] that can fail queries and drop change rows the way
/// the Postgres store drops rows it cannot decode.
#[derive(Default)]
pub struct FlakySource {
    inner: InMemorySource,
    faults: Mutex<SourceFaults>,
}

impl FlakySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> MutexGuard<'_, SourceFaults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `n` queries fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.faults().fail_next = n;
    }

    /// Count `id` as scanned by change detection but leave it out of the rows.
    pub fn undecodable(&self, id: Uuid) {
        self.faults().undecodable.insert(id);
    }

    /// Queries attempted, failed ones included.
    pub fn query_count(&self) -> usize {
        self.faults().queries
    }

    fn check(&self) -> SyncResult<()> {
        let mut faults = self.faults();
        faults.queries += 1;
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(SyncError::SourceUnavailable(
                "injected connection failure".to_string(),
            ));
        }
        Ok(())
    }

    fn decodable(&self, rows: Vec<ChangedRow>) -> Vec<ChangedRow> {
        let faults = self.faults();
        rows.into_iter()
            .filter(|r| !faults.undecodable.contains(&r.id))
            .collect()
    }
}

impl Deref for FlakySource {
    type Target = InMemorySource;

    fn deref(&self) -> &InMemorySource {
        &self.inner
    }
}

#[async_trait]
impl SourceStore for FlakySource {
    async fn ping(&self) -> SyncResult<()> {
        self.check()?;
        self.inner.ping().await
    }

    async fn modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> SyncResult<ChangeBatch> {
        self.check()?;
        let batch = self.inner.modified_since(kind, since, limit).await?;
        Ok(ChangeBatch {
            rows: self.decodable(batch.rows),
            scanned: batch.scanned,
        })
    }

    async fn modified_at(&self, kind: EntityKind, at: DateTime<Utc>) -> SyncResult<Vec<ChangedRow>> {
        self.check()?;
        let rows = self.inner.modified_at(kind, at).await?;
        Ok(self.decodable(rows))
    }

    async fn linked_ids(&self, link: Link, ids: &[Uuid]) -> SyncResult<Vec<Uuid>> {
        self.check()?;
        self.inner.linked_ids(link, ids).await
    }

    async fn film_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawFilmRow>> {
        self.check()?;
        self.inner.film_rows(ids).await
    }

    async fn genre_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawGenreRow>> {
        self.check()?;
        self.inner.genre_rows(ids).await
    }

    async fn person_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawPersonRow>> {
        self.check()?;
        self.inner.person_rows(ids).await
    }
}

#[derive(Default)]
struct IndexFaults {
    bulk_calls: usize,
    fail_next: usize,
    rejected: HashSet<String>,
}

/// [`InMemoryIndex`] that can fail bulk calls and reject single documents.
#[derive(Default)]
pub struct FlakyIndex {
    inner: InMemoryIndex,
    faults: Mutex<IndexFaults>,
}

impl FlakyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn faults(&self) -> MutexGuard<'_, IndexFaults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `n` bulk calls fail with a retryable error.
    pub fn fail_next_bulk(&self, n: usize) {
        self.faults().fail_next = n;
    }

    /// Reject every future write of document `id` with a 400.
    pub fn reject_id(&self, id: impl Into<String>) {
        self.faults().rejected.insert(id.into());
    }

    /// Bulk calls attempted, failed ones included.
    pub fn bulk_calls(&self) -> usize {
        self.faults().bulk_calls
    }
}

impl Deref for FlakyIndex {
    type Target = InMemoryIndex;

    fn deref(&self) -> &InMemoryIndex {
        &self.inner
    }
}

#[async_trait]
impl SearchIndex for FlakyIndex {
    async fn ping(&self) -> SyncResult<()> {
        self.inner.ping().await
    }

    async fn ensure_index(&self, index: &str, schema: &Value) -> SyncResult<bool> {
        self.inner.ensure_index(index, schema).await
    }

    async fn bulk_upsert(&self, index: &str, items: &[BulkItem]) -> SyncResult<Vec<ItemResult>> {
        let rejected: HashSet<String> = {
            let mut faults = self.faults();
            faults.bulk_calls += 1;
            if faults.fail_next > 0 {
                faults.fail_next -= 1;
                return Err(SyncError::IndexUnavailable(
                    "injected transient failure".to_string(),
                ));
            }
            faults.rejected.clone()
        };

        let accepted: Vec<BulkItem> = items
            .iter()
            .filter(|item| !rejected.contains(&item.id))
            .cloned()
            .collect();
        let mut indexed = self.inner.bulk_upsert(index, &accepted).await?.into_iter();

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            if rejected.contains(&item.id) {
                results.push(ItemResult {
                    id: item.id.clone(),
                    outcome: ItemOutcome::Rejected {
                        status: 400,
                        reason: "mapper_parsing_exception".to_string(),
                    },
                });
            } else if let Some(result) = indexed.next() {
                results.push(result);
            }
        }
        Ok(results)
    }

    async fn count(&self, index: &str) -> SyncResult<u64> {
        self.inner.count(index).await
    }
}
