//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is everything the pipeline needs from the index:
//! a connectivity probe, index bootstrap from a static schema, bulk upsert
//! with per-item outcomes, and a document count. [`crate::elastic`] talks to
//! a real Elasticsearch cluster; [`InMemoryIndex`] backs the tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::SyncResult;

/// One document of a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub id: String,
    pub body: Value,
}

/// Outcome of a single bulk item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Indexed,
    Rejected { status: u16, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemResult {
    pub id: String,
    pub outcome: ItemOutcome,
}

impl ItemResult {
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, ItemOutcome::Indexed)
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Cheap connectivity probe used at startup.
    async fn ping(&self) -> SyncResult<()>;

    /// Create `index` from `schema` unless it exists. Returns `true` if created.
    async fn ensure_index(&self, index: &str, schema: &Value) -> SyncResult<bool>;

    /// Create-or-replace every item keyed by its id.
    ///
    /// Returns one result per item. An `Err` means the request as a whole
    /// failed and none of the outcomes are known.
    async fn bulk_upsert(&self, index: &str, items: &[BulkItem]) -> SyncResult<Vec<ItemResult>>;

    async fn count(&self, index: &str) -> SyncResult<u64>;
}

// ============ In-memory index ============

#[derive(Default)]
struct IndexState {
    indices: HashMap<String, BTreeMap<String, Value>>,
    schemas: HashMap<String, Value>,
    bulk_calls: usize,
}

/// In-memory index for tests. Stores the last body written per id.
#[derive(Default)]
pub struct InMemoryIndex {
    state: Mutex<IndexState>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn bulk_calls(&self) -> usize {
        self.lock().bulk_calls
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        self.lock()
            .indices
            .get(index)
            .and_then(|docs| docs.get(id).cloned())
    }

    /// Every document of `index`, ordered by id.
    pub fn documents(&self, index: &str) -> BTreeMap<String, Value> {
        self.lock().indices.get(index).cloned().unwrap_or_default()
    }

    pub fn schema(&self, index: &str) -> Option<Value> {
        self.lock().schemas.get(index).cloned()
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn ping(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn ensure_index(&self, index: &str, schema: &Value) -> SyncResult<bool> {
        let mut state = self.lock();
        if state.schemas.contains_key(index) {
            return Ok(false);
        }
        state.schemas.insert(index.to_string(), schema.clone());
        state.indices.entry(index.to_string()).or_default();
        Ok(true)
    }

    async fn bulk_upsert(&self, index: &str, items: &[BulkItem]) -> SyncResult<Vec<ItemResult>> {
        let mut state = self.lock();
        state.bulk_calls += 1;

        let mut results = Vec::with_capacity(items.len());
        for item in items {
            state
                .indices
                .entry(index.to_string())
                .or_default()
                .insert(item.id.clone(), item.body.clone());
            results.push(ItemResult {
                id: item.id.clone(),
                outcome: ItemOutcome::Indexed,
            });
        }
        Ok(results)
    }

    async fn count(&self, index: &str) -> SyncResult<u64> {
        Ok(self
            .lock()
            .indices
            .get(index)
            .map(|docs| docs.len() as u64)
            .unwrap_or(0))
    }
}
