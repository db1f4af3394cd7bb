//! Elasticsearch client for the [`SearchIndex`] trait.
//!
//! Speaks the plain REST API over `reqwest`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | [`ping`](SearchIndex::ping) | `GET /` |
//! | [`ensure_index`](SearchIndex::ensure_index) | `HEAD /{index}`, then `PUT /{index}` with the schema |
//! | [`bulk_upsert`](SearchIndex::bulk_upsert) | `POST /_bulk` (NDJSON, `index` action) |
//! | [`count`](SearchIndex::count) | `GET /{index}/_count` |
//!
//! # Error mapping
//!
//! - connection errors, timeouts, HTTP 429 and 5xx → retryable
//! - other 4xx → [`SyncError::IndexRejected`]
//! - a bulk response where any item was throttled (429) → retryable for the
//!   whole batch; re-sending already indexed items is harmless because the
//!   `index` action replaces by id

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::config::ElasticConfig;
use crate::error::{classify_status, SyncError, SyncResult};
use crate::index::{BulkItem, ItemOutcome, ItemResult, SearchIndex};

pub struct ElasticClient {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<String>,
}

impl ElasticClient {
    pub fn new(config: &ElasticConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }
}

/// Serialize items as `_bulk` NDJSON: an action line then a source line each.
pub fn bulk_body(index: &str, items: &[BulkItem]) -> SyncResult<String> {
    let mut body = String::new();
    for item in items {
        let action = serde_json::json!({ "index": { "_index": index, "_id": item.id } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&item.body)?);
        body.push('\n');
    }
    Ok(body)
}

/// Turn a `_bulk` response into per-item results.
pub fn parse_bulk_response(json: &Value, items: &[BulkItem]) -> SyncResult<Vec<ItemResult>> {
    let entries = json
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| SyncError::IndexResponse("bulk response missing items array".into()))?;

    if entries.len() != items.len() {
        return Err(SyncError::IndexResponse(format!(
            "bulk response has {} items, request had {}",
            entries.len(),
            items.len()
        )));
    }

    let mut results = Vec::with_capacity(entries.len());
    let mut throttled = 0usize;
    for (entry, item) in entries.iter().zip(items) {
        // Each entry is keyed by its action name: {"index": {...}}
        let detail = entry
            .as_object()
            .and_then(|obj| obj.values().next())
            .ok_or_else(|| SyncError::IndexResponse("malformed bulk item".into()))?;

        let status = detail
            .get("status")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u16;
        let id = detail
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or(&item.id)
            .to_string();

        let outcome = match detail.get("error") {
            None if (200..300).contains(&status) => ItemOutcome::Indexed,
            error => {
                if status == 429 {
                    throttled += 1;
                }
                ItemOutcome::Rejected {
                    status,
                    reason: describe_error(error),
                }
            }
        };
        results.push(ItemResult { id, outcome });
    }

    if throttled > 0 {
        return Err(SyncError::IndexUnavailable(format!(
            "{} bulk items throttled",
            throttled
        )));
    }
    Ok(results)
}

fn describe_error(error: Option<&Value>) -> String {
    match error {
        Some(Value::Object(obj)) => {
            let kind = obj.get("type").and_then(Value::as_str).unwrap_or("error");
            match obj.get("reason").and_then(Value::as_str) {
                Some(reason) => format!("{}: {}", kind, reason),
                None => kind.to_string(),
            }
        }
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "unexpected item status".to_string(),
    }
}

async fn error_for_status(response: reqwest::Response) -> SyncError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_status(status, body)
}

#[async_trait]
impl SearchIndex for ElasticClient {
    async fn ping(&self) -> SyncResult<()> {
        let response = self.authed(self.client.get(self.url("/"))).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(response).await)
        }
    }

    async fn ensure_index(&self, index: &str, schema: &Value) -> SyncResult<bool> {
        let head = self.authed(self.client.head(self.url(index))).send().await?;
        match head.status() {
            s if s.is_success() => return Ok(false),
            StatusCode::NOT_FOUND => {}
            _ => return Err(error_for_status(head).await),
        }

        let response = self
            .authed(self.client.put(self.url(index)))
            .json(schema)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(true);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        // Lost a race with another creator: the index exists, which is all we need.
        if status == 400 && body.contains("resource_already_exists_exception") {
            return Ok(false);
        }
        Err(classify_status(status, body))
    }

    async fn bulk_upsert(&self, index: &str, items: &[BulkItem]) -> SyncResult<Vec<ItemResult>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let body = bulk_body(index, items)?;
        let response = self
            .authed(self.client.post(self.url("/_bulk")))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        let json: Value = response.json().await?;
        let results = parse_bulk_response(&json, items)?;
        let errors = json
            .get("errors")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        debug!(index, items = items.len(), errors, "bulk request done");
        Ok(results)
    }

    async fn count(&self, index: &str) -> SyncResult<u64> {
        let response = self
            .authed(self.client.get(self.url(&format!("{}/_count", index))))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }
        let json: Value = response.json().await?;
        json.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::IndexResponse("count response missing count".into()))
    }
}
