//! Durable sync state: watermarks per tracked entity key.
//!
//! [`StateStore`] is the raw key → JSON value interface. Two backends ship:
//!
//! - **[`JsonFileStore`]**: one JSON object on disk. Every `set` rewrites a
//!   sibling temp file, fsyncs it and renames it over the original, so a
//!   crash mid-write leaves the previous file intact.
//! - **[`SqliteStateStore`]**: rows of the `checkpoints` table; each `set`
//!   is a single upsert statement.
//!
//! [`WatermarkStore`] sits on top and is the only component that reads or
//! writes watermarks. It refuses to move a watermark backwards.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::models::Watermark;

/// Key/value persistence for sync state.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>>;

    /// Persist `value` under `key`. Atomic per key with respect to crashes.
    async fn set(&self, key: &str, value: Value) -> SyncResult<()>;

    /// Every stored key, sorted.
    async fn entries(&self) -> SyncResult<Vec<(String, Value)>>;
}

// ============ JSON file ============

pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write between concurrently syncing families.
    lock: Arc<Mutex<()>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the file on the blocking pool, holding the lock.
    async fn with_file<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&Path) -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let path = self.path.clone();
        let lock = Arc::clone(&self.lock);
        tokio::task::spawn_blocking(move || {
            // The file on disk is always whole, so a poisoned lock guards nothing.
            let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&path)
        })
        .await
        .map_err(|e| SyncError::State(format!("state file task failed: {}", e)))?
    }
}

fn read_map(path: &Path) -> SyncResult<BTreeMap<String, Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(SyncError::State(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        }
    };
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(&content).map_err(|e| {
        SyncError::State(format!(
            "state file {} is not a JSON object: {}",
            path.display(),
            e
        ))
    })
}

/// Replace the file through a synced temp file and rename, then sync the
/// directory so the rename itself survives a power loss.
fn write_map(path: &Path, map: &BTreeMap<String, Value>) -> SyncResult<()> {
    let state_err = |e: std::io::Error| SyncError::State(format!("{}: {}", path.display(), e));

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(state_err)?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let body = serde_json::to_vec_pretty(map)?;
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(state_err)?;
        file.write_all(&body).map_err(state_err)?;
        file.sync_all().map_err(state_err)?;
    }
    std::fs::rename(&tmp_path, path).map_err(state_err)?;

    #[cfg(unix)]
    std::fs::File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(state_err)?;

    Ok(())
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        let key = key.to_string();
        self.with_file(move |path| Ok(read_map(path)?.remove(&key)))
            .await
    }

    async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
        let key = key.to_string();
        self.with_file(move |path| {
            let mut map = read_map(path)?;
            map.insert(key, value);
            write_map(path, &map)
        })
        .await
    }

    async fn entries(&self) -> SyncResult<Vec<(String, Value)>> {
        self.with_file(|path| Ok(read_map(path)?.into_iter().collect()))
            .await
    }
}

// ============ SQLite ============

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    /// Wrap a pool whose database already has the `checkpoints` table
    /// (see [`crate::migrate::run_state_migrations`]).
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn get(&self, key: &str) -> SyncResult<Option<Value>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM checkpoints WHERE source = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| SyncError::State(e.to_string()))?;

        match cursor {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> SyncResult<()> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, cursor, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::State(e.to_string()))?;

        Ok(())
    }

    async fn entries(&self) -> SyncResult<Vec<(String, Value)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT source, cursor FROM checkpoints ORDER BY source")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| SyncError::State(e.to_string()))?;

        rows.into_iter()
            .map(|(key, raw)| Ok((key, serde_json::from_str(&raw)?)))
            .collect()
    }
}

/// Build the configured state backend.
pub async fn open_state_store(config: &Config) -> anyhow::Result<Arc<dyn StateStore>> {
    match config.state.backend.as_str() {
        "json" => Ok(Arc::new(JsonFileStore::new(&config.state.path))),
        "sqlite" => {
            let pool = crate::db::connect_state(&config.state.path).await?;
            crate::migrate::run_state_migrations(&pool).await?;
            Ok(Arc::new(SqliteStateStore::new(pool)))
        }
        other => anyhow::bail!("Unknown state backend: {}", other),
    }
}

// ============ Watermarks ============

/// Typed watermark access over a [`StateStore`].
#[derive(Clone)]
pub struct WatermarkStore {
    store: Arc<dyn StateStore>,
}

impl WatermarkStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Last committed timestamp for `key`; `None` when never committed.
    pub async fn get(&self, key: &str) -> SyncResult<Option<DateTime<Utc>>> {
        match self.store.get(key).await? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => parse_timestamp(key, &value).map(Some),
        }
    }

    /// Commit `ts` for `key`. A value older than the stored one is ignored.
    pub async fn set(&self, key: &str, ts: DateTime<Utc>) -> SyncResult<()> {
        if let Some(current) = self.get(key).await? {
            if ts < current {
                warn!(
                    key,
                    current = %format_timestamp(current),
                    requested = %format_timestamp(ts),
                    "refusing to move watermark backwards"
                );
                return Ok(());
            }
            if ts == current {
                return Ok(());
            }
        }
        debug!(key, watermark = %format_timestamp(ts), "committing watermark");
        self.store
            .set(key, Value::String(format_timestamp(ts)))
            .await
    }

    pub async fn entries(&self) -> SyncResult<Vec<Watermark>> {
        let mut out = Vec::new();
        for (key, value) in self.store.entries().await? {
            let last_seen = match value {
                Value::Null => None,
                ref v => Some(parse_timestamp(&key, v)?),
            };
            out.push(Watermark { key, last_seen });
        }
        Ok(out)
    }
}

/// RFC 3339 with full sub-second precision, so ties survive a round trip.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn parse_timestamp(key: &str, value: &Value) -> SyncResult<DateTime<Utc>> {
    let raw = value
        .as_str()
        .ok_or_else(|| SyncError::State(format!("watermark '{}' is not a string", key)))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::State(format!("watermark '{}' = '{}': {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(secs: i64, micros: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, micros * 1000).unwrap()
    }

    #[tokio::test]
    async fn json_missing_key_is_none() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(Arc::new(JsonFileStore::new(tmp.path().join("s.json"))));
        assert_eq!(store.get("movies.genre").await.unwrap(), None);
    }

    #[tokio::test]
    async fn json_set_survives_reopen_with_microseconds() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state").join("s.json");
        let t = ts(1_700_000_000, 123_456);

        WatermarkStore::new(Arc::new(JsonFileStore::new(&path)))
            .set("movies.genre", t)
            .await
            .unwrap();

        let reopened = WatermarkStore::new(Arc::new(JsonFileStore::new(&path)));
        assert_eq!(reopened.get("movies.genre").await.unwrap(), Some(t));
        assert!(!path.with_file_name("s.json.tmp").exists());
    }

    #[tokio::test]
    async fn json_keys_are_independent() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(Arc::new(JsonFileStore::new(tmp.path().join("s.json"))));
        store.set("movies.genre", ts(100, 0)).await.unwrap();
        store.set("movies.person", ts(200, 0)).await.unwrap();

        assert_eq!(store.get("movies.genre").await.unwrap(), Some(ts(100, 0)));
        assert_eq!(store.get("movies.person").await.unwrap(), Some(ts(200, 0)));
        let keys: Vec<String> = store
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.key)
            .collect();
        assert_eq!(keys, vec!["movies.genre", "movies.person"]);
    }

    #[tokio::test]
    async fn watermark_never_moves_backwards() {
        let tmp = TempDir::new().unwrap();
        let store = WatermarkStore::new(Arc::new(JsonFileStore::new(tmp.path().join("s.json"))));
        store.set("genres.genre", ts(500, 0)).await.unwrap();
        store.set("genres.genre", ts(400, 0)).await.unwrap();
        assert_eq!(store.get("genres.genre").await.unwrap(), Some(ts(500, 0)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn json_concurrent_writers_keep_every_key() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.json");
        let store = WatermarkStore::new(Arc::new(JsonFileStore::new(&path)));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.spawn(async move { store.set(&format!("movies.k{:02}", i), ts(i, 0)).await });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap().unwrap();
        }

        let reopened = WatermarkStore::new(Arc::new(JsonFileStore::new(&path)));
        let entries = reopened.entries().await.unwrap();
        assert_eq!(entries.len(), 16);
        assert_eq!(reopened.get("movies.k07").await.unwrap(), Some(ts(7, 0)));
        assert!(!tmp.path().join("s.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_fails_fast_and_is_kept() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("s.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = WatermarkStore::new(Arc::new(JsonFileStore::new(&path)));

        assert!(matches!(
            store.get("movies.genre").await,
            Err(SyncError::State(_))
        ));
        assert!(store.set("movies.genre", ts(1, 0)).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn sqlite_backend_round_trips() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_state(&tmp.path().join("state.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_state_migrations(&pool).await.unwrap();
        let store = WatermarkStore::new(Arc::new(SqliteStateStore::new(pool)));

        assert_eq!(store.get("persons.person").await.unwrap(), None);
        store.set("persons.person", ts(42, 7)).await.unwrap();
        store.set("persons.person", ts(43, 0)).await.unwrap();
        assert_eq!(store.get("persons.person").await.unwrap(), Some(ts(43, 0)));
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }
}
