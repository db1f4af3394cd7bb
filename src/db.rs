use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Lazily connecting pool for the source catalogue.
///
/// Nothing is dialed here; the first query (or the startup probe) opens the
/// first connection. `search_path` is set per connection so queries can name
/// tables without a schema prefix.
pub fn connect_source(config: &Config) -> Result<PgPool> {
    let dsn = config.postgres_dsn()?;
    let options = PgConnectOptions::from_str(dsn)
        .context("postgres.dsn is not a valid connection string")?
        .options([("search_path", config.postgres.schema.as_str())]);

    let pool = PgPoolOptions::new()
        .max_connections(config.postgres.max_connections)
        .acquire_timeout(Duration::from_secs(config.postgres.connect_timeout_secs))
        .connect_lazy_with(options);

    Ok(pool)
}

/// Open (creating if missing) the SQLite database backing the state store.
pub async fn connect_state(path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    Ok(pool)
}
