//! `cinesync init`: prepare everything the sync loop expects to exist.
//!
//! Creates the SQLite `checkpoints` table when that state backend is
//! selected, and creates every enabled family's index from its static schema
//! when the index is missing. Both steps are idempotent.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::elastic::ElasticClient;
use crate::index::SearchIndex;
use crate::models::SyncFamily;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::schema;
use crate::state;

pub async fn run_state_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per watermark key; cursor holds the JSON-encoded value.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create missing indices for the given families. Returns the names created.
pub async fn ensure_indices(
    config: &Config,
    families: &[SyncFamily],
    index: &dyn SearchIndex,
    retry: &RetryExecutor,
) -> Result<Vec<String>> {
    let mut created = Vec::new();
    for &family in families {
        let index_config = config.index_for(family);
        let definition = schema::load_schema(family, index_config.schema.as_deref())?;
        let name = index_config.name.as_str();
        let was_created = retry
            .run_sync(|| index.ensure_index(name, &definition))
            .await
            .with_context(|| format!("Failed to prepare index '{}'", name))?;
        if was_created {
            info!(family = %family, index = name, "created index");
            created.push(name.to_string());
        }
    }
    Ok(created)
}

/// CLI entry point for `cinesync init`.
pub async fn run_init(config: &Config) -> Result<()> {
    let store = state::open_state_store(config).await?;
    drop(store);

    let client = ElasticClient::new(&config.elasticsearch)?;
    let retry = RetryExecutor::new(
        RetryPolicy::from_config(&config.retry).with_max_attempts(config.retry.startup_attempts),
    );
    let families = config.enabled_families()?;
    let created = ensure_indices(config, &families, &client, &retry).await?;

    println!("state backend: {} ({})", config.state.backend, config.state.path.display());
    if created.is_empty() {
        println!("indices: all present");
    } else {
        println!("indices created: {}", created.join(", "));
    }
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndex;

    fn config(families: &str) -> Config {
        let config: Config = toml::from_str(&format!("[sync]\nfamilies = {}", families)).unwrap();
        crate::config::validate(&config).unwrap();
        config
    }

    #[tokio::test]
    async fn creates_schema_for_each_requested_family() {
        let config = config(r#"["movies"]"#);
        let index = InMemoryIndex::new();
        let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));

        let created = ensure_indices(&config, &[SyncFamily::Genres], &index, &retry)
            .await
            .unwrap();

        assert_eq!(created, vec!["genres".to_string()]);
        assert_eq!(
            index.schema("genres"),
            Some(schema::load_schema(SyncFamily::Genres, None).unwrap())
        );
        assert!(index.schema("movies").is_none());
    }

    #[tokio::test]
    async fn existing_indices_are_not_reported() {
        let config = config(r#"["movies", "persons"]"#);
        let index = InMemoryIndex::new();
        let retry = RetryExecutor::new(RetryPolicy::from_config(&config.retry));
        let families = config.enabled_families().unwrap();

        let first = ensure_indices(&config, &families, &index, &retry).await.unwrap();
        assert_eq!(first, vec!["movies".to_string(), "persons".to_string()]);
        let second = ensure_indices(&config, &families, &index, &retry).await.unwrap();
        assert!(second.is_empty());
    }
}
