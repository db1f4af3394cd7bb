//! PostgreSQL implementation of [`SourceStore`].
//!
//! All statements are parameterized; the only spliced identifiers are table
//! and column names taken from the closed [`EntityKind`] and [`Link`] enums.
//! Id sets are bound as a single `uuid[]` and matched with `= ANY($1)`.
//!
//! Rows that fail to decode are logged and skipped rather than failing the
//! whole query.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{ChangeBatch, ChangedRow, EntityKind, Link, RawFilmRow, RawGenreRow, RawPersonRow};
use crate::source::SourceStore;

pub struct PgSourceStore {
    pool: PgPool,
}

impl PgSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn changed_row(kind: EntityKind, row: &PgRow) -> Option<ChangedRow> {
    let decoded = (|| -> Result<ChangedRow, sqlx::Error> {
        Ok(ChangedRow {
            id: row.try_get("id")?,
            modified: row.try_get("modified")?,
        })
    })();
    match decoded {
        Ok(r) => Some(r),
        Err(e) => {
            warn!(entity = %kind, error = %e, "skipping undecodable change row");
            None
        }
    }
}

fn film_row(row: &PgRow) -> Result<RawFilmRow, sqlx::Error> {
    Ok(RawFilmRow {
        film_id: row.try_get("fw_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        rating: row.try_get("rating")?,
        film_type: row.try_get("film_type")?,
        role: row.try_get("role")?,
        person_id: row.try_get("person_id")?,
        person_name: row.try_get("full_name")?,
        genre_id: row.try_get("genre_id")?,
        genre_name: row.try_get("genre_name")?,
    })
}

fn genre_row(row: &PgRow) -> Result<RawGenreRow, sqlx::Error> {
    Ok(RawGenreRow {
        genre_id: row.try_get("genre_id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        film_id: row.try_get("fw_id")?,
        film_title: row.try_get("title")?,
        film_rating: row.try_get("rating")?,
    })
}

fn person_row(row: &PgRow) -> Result<RawPersonRow, sqlx::Error> {
    Ok(RawPersonRow {
        person_id: row.try_get("person_id")?,
        full_name: row.try_get("full_name")?,
        film_id: row.try_get("fw_id")?,
        film_title: row.try_get("title")?,
        film_rating: row.try_get("rating")?,
        role: row.try_get("role")?,
    })
}

/// Decode every row, dropping (and logging) the ones that do not fit.
fn decode_all<T>(
    what: &str,
    rows: Vec<PgRow>,
    decode: impl Fn(&PgRow) -> Result<T, sqlx::Error>,
) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(rows = what, error = %e, "skipping undecodable row");
                None
            }
        })
        .collect()
}

#[async_trait]
impl SourceStore for PgSourceStore {
    async fn ping(&self) -> SyncResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> SyncResult<ChangeBatch> {
        let sql = format!(
            "SELECT id, modified FROM {} \
             WHERE ($1::timestamptz IS NULL OR modified > $1) \
             ORDER BY modified, id \
             LIMIT $2",
            kind.table()
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(ChangeBatch {
            rows: rows.iter().filter_map(|r| changed_row(kind, r)).collect(),
            scanned: rows.len(),
        })
    }

    async fn modified_at(&self, kind: EntityKind, at: DateTime<Utc>) -> SyncResult<Vec<ChangedRow>> {
        let sql = format!(
            "SELECT id, modified FROM {} WHERE modified = $1 ORDER BY id",
            kind.table()
        );
        let rows = sqlx::query(&sql).bind(at).fetch_all(&self.pool).await?;

        Ok(rows.iter().filter_map(|r| changed_row(kind, r)).collect())
    }

    async fn linked_ids(&self, link: Link, ids: &[Uuid]) -> SyncResult<Vec<Uuid>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let (table, from_col, to_col) = link.columns();
        let sql = format!(
            "SELECT DISTINCT {to} FROM {table} WHERE {from} = ANY($1)",
            to = to_col,
            table = table,
            from = from_col
        );
        let found: Vec<Uuid> = sqlx::query_scalar(&sql)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(found)
    }

    async fn film_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawFilmRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT
                fw.id AS fw_id,
                fw.title,
                fw.description,
                fw.rating,
                fw.type::text AS film_type,
                pfw.role::text AS role,
                p.id AS person_id,
                p.full_name,
                g.id AS genre_id,
                g.name AS genre_name
            FROM film_work fw
            LEFT JOIN person_film_work pfw ON pfw.film_work_id = fw.id
            LEFT JOIN person p ON p.id = pfw.person_id
            LEFT JOIN genre_film_work gfw ON gfw.film_work_id = fw.id
            LEFT JOIN genre g ON g.id = gfw.genre_id
            WHERE fw.id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all("film", rows, film_row))
    }

    async fn genre_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawGenreRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT
                g.id AS genre_id,
                g.name,
                g.description,
                fw.id AS fw_id,
                fw.title,
                fw.rating
            FROM genre g
            LEFT JOIN genre_film_work gfw ON gfw.genre_id = g.id
            LEFT JOIN film_work fw ON fw.id = gfw.film_work_id
            WHERE g.id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all("genre", rows, genre_row))
    }

    async fn person_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawPersonRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT
                p.id AS person_id,
                p.full_name,
                fw.id AS fw_id,
                fw.title,
                fw.rating,
                pfw.role::text AS role
            FROM person p
            LEFT JOIN person_film_work pfw ON pfw.person_id = p.id
            LEFT JOIN film_work fw ON fw.id = pfw.film_work_id
            WHERE p.id = ANY($1)
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(decode_all("person", rows, person_row))
    }
}
