//! Relational source abstraction.
//!
//! [`SourceStore`] is the read-only interface onto the movie catalogue:
//! change detection by `modified`, association walks, and the LEFT JOIN
//! reads that feed aggregation. [`crate::source_postgres`] implements it with
//! sqlx; [`InMemorySource`] implements the same query semantics over plain
//! collections for tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{ChangeBatch, ChangedRow, EntityKind, Link, RawFilmRow, RawGenreRow, RawPersonRow};

#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Cheap connectivity probe used at startup.
    async fn ping(&self) -> SyncResult<()>;

    /// Rows of `kind` with `modified > since` (all rows when `since` is
    /// `None`), ordered by `(modified, id)`, at most `limit` scanned.
    async fn modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> SyncResult<ChangeBatch>;

    /// Every row of `kind` whose `modified` equals `at` exactly.
    async fn modified_at(&self, kind: EntityKind, at: DateTime<Utc>) -> SyncResult<Vec<ChangedRow>>;

    /// Distinct ids reached from `ids` through the association table of `link`.
    async fn linked_ids(&self, link: Link, ids: &[Uuid]) -> SyncResult<Vec<Uuid>>;

    async fn film_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawFilmRow>>;

    async fn genre_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawGenreRow>>;

    async fn person_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawPersonRow>>;
}

// ============ In-memory source ============

#[derive(Debug, Clone)]
pub struct FilmRecord {
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub film_type: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GenreRecord {
    pub name: Option<String>,
    pub description: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PersonRecord {
    pub full_name: Option<String>,
    pub modified: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    films: HashMap<Uuid, FilmRecord>,
    genres: HashMap<Uuid, GenreRecord>,
    persons: HashMap<Uuid, PersonRecord>,
    // (genre_id, film_id)
    genre_films: Vec<(Uuid, Uuid)>,
    // (person_id, film_id, role)
    person_films: Vec<(Uuid, Uuid, String)>,
}

/// Catalogue held in memory, answering queries the way the SQL does.
#[derive(Default)]
pub struct InMemorySource {
    tables: Mutex<Tables>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn upsert_film(&self, id: Uuid, record: FilmRecord) {
        self.lock().films.insert(id, record);
    }

    pub fn upsert_genre(&self, id: Uuid, name: &str, modified: DateTime<Utc>) {
        self.lock().genres.insert(
            id,
            GenreRecord {
                name: Some(name.to_string()),
                description: None,
                modified,
            },
        );
    }

    pub fn upsert_person(&self, id: Uuid, full_name: &str, modified: DateTime<Utc>) {
        self.lock().persons.insert(
            id,
            PersonRecord {
                full_name: Some(full_name.to_string()),
                modified,
            },
        );
    }

    pub fn link_genre(&self, film_id: Uuid, genre_id: Uuid) {
        self.lock().genre_films.push((genre_id, film_id));
    }

    pub fn link_person(&self, film_id: Uuid, person_id: Uuid, role: &str) {
        self.lock()
            .person_films
            .push((person_id, film_id, role.to_string()));
    }

    pub fn delete_film(&self, id: Uuid) {
        let mut t = self.lock();
        t.films.remove(&id);
        t.genre_films.retain(|(_, f)| *f != id);
        t.person_films.retain(|(_, f, _)| *f != id);
    }
}

fn modified_rows(t: &Tables, kind: EntityKind) -> Vec<ChangedRow> {
    match kind {
        EntityKind::Filmwork => t
            .films
            .iter()
            .map(|(id, r)| ChangedRow {
                id: *id,
                modified: r.modified,
            })
            .collect(),
        EntityKind::Genre => t
            .genres
            .iter()
            .map(|(id, r)| ChangedRow {
                id: *id,
                modified: r.modified,
            })
            .collect(),
        EntityKind::Person => t
            .persons
            .iter()
            .map(|(id, r)| ChangedRow {
                id: *id,
                modified: r.modified,
            })
            .collect(),
    }
}

#[async_trait]
impl SourceStore for InMemorySource {
    async fn ping(&self) -> SyncResult<()> {
        Ok(())
    }

    async fn modified_since(
        &self,
        kind: EntityKind,
        since: Option<DateTime<Utc>>,
        limit: i64,
    ) -> SyncResult<ChangeBatch> {
        let t = self.lock();
        let mut rows: Vec<ChangedRow> = modified_rows(&t, kind)
            .into_iter()
            .filter(|r| since.map_or(true, |s| r.modified > s))
            .collect();
        rows.sort_by_key(|r| (r.modified, r.id));
        rows.truncate(limit.max(0) as usize);
        Ok(ChangeBatch::new(rows))
    }

    async fn modified_at(&self, kind: EntityKind, at: DateTime<Utc>) -> SyncResult<Vec<ChangedRow>> {
        let t = self.lock();
        let mut rows: Vec<ChangedRow> = modified_rows(&t, kind)
            .into_iter()
            .filter(|r| r.modified == at)
            .collect();
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }

    async fn linked_ids(&self, link: Link, ids: &[Uuid]) -> SyncResult<Vec<Uuid>> {
        let t = self.lock();
        let wanted: BTreeSet<Uuid> = ids.iter().copied().collect();
        let found: BTreeSet<Uuid> = match link {
            Link::GenreToFilms => t
                .genre_films
                .iter()
                .filter(|(g, _)| wanted.contains(g))
                .map(|(_, f)| *f)
                .collect(),
            Link::FilmToGenres => t
                .genre_films
                .iter()
                .filter(|(_, f)| wanted.contains(f))
                .map(|(g, _)| *g)
                .collect(),
            Link::PersonToFilms => t
                .person_films
                .iter()
                .filter(|(p, _, _)| wanted.contains(p))
                .map(|(_, f, _)| *f)
                .collect(),
            Link::FilmToPersons => t
                .person_films
                .iter()
                .filter(|(_, f, _)| wanted.contains(f))
                .map(|(p, _, _)| *p)
                .collect(),
        };
        Ok(found.into_iter().collect())
    }

    async fn film_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawFilmRow>> {
        let t = self.lock();
        let mut rows = Vec::new();
        for id in ids {
            let Some(film) = t.films.get(id) else {
                continue;
            };
            let base = RawFilmRow {
                film_id: *id,
                title: film.title.clone(),
                description: film.description.clone(),
                rating: film.rating,
                film_type: film.film_type.clone(),
                ..Default::default()
            };

            // LEFT JOIN person × LEFT JOIN genre: one row per pairing.
            let people: Vec<Option<(Uuid, String)>> = {
                let linked: Vec<_> = t
                    .person_films
                    .iter()
                    .filter(|(_, f, _)| f == id)
                    .map(|(p, _, role)| Some((*p, role.clone())))
                    .collect();
                if linked.is_empty() {
                    vec![None]
                } else {
                    linked
                }
            };
            let genres: Vec<Option<Uuid>> = {
                let linked: Vec<_> = t
                    .genre_films
                    .iter()
                    .filter(|(_, f)| f == id)
                    .map(|(g, _)| Some(*g))
                    .collect();
                if linked.is_empty() {
                    vec![None]
                } else {
                    linked
                }
            };

            for person in &people {
                for genre in &genres {
                    let mut row = base.clone();
                    if let Some((pid, role)) = person {
                        row.role = Some(role.clone());
                        if let Some(p) = t.persons.get(pid) {
                            row.person_id = Some(*pid);
                            row.person_name = p.full_name.clone();
                        }
                    }
                    if let Some(gid) = genre {
                        if let Some(g) = t.genres.get(gid) {
                            row.genre_id = Some(*gid);
                            row.genre_name = g.name.clone();
                        }
                    }
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    async fn genre_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawGenreRow>> {
        let t = self.lock();
        let mut rows = Vec::new();
        for id in ids {
            let Some(genre) = t.genres.get(id) else {
                continue;
            };
            let base = RawGenreRow {
                genre_id: *id,
                name: genre.name.clone(),
                description: genre.description.clone(),
                ..Default::default()
            };
            let films: Vec<&Uuid> = t
                .genre_films
                .iter()
                .filter(|(g, _)| g == id)
                .map(|(_, f)| f)
                .collect();
            if films.is_empty() {
                rows.push(base);
                continue;
            }
            for film_id in films {
                let mut row = base.clone();
                if let Some(film) = t.films.get(film_id) {
                    row.film_id = Some(*film_id);
                    row.film_title = film.title.clone();
                    row.film_rating = film.rating;
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }

    async fn person_rows(&self, ids: &[Uuid]) -> SyncResult<Vec<RawPersonRow>> {
        let t = self.lock();
        let mut rows = Vec::new();
        for id in ids {
            let Some(person) = t.persons.get(id) else {
                continue;
            };
            let base = RawPersonRow {
                person_id: *id,
                full_name: person.full_name.clone(),
                ..Default::default()
            };
            let films: Vec<&(Uuid, Uuid, String)> = t
                .person_films
                .iter()
                .filter(|(p, _, _)| p == id)
                .collect();
            if films.is_empty() {
                rows.push(base);
                continue;
            }
            for (_, film_id, role) in films {
                let mut row = base.clone();
                row.role = Some(role.clone());
                if let Some(film) = t.films.get(film_id) {
                    row.film_id = Some(*film_id);
                    row.film_title = film.title.clone();
                    row.film_rating = film.rating;
                }
                rows.push(row);
            }
        }
        Ok(rows)
    }
}
