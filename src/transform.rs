//! Aggregation of raw join rows into index documents.
//!
//! The source query for a family returns one row per pairing of the
//! aggregate with its relations (a film with three people and two genres
//! yields six rows). Folding groups rows by aggregate id, takes the scalar
//! columns once, and collects nested items with duplicates removed by id.
//!
//! Bad data never fails a cycle: a document with no title (or name) is
//! skipped, and so is a nested entry with an unknown role or missing name.
//! Both are logged at `warn`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{
    AggregateDocument, FilmDocument, FilmRef, GenreDocument, NamedRef, PersonDocument, PersonFilm,
    RawFilmRow, RawGenreRow, RawPersonRow, Role, SyncFamily,
};
use crate::retry::{with_timeout, RetryExecutor};
use crate::source::SourceStore;

#[derive(Clone)]
pub struct Aggregator {
    source: Arc<dyn SourceStore>,
    retry: RetryExecutor,
    call_timeout: Duration,
}

impl Aggregator {
    pub fn new(source: Arc<dyn SourceStore>, retry: RetryExecutor, call_timeout: Duration) -> Self {
        Self {
            source,
            retry,
            call_timeout,
        }
    }

    /// Build one document per id that still exists in the source.
    pub async fn build_documents(
        &self,
        family: SyncFamily,
        ids: &[Uuid],
    ) -> SyncResult<Vec<AggregateDocument>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let source = &self.source;
        let timeout = self.call_timeout;

        let docs: Vec<AggregateDocument> = match family {
            SyncFamily::Movies => {
                let rows = self
                    .retry
                    .run_sync(|| with_timeout(timeout, source.film_rows(ids)))
                    .await?;
                fold_film_rows(rows)
                    .into_iter()
                    .map(AggregateDocument::Film)
                    .collect()
            }
            SyncFamily::Genres => {
                let rows = self
                    .retry
                    .run_sync(|| with_timeout(timeout, source.genre_rows(ids)))
                    .await?;
                fold_genre_rows(rows)
                    .into_iter()
                    .map(AggregateDocument::Genre)
                    .collect()
            }
            SyncFamily::Persons => {
                let rows = self
                    .retry
                    .run_sync(|| with_timeout(timeout, source.person_rows(ids)))
                    .await?;
                fold_person_rows(rows)
                    .into_iter()
                    .map(AggregateDocument::Person)
                    .collect()
            }
        };

        if docs.len() < ids.len() {
            let built: HashSet<Uuid> = docs.iter().map(|d| d.id()).collect();
            for id in ids.iter().filter(|id| !built.contains(id)) {
                debug!(family = %family, %id, "no document built, source row missing or invalid");
            }
        }
        Ok(docs)
    }
}

/// Group rows by key, preserving the order in which keys first appear.
fn group_by<R>(rows: Vec<R>, key: impl Fn(&R) -> Uuid) -> Vec<(Uuid, Vec<R>)> {
    let mut order: Vec<(Uuid, Vec<R>)> = Vec::new();
    let mut slot: HashMap<Uuid, usize> = HashMap::new();
    for row in rows {
        let k = key(&row);
        match slot.get(&k) {
            Some(&i) => order[i].1.push(row),
            None => {
                slot.insert(k, order.len());
                order.push((k, vec![row]));
            }
        }
    }
    order
}

fn push_unique(list: &mut Vec<NamedRef>, id: Uuid, name: &str) {
    if !list.iter().any(|r| r.id == id) {
        list.push(NamedRef {
            id,
            name: name.to_string(),
        });
    }
}

pub fn fold_film_rows(rows: Vec<RawFilmRow>) -> Vec<FilmDocument> {
    let mut docs = Vec::new();
    for (film_id, group) in group_by(rows, |r| r.film_id) {
        let head = &group[0];
        let Some(title) = head.title.clone() else {
            warn!(%film_id, "film has no title, skipping document");
            continue;
        };

        let mut doc = FilmDocument {
            id: film_id,
            imdb_rating: head.rating,
            title,
            description: head.description.clone(),
            film_type: head.film_type.clone(),
            genres: Vec::new(),
            directors: Vec::new(),
            actors: Vec::new(),
            writers: Vec::new(),
            directors_names: Vec::new(),
            actors_names: Vec::new(),
            writers_names: Vec::new(),
        };

        for row in &group {
            if let (Some(id), Some(name)) = (row.genre_id, row.genre_name.as_deref()) {
                push_unique(&mut doc.genres, id, name);
            }

            let (Some(person_id), Some(role)) = (row.person_id, row.role.as_deref()) else {
                continue;
            };
            let Some(name) = row.person_name.as_deref() else {
                warn!(%film_id, %person_id, "person has no name, skipping entry");
                continue;
            };
            let role = match role.parse::<Role>() {
                Ok(r) => r,
                Err(e) => {
                    warn!(%film_id, %person_id, error = %e, "skipping person entry");
                    continue;
                }
            };
            let list = match role {
                Role::Director => &mut doc.directors,
                Role::Actor => &mut doc.actors,
                Role::Writer => &mut doc.writers,
            };
            push_unique(list, person_id, name);
        }

        doc.directors_names = doc.directors.iter().map(|p| p.name.clone()).collect();
        doc.actors_names = doc.actors.iter().map(|p| p.name.clone()).collect();
        doc.writers_names = doc.writers.iter().map(|p| p.name.clone()).collect();
        docs.push(doc);
    }
    docs
}

pub fn fold_genre_rows(rows: Vec<RawGenreRow>) -> Vec<GenreDocument> {
    let mut docs = Vec::new();
    for (genre_id, group) in group_by(rows, |r| r.genre_id) {
        let head = &group[0];
        let Some(name) = head.name.clone() else {
            warn!(%genre_id, "genre has no name, skipping document");
            continue;
        };

        let mut films: Vec<FilmRef> = Vec::new();
        for row in &group {
            let Some(film_id) = row.film_id else { continue };
            if films.iter().any(|f| f.id == film_id) {
                continue;
            }
            let Some(title) = row.film_title.clone() else {
                warn!(%genre_id, %film_id, "film has no title, skipping entry");
                continue;
            };
            films.push(FilmRef {
                id: film_id,
                title,
                imdb_rating: row.film_rating,
            });
        }

        docs.push(GenreDocument {
            id: genre_id,
            name,
            description: head.description.clone(),
            films,
        });
    }
    docs
}

pub fn fold_person_rows(rows: Vec<RawPersonRow>) -> Vec<PersonDocument> {
    let mut docs = Vec::new();
    for (person_id, group) in group_by(rows, |r| r.person_id) {
        let head = &group[0];
        let Some(full_name) = head.full_name.clone() else {
            warn!(%person_id, "person has no name, skipping document");
            continue;
        };

        let mut films: Vec<PersonFilm> = Vec::new();
        for row in &group {
            let Some(film_id) = row.film_id else { continue };
            let role = match row.role.as_deref().map(str::parse::<Role>) {
                Some(Ok(r)) => Some(r),
                Some(Err(e)) => {
                    warn!(%person_id, %film_id, error = %e, "ignoring role");
                    None
                }
                None => None,
            };

            if let Some(existing) = films.iter_mut().find(|f| f.id == film_id) {
                if let Some(role) = role {
                    if !existing.roles.contains(&role) {
                        existing.roles.push(role);
                    }
                }
                continue;
            }
            let Some(title) = row.film_title.clone() else {
                warn!(%person_id, %film_id, "film has no title, skipping entry");
                continue;
            };
            films.push(PersonFilm {
                id: film_id,
                title,
                imdb_rating: row.film_rating,
                roles: role.into_iter().collect(),
            });
        }

        docs.push(PersonDocument {
            id: person_id,
            full_name,
            films,
        });
    }
    docs
}
