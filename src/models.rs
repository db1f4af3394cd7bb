//! Core data models used throughout cinesync.
//!
//! These types describe what flows through one sync cycle: the entity kinds
//! tracked in the source store, the change sets produced by detection, the
//! raw join rows read for aggregation, and the denormalized documents written
//! to the search index.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A table of the source catalogue whose `modified` column is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Filmwork,
    Genre,
    Person,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Filmwork => "filmwork",
            EntityKind::Genre => "genre",
            EntityKind::Person => "person",
        }
    }

    /// Source table name. Closed set, safe to splice into SQL.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::Filmwork => "film_work",
            EntityKind::Genre => "genre",
            EntityKind::Person => "person",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An association table walked to find aggregates affected by a change to a
/// related entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    GenreToFilms,
    PersonToFilms,
    FilmToGenres,
    FilmToPersons,
}

impl Link {
    /// The link from `changed` rows to `aggregate` ids, if one exists.
    pub fn between(changed: EntityKind, aggregate: EntityKind) -> Option<Link> {
        match (changed, aggregate) {
            (EntityKind::Genre, EntityKind::Filmwork) => Some(Link::GenreToFilms),
            (EntityKind::Person, EntityKind::Filmwork) => Some(Link::PersonToFilms),
            (EntityKind::Filmwork, EntityKind::Genre) => Some(Link::FilmToGenres),
            (EntityKind::Filmwork, EntityKind::Person) => Some(Link::FilmToPersons),
            _ => None,
        }
    }

    /// `(table, column matched against input ids, column returned)`.
    pub fn columns(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Link::GenreToFilms => ("genre_film_work", "genre_id", "film_work_id"),
            Link::PersonToFilms => ("person_film_work", "person_id", "film_work_id"),
            Link::FilmToGenres => ("genre_film_work", "film_work_id", "genre_id"),
            Link::FilmToPersons => ("person_film_work", "film_work_id", "person_id"),
        }
    }
}

/// One index together with the entity kinds whose changes feed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncFamily {
    Movies,
    Genres,
    Persons,
}

impl SyncFamily {
    pub const ALL: [SyncFamily; 3] = [SyncFamily::Movies, SyncFamily::Genres, SyncFamily::Persons];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncFamily::Movies => "movies",
            SyncFamily::Genres => "genres",
            SyncFamily::Persons => "persons",
        }
    }

    /// The entity kind each document of this family is built around.
    pub fn aggregate(&self) -> EntityKind {
        match self {
            SyncFamily::Movies => EntityKind::Filmwork,
            SyncFamily::Genres => EntityKind::Genre,
            SyncFamily::Persons => EntityKind::Person,
        }
    }

    /// Entity kinds whose changes can alter a document of this family.
    pub fn tracked(&self) -> &'static [EntityKind] {
        match self {
            SyncFamily::Movies => &[EntityKind::Filmwork, EntityKind::Genre, EntityKind::Person],
            SyncFamily::Genres => &[EntityKind::Genre, EntityKind::Filmwork],
            SyncFamily::Persons => &[EntityKind::Person, EntityKind::Filmwork],
        }
    }

    /// State key owning the watermark of `entity` within this family.
    pub fn watermark_key(&self, entity: EntityKind) -> String {
        format!("{}.{}", self.as_str(), entity.as_str())
    }
}

impl fmt::Display for SyncFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "movies" => Ok(SyncFamily::Movies),
            "genres" => Ok(SyncFamily::Genres),
            "persons" => Ok(SyncFamily::Persons),
            other => Err(format!(
                "unknown family '{}'. Available: movies, genres, persons",
                other
            )),
        }
    }
}

/// A persisted checkpoint. `last_seen == None` means nothing was processed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub key: String,
    pub last_seen: Option<DateTime<Utc>>,
}

/// A row returned by change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedRow {
    pub id: Uuid,
    pub modified: DateTime<Utc>,
}

/// One page of change detection. `scanned` counts the rows the query
/// returned, including any that failed to decode and were dropped from `rows`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    pub rows: Vec<ChangedRow>,
    pub scanned: usize,
}

impl ChangeBatch {
    pub fn new(rows: Vec<ChangedRow>) -> Self {
        let scanned = rows.len();
        Self { rows, scanned }
    }
}

/// Changes of one entity kind since its watermark, resolved to aggregate ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub entity: EntityKind,
    pub affected_ids: BTreeSet<Uuid>,
    pub new_watermark: Option<DateTime<Utc>>,
    pub rows_seen: usize,
}

impl ChangeSet {
    pub fn empty(entity: EntityKind, since: Option<DateTime<Utc>>) -> Self {
        Self {
            entity,
            affected_ids: BTreeSet::new(),
            new_watermark: since,
            rows_seen: 0,
        }
    }

    /// True when no source row changed; the watermark must not move.
    pub fn is_empty(&self) -> bool {
        self.rows_seen == 0
    }
}

/// Role of a person in a film, as stored in `person_film_work.role`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Actor,
    Writer,
    Director,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "actor" => Ok(Role::Actor),
            "writer" => Ok(Role::Writer),
            "director" => Ok(Role::Director),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// One row of `film_work ⋈ person ⋈ genre`; film scalars repeat per pairing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFilmRow {
    pub film_id: Uuid,
    pub title: Option<String>,
    pub description: Option<String>,
    pub rating: Option<f64>,
    pub film_type: Option<String>,
    pub role: Option<String>,
    pub person_id: Option<Uuid>,
    pub person_name: Option<String>,
    pub genre_id: Option<Uuid>,
    pub genre_name: Option<String>,
}

/// One row of `genre ⋈ film_work`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawGenreRow {
    pub genre_id: Uuid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub film_id: Option<Uuid>,
    pub film_title: Option<String>,
    pub film_rating: Option<f64>,
}

/// One row of `person ⋈ film_work`, carrying the role of that pairing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPersonRow {
    pub person_id: Uuid,
    pub full_name: Option<String>,
    pub film_id: Option<Uuid>,
    pub film_title: Option<String>,
    pub film_rating: Option<f64>,
    pub role: Option<String>,
}

/// `{id, name}` entry in a film's nested genre and people collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedRef {
    pub id: Uuid,
    pub name: String,
}

/// A film as listed under a genre.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmRef {
    pub id: Uuid,
    pub title: String,
    pub imdb_rating: Option<f64>,
}

/// A film as listed under a person, with every role held in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonFilm {
    pub id: Uuid,
    pub title: String,
    pub imdb_rating: Option<f64>,
    pub roles: Vec<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilmDocument {
    pub id: Uuid,
    pub imdb_rating: Option<f64>,
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub film_type: Option<String>,
    pub genres: Vec<NamedRef>,
    pub directors: Vec<NamedRef>,
    pub actors: Vec<NamedRef>,
    pub writers: Vec<NamedRef>,
    pub directors_names: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreDocument {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub films: Vec<FilmRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonDocument {
    pub id: Uuid,
    pub full_name: String,
    pub films: Vec<PersonFilm>,
}

/// The unit written to the index. Identity is [`AggregateDocument::id`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateDocument {
    Film(FilmDocument),
    Genre(GenreDocument),
    Person(PersonDocument),
}

impl AggregateDocument {
    pub fn id(&self) -> Uuid {
        match self {
            AggregateDocument::Film(d) => d.id,
            AggregateDocument::Genre(d) => d.id,
            AggregateDocument::Person(d) => d.id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_keys_are_scoped_by_family() {
        assert_eq!(
            SyncFamily::Movies.watermark_key(EntityKind::Genre),
            "movies.genre"
        );
        assert_ne!(
            SyncFamily::Movies.watermark_key(EntityKind::Filmwork),
            SyncFamily::Genres.watermark_key(EntityKind::Filmwork)
        );
    }

    #[test]
    fn every_secondary_entity_has_a_link() {
        for family in SyncFamily::ALL {
            for &entity in family.tracked() {
                if entity != family.aggregate() {
                    assert!(
                        Link::between(entity, family.aggregate()).is_some(),
                        "{} -> {}",
                        entity,
                        family
                    );
                }
            }
        }
    }

    #[test]
    fn role_parsing_is_case_insensitive() {
        assert_eq!("Director".parse::<Role>().unwrap(), Role::Director);
        assert!("producer".parse::<Role>().is_err());
    }

    #[test]
    fn film_document_serializes_type_and_null_rating() {
        let doc = AggregateDocument::Film(FilmDocument {
            id: Uuid::nil(),
            imdb_rating: None,
            title: "Solaris".to_string(),
            description: None,
            film_type: Some("movie".to_string()),
            genres: vec![],
            directors: vec![],
            actors: vec![],
            writers: vec![],
            directors_names: vec![],
            actors_names: vec![],
            writers_names: vec![],
        });
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["type"], "movie");
        assert!(json["imdb_rating"].is_null());
        assert_eq!(json["title"], "Solaris");
    }
}
