//! Static index definitions.
//!
//! Each family's index is created from a fixed `settings` + `mappings` body.
//! The built-in definitions below match the documents produced by
//! [`crate::transform`]; an operator can replace one with a JSON file via
//! `indices.<family>.schema`.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;

use crate::models::SyncFamily;

fn analysis() -> Value {
    json!({
        "filter": {
            "english_stop": { "type": "stop", "stopwords": "_english_" },
            "english_stemmer": { "type": "stemmer", "language": "english" },
            "english_possessive_stemmer": { "type": "stemmer", "language": "possessive_english" },
            "russian_stop": { "type": "stop", "stopwords": "_russian_" },
            "russian_stemmer": { "type": "stemmer", "language": "russian" }
        },
        "analyzer": {
            "ru_en": {
                "tokenizer": "standard",
                "filter": [
                    "lowercase",
                    "english_stop",
                    "english_stemmer",
                    "english_possessive_stemmer",
                    "russian_stop",
                    "russian_stemmer"
                ]
            }
        }
    })
}

fn settings() -> Value {
    json!({
        "number_of_shards": 1,
        "number_of_replicas": 0,
        "refresh_interval": "1s",
        "analysis": analysis()
    })
}

fn named_refs() -> Value {
    json!({
        "type": "nested",
        "dynamic": "strict",
        "properties": {
            "id": { "type": "keyword" },
            "name": { "type": "text", "analyzer": "ru_en" }
        }
    })
}

pub fn movies_schema() -> Value {
    json!({
        "settings": settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "imdb_rating": { "type": "float" },
                "type": { "type": "keyword" },
                "title": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "description": { "type": "text", "analyzer": "ru_en" },
                "genres": named_refs(),
                "directors": named_refs(),
                "actors": named_refs(),
                "writers": named_refs(),
                "directors_names": { "type": "text", "analyzer": "ru_en" },
                "actors_names": { "type": "text", "analyzer": "ru_en" },
                "writers_names": { "type": "text", "analyzer": "ru_en" }
            }
        }
    })
}

pub fn genres_schema() -> Value {
    json!({
        "settings": settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "name": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "description": { "type": "text", "analyzer": "ru_en" },
                "films": {
                    "type": "nested",
                    "dynamic": "strict",
                    "properties": {
                        "id": { "type": "keyword" },
                        "title": { "type": "text", "analyzer": "ru_en" },
                        "imdb_rating": { "type": "float" }
                    }
                }
            }
        }
    })
}

pub fn persons_schema() -> Value {
    json!({
        "settings": settings(),
        "mappings": {
            "dynamic": "strict",
            "properties": {
                "id": { "type": "keyword" },
                "full_name": {
                    "type": "text",
                    "analyzer": "ru_en",
                    "fields": { "raw": { "type": "keyword" } }
                },
                "films": {
                    "type": "nested",
                    "dynamic": "strict",
                    "properties": {
                        "id": { "type": "keyword" },
                        "title": { "type": "text", "analyzer": "ru_en" },
                        "imdb_rating": { "type": "float" },
                        "roles": { "type": "keyword" }
                    }
                }
            }
        }
    })
}

pub fn builtin_schema(family: SyncFamily) -> Value {
    match family {
        SyncFamily::Movies => movies_schema(),
        SyncFamily::Genres => genres_schema(),
        SyncFamily::Persons => persons_schema(),
    }
}

/// The schema for `family`: the file at `path` if given, else the built-in one.
pub fn load_schema(family: SyncFamily, path: Option<&Path>) -> Result<Value> {
    let Some(path) = path else {
        return Ok(builtin_schema(family));
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read index schema: {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Index schema is not valid JSON: {}", path.display()))?;

    if value.get("mappings").and_then(Value::as_object).is_none() {
        bail!(
            "Index schema {} must contain a \"mappings\" object",
            path.display()
        );
    }
    Ok(value)
}
