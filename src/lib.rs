//! # cinesync
//!
//! Incremental change-data-capture sync from a PostgreSQL movie catalogue
//! into Elasticsearch.
//!
//! cinesync polls the catalogue for rows whose `modified` timestamp moved
//! past a persisted watermark, resolves each change to the documents it
//! affects (a renamed genre touches every film tagged with it), rebuilds
//! those documents from scratch, and bulk-upserts them. Watermarks advance
//! only after the index accepted every document, which gives at-least-once
//! delivery with idempotent writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────┐   ┌────────────┐
//! │ PostgreSQL │──▶│ extract  │──▶│ transform │──▶│    load    │──▶ Elasticsearch
//! │  (source)  │   │ changes  │   │ aggregate │   │ bulk index │
//! └────────────┘   └──────────┘   └───────────┘   └─────┬──────┘
//!                        ▲                              │ all accepted
//!                        │        ┌────────────┐        ▼
//!                        └────────│ watermarks │◀── commit
//!                                 └────────────┘
//! ```
//!
//! Three families run side by side, each with its own index and watermark
//! keys: `movies` (films with genres and people), `genres` (genres with
//! their films) and `persons` (people with their films and roles).
//!
//! ## Quick Start
//!
//! ```bash
//! cinesync init                       # create indices (and SQLite state)
//! cinesync run --once                 # one cycle of every family
//! cinesync run                        # loop until Ctrl-C / SIGTERM
//! cinesync status --counts            # watermarks and index sizes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Entity kinds, change sets, raw rows, documents |
//! | [`error`] | Pipeline error type and retry classification |
//! | [`retry`] | Exponential backoff and call timeouts |
//! | [`state`] | Watermark persistence (JSON file or SQLite) |
//! | [`source`] | Source store trait and in-memory store |
//! | [`source_postgres`] | PostgreSQL source store |
//! | [`extract`] | Change detection |
//! | [`transform`] | Aggregation into documents |
//! | [`index`] | Search index trait and in-memory index |
//! | [`elastic`] | Elasticsearch client |
//! | [`schema`] | Built-in index definitions |
//! | [`load`] | Batched bulk loading |
//! | [`sync`] | Per-family cycles and the orchestrator |
//! | [`status`] | Status report |
//! | [`db`] | Database connections |
//! | [`migrate`] | State schema and index bootstrap |

pub mod config;
pub mod db;
pub mod elastic;
pub mod error;
pub mod extract;
pub mod index;
pub mod load;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod schema;
pub mod source;
pub mod source_postgres;
pub mod state;
pub mod status;
pub mod sync;
#[cfg(test)]
mod testing;
pub mod transform;
