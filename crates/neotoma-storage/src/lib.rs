//! Postgres persistence for the Neotoma memory substrate.
//!
//! Mirrors the split this workspace uses elsewhere: this crate is pure
//! query/row plumbing (`sqlx::query!`/`query_as!` plus the row structs they
//! return); the domain logic that decides which queries to issue and in
//! what order lives in `neotoma-core`.

pub mod edges;
pub mod entities;
pub mod idempotency;
pub mod interpretations;
pub mod merges;
pub mod observations;
pub mod pool;
pub mod quotas;
pub mod relationships;
pub mod schemas;
pub mod snapshots;
pub mod sources;
pub mod text_json;
pub mod timeline;

pub use text_json::TextJson;
