//! The Neotoma memory substrate: content store, schema registry,
//! interpretation engine, reducer, entity resolver/merge, schema evolution,
//! and query layer. Depends on `neotoma-models` for types and
//! `neotoma-storage` for persistence; owns every transaction boundary.

pub mod config;
pub mod content_store;
pub mod evolution;
pub mod interpretation;
pub mod query;
pub mod reducer;
pub mod resolver;
pub mod schema_registry;
pub mod telemetry;

pub use config::Config;
