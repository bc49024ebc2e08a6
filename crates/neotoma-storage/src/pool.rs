//! Connection setup. Kept intentionally small: callers own `sqlx::PgPool`
//! lifecycle (migrations, shutdown); this module only standardizes how a
//! pool is built from a URL.

use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    let mut options = database_url
        .parse::<PgConnectOptions>()
        .context("parsing database URL")?;
    options = options.ssl_mode(PgSslMode::Prefer);

    PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .max_connections(10)
        .connect_with(options)
        .await
        .context("connecting to database")
}

/// Runs the embedded migrations against an already-open pool. Intended for
/// first-boot setup and for integration tests that don't use
/// `#[sqlx::test]`.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running migrations")
}
