//! Persistence for interpretation runs (`§4.3`).

use chrono::{DateTime, Utc};
use neotoma_models::{InterpretationId, SourceId, UserId};
use sqlx::PgExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "interpretation_status")]
#[sqlx(rename_all = "snake_case")]
pub enum InterpretationStatus {
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct InterpretationRow {
    pub id: InterpretationId,
    pub user_id: UserId,
    pub source_id: SourceId,
    pub provider: String,
    pub model_id: String,
    pub temperature: Option<f64>,
    pub prompt_hash: String,
    pub code_version: String,
    pub status: InterpretationStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct NewInterpretation<'a> {
    pub user_id: UserId,
    pub source_id: SourceId,
    pub provider: &'a str,
    pub model_id: &'a str,
    pub temperature: Option<f64>,
    pub prompt_hash: &'a str,
    pub code_version: &'a str,
}

pub async fn start(
    new: NewInterpretation<'_>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<InterpretationRow> {
    sqlx::query_as!(
        InterpretationRow,
        r#"
        insert into interpretations (
            user_id, source_id, provider, model_id, temperature,
            prompt_hash, code_version, status
        )
        values ($1, $2, $3, $4, $5, $6, $7, 'running')
        returning
            id as "id: InterpretationId",
            user_id as "user_id: UserId",
            source_id as "source_id: SourceId",
            provider, model_id, temperature, prompt_hash, code_version,
            status as "status: InterpretationStatus",
            started_at, finished_at
        "#,
        new.user_id as UserId,
        new.source_id as SourceId,
        new.provider,
        new.model_id,
        new.temperature,
        new.prompt_hash,
        new.code_version,
    )
    .fetch_one(db)
    .await
}

pub async fn finish(
    id: InterpretationId,
    status: InterpretationStatus,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        update interpretations
        set status = $2, finished_at = clock_timestamp()
        where id = $1
        "#,
        id as InterpretationId,
        status as InterpretationStatus,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn fetch(
    user_id: UserId,
    id: InterpretationId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<InterpretationRow>> {
    sqlx::query_as!(
        InterpretationRow,
        r#"
        select
            id as "id: InterpretationId",
            user_id as "user_id: UserId",
            source_id as "source_id: SourceId",
            provider, model_id, temperature, prompt_hash, code_version,
            status as "status: InterpretationStatus",
            started_at, finished_at
        from interpretations
        where user_id = $1 and id = $2
        "#,
        user_id as UserId,
        id as InterpretationId,
    )
    .fetch_optional(db)
    .await
}

/// Counts interpretations started within the trailing 24h window, used by
/// the per-tenant quota check before a new run is allowed to start.
pub async fn count_since(
    user_id: UserId,
    since: DateTime<Utc>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<i64> {
    let row = sqlx::query!(
        r#"
        select count(*) as "count!" from interpretations
        where user_id = $1 and started_at >= $2
        "#,
        user_id as UserId,
        since,
    )
    .fetch_one(db)
    .await?;
    Ok(row.count)
}
