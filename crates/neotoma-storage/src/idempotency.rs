//! `ingest_structured`'s idempotency-key table (`§6`).

use neotoma_models::{InterpretationId, SourceId, UserId};
use sqlx::PgExecutor;

pub struct Claim {
    pub source_id: SourceId,
    pub interpretation_id: InterpretationId,
}

pub async fn find(
    user_id: UserId,
    idempotency_key: &str,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<Claim>> {
    let row = sqlx::query!(
        r#"
        select
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId"
        from idempotency_keys
        where user_id = $1 and idempotency_key = $2
        "#,
        user_id as UserId,
        idempotency_key,
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(|r| Claim {
        source_id: r.source_id,
        interpretation_id: r.interpretation_id,
    }))
}

/// Claims an idempotency key for a new ingest. Returns an error on conflict
/// (a concurrent writer already claimed it) via the primary key violation;
/// the caller maps that to `Error::Conflict` after re-reading with `find`.
pub async fn claim(
    user_id: UserId,
    idempotency_key: &str,
    source_id: SourceId,
    interpretation_id: InterpretationId,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into idempotency_keys (user_id, idempotency_key, source_id, interpretation_id)
        values ($1, $2, $3, $4)
        "#,
        user_id as UserId,
        idempotency_key,
        source_id as SourceId,
        interpretation_id as InterpretationId,
    )
    .execute(&mut **txn)
    .await?;
    Ok(())
}
