//! Persistence for the observation log (`§3`, `§4.5`).
//!
//! Rows here are never updated or deleted; every mutation this crate
//! exposes for the table is an `insert` (or, for merges, a bulk rewrite of
//! the `entity_id` pointer, which is a structural reference and not a field
//! of the observation itself).

use chrono::{DateTime, Utc};
use neotoma_models::{EntityId, EntityType, InterpretationId, ObservationId, SourceId, UserId};
use serde_json::Value;
use sqlx::PgExecutor;

use crate::text_json::TextJson;

#[derive(Debug, Clone)]
pub struct ObservationRow {
    pub id: ObservationId,
    pub user_id: UserId,
    pub entity_id: EntityId,
    pub entity_type: EntityType,
    pub source_id: Option<SourceId>,
    pub interpretation_id: Option<InterpretationId>,
    pub schema_major: i32,
    pub schema_minor: i32,
    pub observed_at: DateTime<Utc>,
    pub source_priority: i32,
    pub fields: TextJson<Value>,
    pub extraction_metadata: Option<TextJson<Value>>,
    pub created_at: DateTime<Utc>,
}

impl ObservationRow {
    pub fn fields(&self) -> &Value {
        &self.fields.0
    }

    pub fn extraction_metadata(&self) -> Option<&Value> {
        self.extraction_metadata.as_ref().map(|j| &j.0)
    }
}

pub struct NewObservation<'a> {
    pub user_id: UserId,
    pub entity_id: &'a EntityId,
    pub entity_type: &'a EntityType,
    pub source_id: Option<SourceId>,
    pub interpretation_id: Option<InterpretationId>,
    pub schema_major: i32,
    pub schema_minor: i32,
    pub observed_at: DateTime<Utc>,
    pub source_priority: i32,
    pub fields: &'a Value,
    pub extraction_metadata: Option<&'a Value>,
}

pub async fn insert(
    new: NewObservation<'_>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<ObservationRow> {
    sqlx::query_as!(
        ObservationRow,
        r#"
        insert into observations (
            user_id, entity_id, entity_type, source_id, interpretation_id,
            schema_major, schema_minor, observed_at, source_priority,
            fields, extraction_metadata
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        returning
            id as "id: ObservationId",
            user_id as "user_id: UserId",
            entity_id as "entity_id: EntityId",
            entity_type as "entity_type: EntityType",
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>", extraction_metadata as "extraction_metadata: TextJson<Value>", created_at
        "#,
        new.user_id as UserId,
        new.entity_id as &EntityId,
        new.entity_type as &EntityType,
        new.source_id as Option<SourceId>,
        new.interpretation_id as Option<InterpretationId>,
        new.schema_major,
        new.schema_minor,
        new.observed_at,
        new.source_priority,
        TextJson(new.fields) as TextJson<&Value>,
        new.extraction_metadata.map(TextJson) as Option<TextJson<&Value>>,
    )
    .fetch_one(db)
    .await
}

/// Returns every observation for an entity in the reducer's total order:
/// `(source_priority DESC, observed_at DESC, source_id ASC, observation_id
/// ASC)` (`§4.5`). The reducer depends on this exact ordering; do not
/// `ORDER BY` differently anywhere else this table is read for reduction.
pub async fn list_for_entity_in_reduction_order(
    user_id: UserId,
    entity_id: &EntityId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<ObservationRow>> {
    sqlx::query_as!(
        ObservationRow,
        r#"
        select
            id as "id: ObservationId",
            user_id as "user_id: UserId",
            entity_id as "entity_id: EntityId",
            entity_type as "entity_type: EntityType",
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>", extraction_metadata as "extraction_metadata: TextJson<Value>", created_at
        from observations
        where user_id = $1 and entity_id = $2
        order by source_priority desc, observed_at desc, source_id asc, id asc
        "#,
        user_id as UserId,
        entity_id as &EntityId,
    )
    .fetch_all(db)
    .await
}

/// Time-travel variant: only observations recorded at or before `at`
/// (`§4.8`, `retrieve_entity_snapshot(entity_id, at)`).
pub async fn list_for_entity_as_of(
    user_id: UserId,
    entity_id: &EntityId,
    at: DateTime<Utc>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<ObservationRow>> {
    sqlx::query_as!(
        ObservationRow,
        r#"
        select
            id as "id: ObservationId",
            user_id as "user_id: UserId",
            entity_id as "entity_id: EntityId",
            entity_type as "entity_type: EntityType",
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>", extraction_metadata as "extraction_metadata: TextJson<Value>", created_at
        from observations
        where user_id = $1 and entity_id = $2 and observed_at <= $3
        order by source_priority desc, observed_at desc, source_id asc, id asc
        "#,
        user_id as UserId,
        entity_id as &EntityId,
        at,
    )
    .fetch_all(db)
    .await
}

pub async fn list_by_interpretation(
    user_id: UserId,
    interpretation_id: InterpretationId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<ObservationRow>> {
    sqlx::query_as!(
        ObservationRow,
        r#"
        select
            id as "id: ObservationId",
            user_id as "user_id: UserId",
            entity_id as "entity_id: EntityId",
            entity_type as "entity_type: EntityType",
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>", extraction_metadata as "extraction_metadata: TextJson<Value>", created_at
        from observations
        where user_id = $1 and interpretation_id = $2
        order by id asc
        "#,
        user_id as UserId,
        interpretation_id as InterpretationId,
    )
    .fetch_all(db)
    .await
}

/// Moves every observation for `from` onto `to`. Part of the atomic merge
/// transaction (`§4.6`); the observation's content is untouched, only the
/// structural `entity_id` pointer moves.
pub async fn rewrite_entity_id(
    from: &EntityId,
    to: &EntityId,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<u64> {
    let result = sqlx::query!(
        r#"update observations set entity_id = $2 where entity_id = $1"#,
        from as &EntityId,
        to as &EntityId,
    )
    .execute(&mut **txn)
    .await?;
    Ok(result.rows_affected())
}

/// Scans recent observations of a type for `extraction_metadata.unknown_fields`,
/// used by schema-candidate analysis (`§4.2`). The registry is global (see
/// `schema_definitions`, which carries no `user_id`), so this intentionally
/// scans across tenants rather than filtering by one.
pub async fn list_recent_with_unknown_fields(
    entity_type: &EntityType,
    limit: i64,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<ObservationRow>> {
    sqlx::query_as!(
        ObservationRow,
        r#"
        select
            id as "id: ObservationId",
            user_id as "user_id: UserId",
            entity_id as "entity_id: EntityId",
            entity_type as "entity_type: EntityType",
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>", extraction_metadata as "extraction_metadata: TextJson<Value>", created_at
        from observations
        where entity_type = $1
            and extraction_metadata -> 'unknown_fields' is not null
        order by created_at desc
        limit $2
        "#,
        entity_type.as_str(),
        limit,
    )
    .fetch_all(db)
    .await
}

pub async fn count_for_entity(
    user_id: UserId,
    entity_id: &EntityId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<i64> {
    let row = sqlx::query!(
        r#"select count(*) as "count!" from observations where user_id = $1 and entity_id = $2"#,
        user_id as UserId,
        entity_id as &EntityId,
    )
    .fetch_one(db)
    .await?;
    Ok(row.count)
}
