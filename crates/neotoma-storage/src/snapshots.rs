//! Persistence for the reducer's cache of current truth (`§3`, `§4.5`).
//!
//! Every row here is recomputable from `observations`; the table exists
//! purely so reads don't have to reduce on every request. Writers replace
//! the whole row with `upsert`; there is no partial update.

use chrono::{DateTime, Utc};
use neotoma_models::{EntityId, EntityType, UserId};
use serde_json::Value;
use sqlx::PgExecutor;

use crate::text_json::TextJson;

#[derive(Debug)]
pub struct SnapshotRow {
    pub entity_id: EntityId,
    pub user_id: UserId,
    pub entity_type: EntityType,
    pub canonical_name: Option<String>,
    pub fields: TextJson<Value>,
    pub field_provenance: TextJson<Value>,
    pub observation_count: i64,
    pub tombstoned: bool,
    pub computed_at: DateTime<Utc>,
}

impl SnapshotRow {
    pub fn fields(&self) -> &Value {
        &self.fields.0
    }

    pub fn field_provenance(&self) -> &Value {
        &self.field_provenance.0
    }
}

pub struct NewSnapshot<'a> {
    pub entity_id: &'a EntityId,
    pub user_id: UserId,
    pub entity_type: &'a EntityType,
    pub canonical_name: Option<&'a str>,
    pub fields: &'a Value,
    pub field_provenance: &'a Value,
    pub observation_count: i64,
    pub tombstoned: bool,
}

pub async fn upsert(new: NewSnapshot<'_>, db: impl PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into entity_snapshots (
            entity_id, user_id, entity_type, canonical_name,
            fields, field_provenance, observation_count, tombstoned
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8)
        on conflict (entity_id) do update set
            canonical_name = $4,
            fields = $5,
            field_provenance = $6,
            observation_count = $7,
            tombstoned = $8,
            computed_at = clock_timestamp()
        "#,
        new.entity_id as &EntityId,
        new.user_id as UserId,
        new.entity_type as &EntityType,
        new.canonical_name,
        TextJson(new.fields) as TextJson<&Value>,
        TextJson(new.field_provenance) as TextJson<&Value>,
        new.observation_count,
        new.tombstoned,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn fetch(
    user_id: UserId,
    entity_id: &EntityId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SnapshotRow>> {
    sqlx::query_as!(
        SnapshotRow,
        r#"
        select
            entity_id as "entity_id: EntityId",
            user_id as "user_id: UserId",
            entity_type as "entity_type: EntityType",
            canonical_name,
            fields as "fields: TextJson<Value>",
            field_provenance as "field_provenance: TextJson<Value>",
            observation_count,
            tombstoned,
            computed_at
        from entity_snapshots
        where user_id = $1 and entity_id = $2
        "#,
        user_id as UserId,
        entity_id as &EntityId,
    )
    .fetch_optional(db)
    .await
}

pub async fn delete(entity_id: &EntityId, db: impl PgExecutor<'_>) -> sqlx::Result<()> {
    sqlx::query!(
        r#"delete from entity_snapshots where entity_id = $1"#,
        entity_id as &EntityId,
    )
    .execute(db)
    .await?;
    Ok(())
}
