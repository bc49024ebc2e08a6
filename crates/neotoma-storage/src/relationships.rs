//! Persistence for relationship observations and their snapshots, mirroring
//! `observations.rs` and `snapshots.rs` (`§3`, `§4.5` relationship reducer).

use chrono::{DateTime, Utc};
use neotoma_models::{CanonicalHash, EntityId, InterpretationId, SourceId, UserId};
use serde_json::Value;
use sqlx::PgExecutor;

use crate::text_json::TextJson;

#[derive(Debug, Clone)]
pub struct RelationshipObservationRow {
    pub id: uuid::Uuid,
    pub user_id: UserId,
    pub source_entity_id: EntityId,
    pub relationship_type: String,
    pub target_entity_id: EntityId,
    pub canonical_hash: String,
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

impl RelationshipObservationRow {
    pub fn fields(&self) -> &Value {
        &self.fields.0
    }
}

pub struct NewRelationshipObservation<'a> {
    pub user_id: UserId,
    pub source_entity_id: &'a EntityId,
    pub relationship_type: &'a str,
    pub target_entity_id: &'a EntityId,
    pub canonical_hash: &'a CanonicalHash,
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
    new: NewRelationshipObservation<'_>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<RelationshipObservationRow> {
    let canonical_hash = new.canonical_hash.to_hex();
    sqlx::query_as!(
        RelationshipObservationRow,
        r#"
        insert into relationship_observations (
            user_id, source_entity_id, relationship_type, target_entity_id,
            canonical_hash, source_id, interpretation_id, schema_major,
            schema_minor, observed_at, source_priority, fields, extraction_metadata
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        returning
            id,
            user_id as "user_id: UserId",
            source_entity_id as "source_entity_id: EntityId",
            relationship_type,
            target_entity_id as "target_entity_id: EntityId",
            canonical_hash,
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>",
            extraction_metadata as "extraction_metadata: TextJson<Value>",
            created_at
        "#,
        new.user_id as UserId,
        new.source_entity_id as &EntityId,
        new.relationship_type,
        new.target_entity_id as &EntityId,
        canonical_hash,
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

pub async fn list_for_canonical_hash(
    user_id: UserId,
    canonical_hash: &CanonicalHash,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<RelationshipObservationRow>> {
    let canonical_hash = canonical_hash.to_hex();
    sqlx::query_as!(
        RelationshipObservationRow,
        r#"
        select
            id,
            user_id as "user_id: UserId",
            source_entity_id as "source_entity_id: EntityId",
            relationship_type,
            target_entity_id as "target_entity_id: EntityId",
            canonical_hash,
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>",
            extraction_metadata as "extraction_metadata: TextJson<Value>",
            created_at
        from relationship_observations
        where user_id = $1 and canonical_hash = $2
        order by source_priority desc, observed_at desc, source_id asc, id asc
        "#,
        user_id as UserId,
        canonical_hash,
    )
    .fetch_all(db)
    .await
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

pub async fn list_by_entity(
    user_id: UserId,
    entity_id: &EntityId,
    direction: Direction,
    relationship_type: Option<&str>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<RelationshipObservationRow>> {
    sqlx::query_as!(
        RelationshipObservationRow,
        r#"
        select
            id,
            user_id as "user_id: UserId",
            source_entity_id as "source_entity_id: EntityId",
            relationship_type,
            target_entity_id as "target_entity_id: EntityId",
            canonical_hash,
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            schema_major, schema_minor, observed_at, source_priority,
            fields as "fields: TextJson<Value>",
            extraction_metadata as "extraction_metadata: TextJson<Value>",
            created_at
        from relationship_observations
        where user_id = $1
            and (case when $3 then source_entity_id else target_entity_id end) = $2
            and ($4::text is null or relationship_type = $4)
        order by source_priority desc, observed_at desc, source_id asc, id asc
        "#,
        user_id as UserId,
        entity_id as &EntityId,
        direction == Direction::Outbound,
        relationship_type,
    )
    .fetch_all(db)
    .await
}

#[derive(Debug)]
pub struct RelationshipSnapshotRow {
    pub canonical_hash: String,
    pub user_id: UserId,
    pub source_entity_id: EntityId,
    pub relationship_type: String,
    pub target_entity_id: EntityId,
    pub fields: TextJson<Value>,
    pub field_provenance: TextJson<Value>,
    pub observation_count: i64,
    pub tombstoned: bool,
    pub computed_at: DateTime<Utc>,
}

pub struct NewRelationshipSnapshot<'a> {
    pub canonical_hash: &'a CanonicalHash,
    pub user_id: UserId,
    pub source_entity_id: &'a EntityId,
    pub relationship_type: &'a str,
    pub target_entity_id: &'a EntityId,
    pub fields: &'a Value,
    pub field_provenance: &'a Value,
    pub observation_count: i64,
    pub tombstoned: bool,
}

pub async fn upsert_snapshot(
    new: NewRelationshipSnapshot<'_>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    let canonical_hash = new.canonical_hash.to_hex();
    sqlx::query!(
        r#"
        insert into relationship_snapshots (
            canonical_hash, user_id, source_entity_id, relationship_type,
            target_entity_id, fields, field_provenance, observation_count, tombstoned
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        on conflict (canonical_hash) do update set
            fields = $6,
            field_provenance = $7,
            observation_count = $8,
            tombstoned = $9,
            computed_at = clock_timestamp()
        "#,
        canonical_hash,
        new.user_id as UserId,
        new.source_entity_id as &EntityId,
        new.relationship_type,
        new.target_entity_id as &EntityId,
        TextJson(new.fields) as TextJson<&Value>,
        TextJson(new.field_provenance) as TextJson<&Value>,
        new.observation_count,
        new.tombstoned,
    )
    .execute(db)
    .await?;
    Ok(())
}
