//! Read side of the merge audit trail (`§4.6`). Writes live in
//! `entities::mark_merged` / `entities::insert_merge_audit`, which run
//! inside the same transaction as the observation rewrite.

use chrono::{DateTime, Utc};
use neotoma_models::{EntityId, UserId};
use sqlx::PgExecutor;
use uuid::Uuid;

#[derive(Debug)]
pub struct MergeAuditRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub from_entity_id: EntityId,
    pub to_entity_id: EntityId,
    pub observations_moved: i64,
    pub merged_at: DateTime<Utc>,
}

pub async fn list_for_entity(
    user_id: UserId,
    entity_id: &EntityId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<MergeAuditRow>> {
    sqlx::query_as!(
        MergeAuditRow,
        r#"
        select
            id,
            user_id as "user_id: UserId",
            from_entity_id as "from_entity_id: EntityId",
            to_entity_id as "to_entity_id: EntityId",
            observations_moved,
            merged_at
        from entity_merges
        where user_id = $1 and (from_entity_id = $2 or to_entity_id = $2)
        order by merged_at asc
        "#,
        user_id as UserId,
        entity_id as &EntityId,
    )
    .fetch_all(db)
    .await
}
