//! Persistence for entity identity records and merges (`§3`, `§4.6`).

use chrono::{DateTime, Utc};
use neotoma_models::{EntityId, EntityType, UserId};
use sqlx::PgExecutor;

#[derive(Debug, Clone)]
pub struct EntityRow {
    pub id: EntityId,
    pub user_id: UserId,
    pub entity_type: EntityType,
    pub canonical_name: Option<String>,
    pub merged_to_entity_id: Option<EntityId>,
    pub merged_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EntityRow {
    pub fn is_redirected(&self) -> bool {
        self.merged_to_entity_id.is_some()
    }
}

/// Looks up an existing entity by resolution key, following the entity
/// itself (not yet the redirect graph — callers resolve redirects via
/// `follow_redirect` after this returns).
pub async fn find_by_resolution_key(
    user_id: UserId,
    entity_type: &EntityType,
    resolution_key: &str,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<EntityId>> {
    let row = sqlx::query!(
        r#"
        select entity_id as "entity_id: EntityId"
        from entity_resolution_keys
        where user_id = $1 and entity_type = $2 and resolution_key = $3
        "#,
        user_id as UserId,
        entity_type as &EntityType,
        resolution_key,
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(|r| r.entity_id))
}

/// Mints a brand new entity and its resolution-key mapping in one
/// insert-or-reuse step. If a concurrent writer already claimed the key,
/// the unique constraint on `entity_resolution_keys` rejects this insert;
/// the caller retries `find_by_resolution_key` (`§4.6`, `§5`).
pub async fn mint_with_resolution_key(
    user_id: UserId,
    entity_type: &EntityType,
    resolution_key: &str,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<EntityId> {
    let id = EntityId::generate();
    sqlx::query!(
        r#"insert into entities (id, user_id, entity_type) values ($1, $2, $3)"#,
        &id as &EntityId,
        user_id as UserId,
        entity_type as &EntityType,
    )
    .execute(&mut **txn)
    .await?;
    sqlx::query!(
        r#"
        insert into entity_resolution_keys (user_id, entity_type, resolution_key, entity_id)
        values ($1, $2, $3, $4)
        "#,
        user_id as UserId,
        entity_type as &EntityType,
        resolution_key,
        &id as &EntityId,
    )
    .execute(&mut **txn)
    .await?;
    Ok(id)
}

/// Mints an identity-only entity (no resolution key row at all), used for
/// schemas whose `entity_resolution_key` is `Identity`.
pub async fn mint_identity(
    user_id: UserId,
    entity_type: &EntityType,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<EntityId> {
    let id = EntityId::generate();
    sqlx::query!(
        r#"insert into entities (id, user_id, entity_type) values ($1, $2, $3)"#,
        &id as &EntityId,
        user_id as UserId,
        entity_type as &EntityType,
    )
    .execute(&mut **txn)
    .await?;
    Ok(id)
}

pub async fn fetch(
    user_id: UserId,
    id: &EntityId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<EntityRow>> {
    sqlx::query_as!(
        EntityRow,
        r#"
        select
            id as "id: EntityId",
            user_id as "user_id: UserId",
            entity_type as "entity_type: EntityType",
            canonical_name,
            merged_to_entity_id as "merged_to_entity_id: EntityId",
            merged_at,
            created_at
        from entities
        where user_id = $1 and id = $2
        "#,
        user_id as UserId,
        id as &EntityId,
    )
    .fetch_optional(db)
    .await
}

/// Follows the redirect chain to its end. Chains are expected to be length
/// one in practice (merges always target a live entity) but this walks to
/// a fixed point defensively.
pub async fn follow_redirect(
    user_id: UserId,
    mut id: EntityId,
    db: impl PgExecutor<'_> + Copy,
) -> sqlx::Result<EntityId> {
    let mut hops = 0;
    loop {
        let Some(row) = fetch(user_id, &id, db).await? else {
            return Ok(id);
        };
        match row.merged_to_entity_id {
            Some(next) if hops < 64 => {
                id = next;
                hops += 1;
            }
            _ => return Ok(id),
        }
    }
}

pub struct EntityFilter {
    pub entity_type: Option<EntityType>,
    pub include_merged: bool,
}

pub async fn list(
    user_id: UserId,
    filter: &EntityFilter,
    limit: i64,
    offset: i64,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<EntityRow>> {
    sqlx::query_as!(
        EntityRow,
        r#"
        select
            id as "id: EntityId",
            user_id as "user_id: UserId",
            entity_type as "entity_type: EntityType",
            canonical_name,
            merged_to_entity_id as "merged_to_entity_id: EntityId",
            merged_at,
            created_at
        from entities
        where user_id = $1
            and ($2::text is null or entity_type = $2)
            and ($3 or merged_to_entity_id is null)
        order by created_at asc
        limit $4 offset $5
        "#,
        user_id as UserId,
        filter.entity_type.as_ref().map(|t| t.as_str()),
        filter.include_merged,
        limit,
        offset,
    )
    .fetch_all(db)
    .await
}

/// Lists live entities of a type across every tenant, for schema-evolution
/// snapshot recomputation (`§4.7`) — the only caller that needs to cross
/// tenant boundaries, since the schema registry itself is global.
pub async fn list_all_for_type(
    entity_type: &EntityType,
    limit: i64,
    offset: i64,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<EntityRow>> {
    sqlx::query_as!(
        EntityRow,
        r#"
        select
            id as "id: EntityId",
            user_id as "user_id: UserId",
            entity_type as "entity_type: EntityType",
            canonical_name,
            merged_to_entity_id as "merged_to_entity_id: EntityId",
            merged_at,
            created_at
        from entities
        where entity_type = $1 and merged_to_entity_id is null
        order by created_at asc
        limit $2 offset $3
        "#,
        entity_type.as_str(),
        limit,
        offset,
    )
    .fetch_all(db)
    .await
}

pub async fn set_canonical_name(
    id: &EntityId,
    canonical_name: Option<&str>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"update entities set canonical_name = $2 where id = $1"#,
        id as &EntityId,
        canonical_name,
    )
    .execute(db)
    .await?;
    Ok(())
}

/// Marks `from` as redirected to `to`. Must run in the same transaction as
/// `observations::rewrite_entity_id` and the `entity_merges` audit insert
/// (`§4.6`, `§7`: merges are atomic).
pub async fn mark_merged(
    from: &EntityId,
    to: &EntityId,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        update entities
        set merged_to_entity_id = $2, merged_at = clock_timestamp()
        where id = $1
        "#,
        from as &EntityId,
        to as &EntityId,
    )
    .execute(&mut **txn)
    .await?;
    Ok(())
}

pub async fn insert_merge_audit(
    user_id: UserId,
    from: &EntityId,
    to: &EntityId,
    observations_moved: i64,
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into entity_merges (user_id, from_entity_id, to_entity_id, observations_moved)
        values ($1, $2, $3, $4)
        "#,
        user_id as UserId,
        from as &EntityId,
        to as &EntityId,
        observations_moved,
    )
    .execute(&mut **txn)
    .await?;
    Ok(())
}
