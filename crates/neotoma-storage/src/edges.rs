//! Persistence for audit edges between sources, entities, and events
//! (`§3`: Source↔Entity Edge / Source↔Event Edge).

use neotoma_models::{EntityId, InterpretationId, SourceId};
use sqlx::PgExecutor;
use uuid::Uuid;

pub async fn link_source_entity(
    source_id: SourceId,
    entity_id: &EntityId,
    edge_type: &str,
    interpretation_id: Option<InterpretationId>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into source_entity_edges (source_id, entity_id, edge_type, interpretation_id)
        values ($1, $2, $3, $4)
        on conflict (source_id, entity_id, edge_type) do nothing
        "#,
        source_id as SourceId,
        entity_id as &EntityId,
        edge_type,
        interpretation_id as Option<InterpretationId>,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn link_source_event(
    source_id: SourceId,
    event_id: Uuid,
    edge_type: &str,
    interpretation_id: Option<InterpretationId>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into source_event_edges (source_id, event_id, edge_type, interpretation_id)
        values ($1, $2, $3, $4)
        on conflict (source_id, event_id, edge_type) do nothing
        "#,
        source_id as SourceId,
        event_id,
        edge_type,
        interpretation_id as Option<InterpretationId>,
    )
    .execute(db)
    .await?;
    Ok(())
}

pub async fn list_entities_for_source(
    source_id: SourceId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<EntityId>> {
    let rows = sqlx::query!(
        r#"select entity_id as "entity_id: EntityId" from source_entity_edges where source_id = $1"#,
        source_id as SourceId,
    )
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(|r| r.entity_id).collect())
}
