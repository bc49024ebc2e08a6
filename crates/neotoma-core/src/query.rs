//! The read layer (`§4.8`). Every function here filters by `user_id`; the
//! substrate is multi-tenant end to end.

use chrono::{DateTime, Utc};
use neotoma_models::schema::SchemaDefinition;
use neotoma_models::{CanonicalHash, EntityId, EntityType, Error, Result, UserId};
use neotoma_storage::entities::{EntityFilter, EntityRow};
use neotoma_storage::observations::ObservationRow;
use neotoma_storage::relationships::{Direction, RelationshipObservationRow};
use neotoma_storage::timeline::{TimelineEventRow, TimelineFilter};
use serde_json::Value;
use sqlx::PgPool;

use crate::reducer::{self, ReducedSnapshot, ReducerObservation};
use crate::schema_registry;

fn to_reducer_observations(rows: &[ObservationRow]) -> Vec<ReducerObservation> {
    rows.iter()
        .map(|row| ReducerObservation {
            observation_id: row.id,
            source_id: row.source_id,
            observed_at: row.observed_at,
            source_priority: neotoma_models::SourcePriority::from_raw(row.source_priority),
            fields: row.fields().clone(),
            extraction_metadata: row.extraction_metadata().cloned(),
        })
        .collect()
}

/// `retrieve_entities` (`§4.8`): excludes merged-away entities by default.
pub async fn retrieve_entities(
    pool: &PgPool,
    user_id: UserId,
    filter: &EntityFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<EntityRow>> {
    Ok(neotoma_storage::entities::list(user_id, filter, limit, offset, pool).await?)
}

/// `retrieve_entity_snapshot(entity_id, at)` (`§4.8`): `at = None` serves
/// the cached current snapshot; `Some(at)` recomputes over the
/// observations visible at that instant instead of touching the cache.
/// A query for a merged-away id returns the surviving entity's snapshot with
/// `redirected_to` set, per `§4.6`/`§8` — callers must be able to tell a
/// redirect happened rather than silently reading the wrong entity's data.
pub async fn retrieve_entity_snapshot(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
    at: Option<DateTime<Utc>>,
) -> Result<ReducedSnapshot> {
    let requested_id = entity_id.clone();
    let resolved_id = neotoma_storage::entities::follow_redirect(user_id, entity_id.clone(), pool).await?;
    let redirected_to = (resolved_id != requested_id).then(|| resolved_id.clone());
    let entity = neotoma_storage::entities::fetch(user_id, &resolved_id, pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("entity {resolved_id}")))?;

    let mut snapshot = match at {
        None => {
            if let Some(cached) = neotoma_storage::snapshots::fetch(user_id, &resolved_id, pool).await? {
                ReducedSnapshot {
                    fields: cached.fields().clone(),
                    field_provenance: cached.field_provenance().clone(),
                    canonical_name: cached.canonical_name,
                    observation_count: cached.observation_count as usize,
                    tombstoned: cached.tombstoned,
                    redirected_to: None,
                }
            } else {
                recompute_entity_snapshot(pool, user_id, &resolved_id).await?
            }
        }
        Some(at) => {
            let schema = schema_registry::get_schema(pool, &entity.entity_type, None).await?;
            let rows = neotoma_storage::observations::list_for_entity_as_of(user_id, &resolved_id, at, pool).await?;
            reducer::reduce(&to_reducer_observations(&rows), &schema)
        }
    };
    snapshot.redirected_to = redirected_to;
    Ok(snapshot)
}

/// Recomputes an entity's snapshot from its full observation history and
/// writes the cache row (`§4.5`, `§4.7` — also used to refresh snapshots
/// across a merge or a schema-version bump).
pub async fn recompute_entity_snapshot(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
) -> Result<ReducedSnapshot> {
    let entity = neotoma_storage::entities::fetch(user_id, entity_id, pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("entity {entity_id}")))?;
    let schema = schema_registry::get_schema(pool, &entity.entity_type, None).await?;
    let rows = neotoma_storage::observations::list_for_entity_in_reduction_order(user_id, entity_id, pool).await?;
    let snapshot = reducer::reduce(&to_reducer_observations(&rows), &schema);

    neotoma_storage::snapshots::upsert(
        neotoma_storage::snapshots::NewSnapshot {
            entity_id,
            user_id,
            entity_type: &entity.entity_type,
            canonical_name: snapshot.canonical_name.as_deref(),
            fields: &snapshot.fields,
            field_provenance: &snapshot.field_provenance,
            observation_count: snapshot.observation_count as i64,
            tombstoned: snapshot.tombstoned,
        },
        pool,
    )
    .await?;
    if snapshot.canonical_name != entity.canonical_name {
        neotoma_storage::entities::set_canonical_name(entity_id, snapshot.canonical_name.as_deref(), pool).await?;
    }

    Ok(snapshot)
}

pub async fn list_observations(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
) -> Result<Vec<ObservationRow>> {
    Ok(neotoma_storage::observations::list_for_entity_in_reduction_order(user_id, entity_id, pool).await?)
}

/// `retrieve_field_provenance(entity_id, field)` (`§4.8`): the winning
/// observation id recorded by the reducer for one field of the current
/// snapshot.
pub async fn retrieve_field_provenance(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
    field: &str,
) -> Result<Option<Value>> {
    let snapshot = retrieve_entity_snapshot(pool, user_id, entity_id, None).await?;
    Ok(snapshot.field_provenance.get(field).cloned())
}

pub async fn list_relationships(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
    direction: Direction,
    relationship_type: Option<&str>,
) -> Result<Vec<RelationshipObservationRow>> {
    Ok(neotoma_storage::relationships::list_by_entity(user_id, entity_id, direction, relationship_type, pool).await?)
}

/// Recomputes one relationship's snapshot, mirroring
/// `recompute_entity_snapshot` (`§4.5`'s reducer applied to
/// `relationship_observations`). There is no schema-bound field set for
/// relationships in `§3`, so every field present on any contributing
/// observation is reduced with `LastWriterWins` by the total order.
pub async fn recompute_relationship_snapshot(
    pool: &PgPool,
    user_id: UserId,
    canonical_hash: &CanonicalHash,
    source_entity_id: &EntityId,
    relationship_type: &str,
    target_entity_id: &EntityId,
) -> Result<()> {
    let rows = neotoma_storage::relationships::list_for_canonical_hash(user_id, canonical_hash, pool).await?;
    let schema = relationship_field_schema(&rows);
    let observations: Vec<ReducerObservation> = rows
        .iter()
        .map(|row| ReducerObservation {
            observation_id: neotoma_models::ObservationId::from_uuid(row.id),
            source_id: row.source_id,
            observed_at: row.observed_at,
            source_priority: neotoma_models::SourcePriority::from_raw(row.source_priority),
            fields: row.fields().clone(),
            extraction_metadata: None,
        })
        .collect();
    let snapshot = reducer::reduce(&observations, &schema);

    neotoma_storage::relationships::upsert_snapshot(
        neotoma_storage::relationships::NewRelationshipSnapshot {
            canonical_hash,
            user_id,
            source_entity_id,
            relationship_type,
            target_entity_id,
            fields: &snapshot.fields,
            field_provenance: &snapshot.field_provenance,
            observation_count: snapshot.observation_count as i64,
            tombstoned: snapshot.tombstoned,
        },
        pool,
    )
    .await?;
    Ok(())
}

/// Relationships have no registered schema, so the reducer is driven by a
/// throwaway `LastWriterWins` schema covering every field name observed in
/// this run.
fn relationship_field_schema(rows: &[RelationshipObservationRow]) -> SchemaDefinition {
    use neotoma_models::schema::{EntityResolutionKey, FieldDefinition, FieldType, MergePolicy};
    use std::collections::BTreeSet;

    let mut names: BTreeSet<&str> = BTreeSet::new();
    for row in rows {
        if let Some(object) = row.fields().as_object() {
            names.extend(object.keys().map(String::as_str));
        }
    }
    SchemaDefinition {
        entity_type: EntityType::new("relationship").unwrap(),
        schema_version: neotoma_models::SchemaVersion::INITIAL,
        fields: names
            .into_iter()
            .map(|name| FieldDefinition {
                name: name.to_string(),
                value_type: FieldType::String,
                required: false,
                validation: None,
                merge_policy: MergePolicy::LastWriterWins,
                precision: None,
            })
            .collect(),
        canonicalization_rule: None,
        entity_resolution_key: EntityResolutionKey::Identity,
        extraction_rules: Default::default(),
    }
}

/// `retrieve_related_entities` (`§4.8`): bounded breadth-first walk of the
/// relationship graph, stopping at `max_depth` or when every frontier node
/// has already been visited.
pub async fn retrieve_related_entities(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
    max_depth: u32,
) -> Result<Vec<EntityId>> {
    let mut visited: std::collections::HashSet<EntityId> = std::collections::HashSet::new();
    visited.insert(entity_id.clone());
    let mut frontier = vec![entity_id.clone()];

    for _ in 0..max_depth {
        let mut next_frontier = Vec::new();
        for node in &frontier {
            for direction in [Direction::Outbound, Direction::Inbound] {
                let rows = neotoma_storage::relationships::list_by_entity(user_id, node, direction, None, pool).await?;
                for row in rows {
                    let neighbor = match direction {
                        Direction::Outbound => row.target_entity_id,
                        Direction::Inbound => row.source_entity_id,
                    };
                    if visited.insert(neighbor.clone()) {
                        next_frontier.push(neighbor);
                    }
                }
            }
        }
        if next_frontier.is_empty() {
            break;
        }
        frontier = next_frontier;
    }

    visited.remove(entity_id);
    Ok(visited.into_iter().collect())
}

/// `retrieve_graph_neighborhood` (`§4.8`): depth-1 incident edges in both
/// directions, unlike `retrieve_related_entities` which returns only the
/// reachable entity ids.
pub async fn retrieve_graph_neighborhood(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
) -> Result<Vec<RelationshipObservationRow>> {
    let mut rows = neotoma_storage::relationships::list_by_entity(user_id, entity_id, Direction::Outbound, None, pool)
        .await?;
    rows.extend(
        neotoma_storage::relationships::list_by_entity(user_id, entity_id, Direction::Inbound, None, pool).await?,
    );
    Ok(rows)
}

pub async fn list_timeline_events(
    pool: &PgPool,
    user_id: UserId,
    filter: &TimelineFilter<'_>,
    limit: i64,
) -> Result<Vec<TimelineEventRow>> {
    Ok(neotoma_storage::timeline::list(user_id, filter, limit, pool).await?)
}
