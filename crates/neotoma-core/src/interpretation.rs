//! The interpretation engine (`§4.3`).

use chrono::{DateTime, Utc};
use neotoma_models::schema::SchemaDefinition;
use neotoma_models::{
    CanonicalHash, EntityId, EntityType, Error, InterpretationId, ObservationId, Result, SourceId,
    SourcePriority, UserId,
};
use serde_json::Value;
use sqlx::PgPool;

use crate::{content_store, query, resolver, schema_registry};

pub struct InterpretationConfig {
    pub provider: String,
    pub model_id: String,
    pub temperature: Option<f64>,
    pub prompt_hash: String,
    pub code_version: String,
}

/// One extractor candidate: an entity plus the fields pulled from the
/// source, and any relationships it participates in (`§4.3`).
pub struct ExtractionCandidate {
    pub entity_type: EntityType,
    pub fields: Value,
    pub relationships: Vec<RelationshipCandidate>,
}

pub struct RelationshipCandidate {
    pub relationship_type: String,
    pub target_entity_type: EntityType,
    pub target_fields: Value,
    pub fields: Value,
}

pub struct InterpretationOutcome {
    pub interpretation_id: InterpretationId,
    pub observation_count: usize,
    pub entity_ids: Vec<EntityId>,
}

const QUOTA_WINDOW_HOURS: i64 = 24;

/// Runs one extraction pass over an already-ingested source (`§4.3`). The
/// core never extracts: `candidates` is extractor output the caller
/// supplies (see `SPEC_FULL.md`'s resolution of the `ingest_unstructured` /
/// Extractor boundary).
pub async fn run_interpretation(
    pool: &PgPool,
    user_id: UserId,
    source_id: SourceId,
    candidates: Vec<ExtractionCandidate>,
    config: InterpretationConfig,
    source_priority: SourcePriority,
) -> Result<InterpretationOutcome> {
    check_quota(pool, user_id).await?;

    let started = neotoma_storage::interpretations::start(
        neotoma_storage::interpretations::NewInterpretation {
            user_id,
            source_id,
            provider: &config.provider,
            model_id: &config.model_id,
            temperature: config.temperature,
            prompt_hash: &config.prompt_hash,
            code_version: &config.code_version,
        },
        pool,
    )
    .await?;

    match process_candidates(pool, user_id, source_id, started.id, candidates, source_priority).await {
        Ok((observation_count, entity_ids)) => {
            neotoma_storage::interpretations::finish(
                started.id,
                neotoma_storage::interpretations::InterpretationStatus::Succeeded,
                pool,
            )
            .await?;
            tracing::info!(interpretation_id = %started.id, observation_count, "interpretation succeeded");
            Ok(InterpretationOutcome {
                interpretation_id: started.id,
                observation_count,
                entity_ids,
            })
        }
        Err(err) => {
            // Failed runs leave prior writes in place; they're independently
            // valid and discoverable by `interpretation_id` (`§4.3`, `§7`).
            neotoma_storage::interpretations::finish(
                started.id,
                neotoma_storage::interpretations::InterpretationStatus::Failed,
                pool,
            )
            .await?;
            tracing::warn!(interpretation_id = %started.id, error = %err, "interpretation failed");
            Err(err)
        }
    }
}

async fn check_quota(pool: &PgPool, user_id: UserId) -> Result<()> {
    let max_per_day = neotoma_storage::quotas::max_interpretations_per_day(user_id, pool).await?;
    let since = Utc::now() - chrono::Duration::hours(QUOTA_WINDOW_HOURS);
    let count = neotoma_storage::interpretations::count_since(user_id, since, pool).await?;
    if count >= max_per_day as i64 {
        return Err(Error::QuotaExceeded(format!(
            "{count} interpretations started in the trailing {QUOTA_WINDOW_HOURS}h, limit is {max_per_day}"
        )));
    }
    Ok(())
}

async fn process_candidates(
    pool: &PgPool,
    user_id: UserId,
    source_id: SourceId,
    interpretation_id: InterpretationId,
    candidates: Vec<ExtractionCandidate>,
    source_priority: SourcePriority,
) -> Result<(usize, Vec<EntityId>)> {
    let mut observation_count = 0;
    let mut entity_ids = Vec::with_capacity(candidates.len());
    let now = Utc::now();

    for candidate in candidates {
        let schema = schema_registry::get_schema(pool, &candidate.entity_type, None).await?;
        let (known_fields, extraction_metadata) = partition_fields(&schema, &candidate.fields);

        let entity_id =
            resolver::resolve_or_mint(pool, user_id, &candidate.entity_type, &schema, &known_fields).await?;
        neotoma_storage::edges::link_source_entity(
            source_id,
            &entity_id,
            "interpreted",
            Some(interpretation_id),
            pool,
        )
        .await?;

        neotoma_storage::observations::insert(
            neotoma_storage::observations::NewObservation {
                user_id,
                entity_id: &entity_id,
                entity_type: &candidate.entity_type,
                source_id: Some(source_id),
                interpretation_id: Some(interpretation_id),
                schema_major: schema.schema_version.major as i32,
                schema_minor: schema.schema_version.minor as i32,
                observed_at: now,
                source_priority: source_priority.value(),
                fields: &known_fields,
                extraction_metadata: extraction_metadata.as_ref(),
            },
            pool,
        )
        .await?;
        observation_count += 1;

        for rel in candidate.relationships {
            let rel_schema = schema_registry::get_schema(pool, &rel.target_entity_type, None).await?;
            let (rel_known, _) = partition_fields(&rel_schema, &rel.target_fields);
            let target_id =
                resolver::resolve_or_mint(pool, user_id, &rel.target_entity_type, &rel_schema, &rel_known)
                    .await?;
            write_relationship_observation(
                pool,
                user_id,
                source_id,
                interpretation_id,
                &entity_id,
                &rel,
                &target_id,
                &schema,
                source_priority,
                now,
            )
            .await?;
        }

        query::recompute_entity_snapshot(pool, user_id, &entity_id).await?;
        entity_ids.push(entity_id);
    }

    Ok((observation_count, entity_ids))
}

/// Splits extractor fields into schema-known vs. unknown (`§4.2`, `§4.3`
/// step 3); a missing required field becomes a warning, never a rejection
/// (`§4.3` step 4, `§7`).
fn partition_fields(schema: &SchemaDefinition, raw: &Value) -> (Value, Option<Value>) {
    let Some(object) = raw.as_object() else {
        return (Value::Object(Default::default()), None);
    };
    let mut known = serde_json::Map::new();
    let mut unknown = serde_json::Map::new();
    for (name, value) in object {
        if schema.field(name).is_some() {
            known.insert(name.clone(), value.clone());
        } else {
            unknown.insert(name.clone(), value.clone());
        }
    }
    let mut warnings = Vec::new();
    for required in schema.required_fields() {
        if !known.contains_key(&required.name) {
            warnings.push(format!("required field {:?} missing", required.name));
        }
    }
    if unknown.is_empty() && warnings.is_empty() {
        return (Value::Object(known), None);
    }
    let mut metadata = serde_json::Map::new();
    if !unknown.is_empty() {
        metadata.insert("unknown_fields".into(), Value::Object(unknown));
    }
    if !warnings.is_empty() {
        metadata.insert(
            "warnings".into(),
            Value::Array(warnings.into_iter().map(Value::String).collect()),
        );
    }
    (Value::Object(known), Some(Value::Object(metadata)))
}

#[allow(clippy::too_many_arguments)]
async fn write_relationship_observation(
    pool: &PgPool,
    user_id: UserId,
    source_id: SourceId,
    interpretation_id: InterpretationId,
    source_entity_id: &EntityId,
    rel: &RelationshipCandidate,
    target_entity_id: &EntityId,
    schema: &SchemaDefinition,
    source_priority: SourcePriority,
    observed_at: DateTime<Utc>,
) -> Result<()> {
    let key = format!("{source_entity_id}->{}->{target_entity_id}", rel.relationship_type);
    let canonical_hash = CanonicalHash::of_key(&key);

    neotoma_storage::relationships::insert(
        neotoma_storage::relationships::NewRelationshipObservation {
            user_id,
            source_entity_id,
            relationship_type: &rel.relationship_type,
            target_entity_id,
            canonical_hash: &canonical_hash,
            source_id: Some(source_id),
            interpretation_id: Some(interpretation_id),
            schema_major: schema.schema_version.major as i32,
            schema_minor: schema.schema_version.minor as i32,
            observed_at,
            source_priority: source_priority.value(),
            fields: &rel.fields,
            extraction_metadata: None,
        },
        pool,
    )
    .await?;

    query::recompute_relationship_snapshot(
        pool,
        user_id,
        &canonical_hash,
        source_entity_id,
        &rel.relationship_type,
        target_entity_id,
    )
    .await?;
    Ok(())
}

pub struct StructuredEntityInput {
    pub entity_type: EntityType,
    pub fields: Value,
    pub relationships: Vec<RelationshipCandidate>,
}

#[derive(Debug, Clone)]
pub struct IngestStructuredOutcome {
    pub source_id: SourceId,
    pub interpretation_id: InterpretationId,
    pub entity_ids: Vec<EntityId>,
}

/// `§6`'s `ingest_structured`: synthesizes its own source from the
/// canonicalized payload so idempotent resubmission dedups, then runs the
/// same candidate-processing pipeline `run_interpretation` uses, at
/// `source_priority=500` by default.
pub async fn ingest_structured(
    pool: &PgPool,
    user_id: UserId,
    entities: Vec<StructuredEntityInput>,
    source_priority: Option<SourcePriority>,
    idempotency_key: Option<&str>,
) -> Result<IngestStructuredOutcome> {
    if let Some(key) = idempotency_key {
        if let Some(claim) = neotoma_storage::idempotency::find(user_id, key, pool).await? {
            return Err(Error::Conflict(format!(
                "idempotency key already claimed by interpretation {}",
                claim.interpretation_id
            )));
        }
    }

    let payload: Vec<Value> = entities.iter().map(|e| e.fields.clone()).collect();
    let bytes = content_store::canonicalize_for_hash(&Value::Array(payload));
    let ingest = content_store::ingest_unstructured(
        pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: &bytes,
            storage_url: "neotoma://structured-ingest",
            mime_type: "application/json",
            original_filename: None,
            provenance: serde_json::json!({"kind": "structured_ingest"}),
        },
    )
    .await?;

    let candidates = entities
        .into_iter()
        .map(|e| ExtractionCandidate {
            entity_type: e.entity_type,
            fields: e.fields,
            relationships: e.relationships,
        })
        .collect();

    let outcome = run_interpretation(
        pool,
        user_id,
        ingest.source_id,
        candidates,
        InterpretationConfig {
            provider: "structured-ingest".into(),
            model_id: "n/a".into(),
            temperature: None,
            prompt_hash: "n/a".into(),
            code_version: env!("CARGO_PKG_VERSION").into(),
        },
        source_priority.unwrap_or(SourcePriority::STRUCTURED),
    )
    .await?;

    if let Some(key) = idempotency_key {
        let mut txn = pool.begin().await.map_err(Error::from)?;
        neotoma_storage::idempotency::claim(user_id, key, ingest.source_id, outcome.interpretation_id, &mut txn)
            .await?;
        txn.commit().await.map_err(Error::from)?;
    }

    Ok(IngestStructuredOutcome {
        source_id: ingest.source_id,
        interpretation_id: outcome.interpretation_id,
        entity_ids: outcome.entity_ids,
    })
}

/// Resolves an entity id through any redirect and fetches its current
/// schema, shared by every operation that writes a single direct observation
/// against an existing entity (`correct`, `delete`, `restore`).
async fn resolve_for_direct_write(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
) -> Result<(EntityId, EntityType, SchemaDefinition)> {
    let entity = neotoma_storage::entities::fetch(user_id, entity_id, pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("entity {entity_id}")))?;
    let target_id = if entity.is_redirected() {
        neotoma_storage::entities::follow_redirect(user_id, entity.id.clone(), pool).await?
    } else {
        entity.id.clone()
    };
    let schema = schema_registry::get_schema(pool, &entity.entity_type, None).await?;
    Ok((target_id, entity.entity_type, schema))
}

/// Writes one observation directly against an already-resolved entity at the
/// given priority, bypassing resolution — the shape shared by `correct`,
/// `delete`, and `restore` (`§4.4`, `§6`).
async fn write_direct_observation(
    pool: &PgPool,
    user_id: UserId,
    target_id: &EntityId,
    entity_type: &EntityType,
    schema: &SchemaDefinition,
    fields: Value,
    priority: SourcePriority,
) -> Result<ObservationId> {
    let row = neotoma_storage::observations::insert(
        neotoma_storage::observations::NewObservation {
            user_id,
            entity_id: target_id,
            entity_type,
            source_id: None,
            interpretation_id: None,
            schema_major: schema.schema_version.major as i32,
            schema_minor: schema.schema_version.minor as i32,
            observed_at: Utc::now(),
            source_priority: priority.value(),
            fields: &fields,
            extraction_metadata: None,
        },
        pool,
    )
    .await?;

    query::recompute_entity_snapshot(pool, user_id, target_id).await?;
    Ok(row.id)
}

/// `correct{user_id, entity_id, field, value}` (`§6`): a correction is
/// simply an observation at priority 1000 directly against an existing
/// entity, bypassing resolution.
pub async fn correct(
    pool: &PgPool,
    user_id: UserId,
    entity_id: &EntityId,
    field: &str,
    value: Value,
) -> Result<ObservationId> {
    let (target_id, entity_type, schema) = resolve_for_direct_write(pool, user_id, entity_id).await?;
    if schema.field(field).is_none() {
        return Err(Error::invalid(format!(
            "unknown field {field:?} for entity type {entity_type}"
        )));
    }

    let fields = serde_json::json!({ field: value });
    let observation_id = write_direct_observation(
        pool,
        user_id,
        &target_id,
        &entity_type,
        &schema,
        fields,
        SourcePriority::CORRECTION,
    )
    .await?;
    tracing::info!(entity_id = %target_id, field, "correction recorded");
    Ok(observation_id)
}

/// Deletes an entity (`§4.4`, `§8` scenario 6): emits a `_deleted: true`
/// observation at priority 1000 (Correction/deletion). The entity and its
/// prior observations are untouched; the reducer derives the tombstone state
/// from whichever observation currently ranks highest in the total order.
pub async fn delete(pool: &PgPool, user_id: UserId, entity_id: &EntityId) -> Result<ObservationId> {
    let (target_id, entity_type, schema) = resolve_for_direct_write(pool, user_id, entity_id).await?;
    let fields = serde_json::json!({ "_deleted": true });
    let observation_id = write_direct_observation(
        pool,
        user_id,
        &target_id,
        &entity_type,
        &schema,
        fields,
        SourcePriority::CORRECTION,
    )
    .await?;
    tracing::info!(entity_id = %target_id, "entity deleted");
    Ok(observation_id)
}

/// Restores a previously deleted entity (`§4.4`, `§8` scenario 6): emits a
/// `_deleted: false` observation at priority 1001 (Restoration), the one
/// priority reserved for outranking a deletion.
pub async fn restore(pool: &PgPool, user_id: UserId, entity_id: &EntityId) -> Result<ObservationId> {
    let (target_id, entity_type, schema) = resolve_for_direct_write(pool, user_id, entity_id).await?;
    let fields = serde_json::json!({ "_deleted": false });
    let observation_id = write_direct_observation(
        pool,
        user_id,
        &target_id,
        &entity_type,
        &schema,
        fields,
        SourcePriority::RESTORATION,
    )
    .await?;
    tracing::info!(entity_id = %target_id, "entity restored");
    Ok(observation_id)
}

/// `reinterpret{user_id, source_id, interpretation_config}` (`§6`): another
/// `run_interpretation` over the same source; prior runs and their
/// observations are untouched (`§4.3`).
pub async fn reinterpret(
    pool: &PgPool,
    user_id: UserId,
    source_id: SourceId,
    candidates: Vec<ExtractionCandidate>,
    config: InterpretationConfig,
    source_priority: SourcePriority,
) -> Result<InterpretationOutcome> {
    run_interpretation(pool, user_id, source_id, candidates, config, source_priority).await
}
