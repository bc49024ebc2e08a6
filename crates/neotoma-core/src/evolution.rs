//! Schema evolution orchestration (`§4.7`): wires
//! `schema_registry::analyze_schema_candidates` and
//! `get_schema_recommendations` into a single promotion step, then
//! refreshes every affected entity's cached snapshot so newly-promoted
//! fields are visible without waiting for the next write.

use neotoma_models::schema::{FieldDefinition, MergePolicy, SchemaDefinition};
use neotoma_models::{EntityType, Result};
use sqlx::PgPool;

use crate::{query, schema_registry};

#[derive(Debug, Clone)]
pub struct PromotionOutcome {
    pub schema: SchemaDefinition,
    pub entities_recomputed: usize,
}

/// Promotes every field `analyze_schema_candidates` currently qualifies
/// for `entity_type`, inferring each one's type from its samples and
/// defaulting to `MergePolicy::LastWriterWins` (the safe default for a
/// field nobody has declared a merge policy for yet).
pub async fn promote_schema_candidates(pool: &PgPool, entity_type: &EntityType) -> Result<Option<PromotionOutcome>> {
    let recommendations = schema_registry::get_schema_recommendations(pool, entity_type).await?;
    if recommendations.is_empty() {
        return Ok(None);
    }

    let new_fields = recommendations
        .into_iter()
        .map(|r| FieldDefinition {
            name: r.field_name,
            value_type: r.inferred_type,
            required: false,
            validation: None,
            merge_policy: MergePolicy::LastWriterWins,
            precision: None,
        })
        .collect();

    let schema = schema_registry::update_schema_incremental(pool, entity_type, new_fields).await?;
    let entities_recomputed = recompute_all_snapshots(pool, entity_type).await?;

    tracing::info!(
        entity_type = %entity_type,
        schema_version = %schema.schema_version,
        entities_recomputed,
        "schema candidates promoted"
    );

    Ok(Some(PromotionOutcome {
        schema,
        entities_recomputed,
    }))
}

/// Recomputes every entity of a type so a promoted field's historical
/// values (sitting in `extraction_metadata.unknown_fields` on old
/// observations) surface in the cached snapshot immediately (`§4.7`).
async fn recompute_all_snapshots(pool: &PgPool, entity_type: &EntityType) -> Result<usize> {
    const PAGE: i64 = 200;
    let mut offset = 0;
    let mut count = 0;
    loop {
        let page = neotoma_storage::entities::list_all_for_type(entity_type, PAGE, offset, pool).await?;
        if page.is_empty() {
            break;
        }
        for entity in &page {
            query::recompute_entity_snapshot(pool, entity.user_id, &entity.id).await?;
            count += 1;
        }
        if (page.len() as i64) < PAGE {
            break;
        }
        offset += PAGE;
    }
    Ok(count)
}
