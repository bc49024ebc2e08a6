//! The schema registry (`§4.2`, `§4.7`).

use std::collections::{HashMap, HashSet};

use lazy_static::lazy_static;
use neotoma_models::schema::{EntityResolutionKey, FieldDefinition, FieldType, SchemaDefinition};
use neotoma_models::{EntityType, Error, Result, SchemaVersion, SourceId};
use regex::Regex;
use serde_json::Value;
use sqlx::PgPool;

pub async fn list_entity_types(pool: &PgPool) -> Result<Vec<String>> {
    Ok(neotoma_storage::schemas::list_entity_types(pool).await?)
}

pub async fn get_schema(
    pool: &PgPool,
    entity_type: &EntityType,
    version: Option<SchemaVersion>,
) -> Result<SchemaDefinition> {
    let schema = match version {
        Some(v) => neotoma_storage::schemas::get_version(entity_type, v, pool).await?,
        None => neotoma_storage::schemas::get_latest(entity_type, pool).await?,
    };
    schema.ok_or_else(|| Error::not_found(format!("schema for entity type {entity_type}")))
}

/// Registers a brand-new entity type at `schema_version = 1.0`. Required
/// fields may only be declared here, never via `update_schema_incremental`
/// (`§4.7`).
pub async fn register_schema(pool: &PgPool, schema: SchemaDefinition) -> Result<()> {
    validate_resolution_key(&schema)?;
    if neotoma_storage::schemas::get_version(&schema.entity_type, schema.schema_version, pool)
        .await?
        .is_some()
    {
        return Err(Error::Conflict(format!(
            "schema {}@{} already registered",
            schema.entity_type, schema.schema_version
        )));
    }
    neotoma_storage::schemas::insert(&schema, pool).await?;
    tracing::info!(entity_type = %schema.entity_type, schema_version = %schema.schema_version, "schema registered");
    Ok(())
}

fn validate_resolution_key(schema: &SchemaDefinition) -> Result<()> {
    let names: &[String] = match &schema.entity_resolution_key {
        EntityResolutionKey::Natural { fields } | EntityResolutionKey::ContentHash { fields } => fields,
        EntityResolutionKey::Identity => return Ok(()),
    };
    if names.is_empty() {
        return Err(Error::SchemaViolation(
            "entity resolution key must name at least one field".into(),
        ));
    }
    for name in names {
        if schema.field(name).is_none() {
            return Err(Error::SchemaViolation(format!(
                "entity resolution key references undefined field {name:?}"
            )));
        }
    }
    Ok(())
}

/// Mints the next additive `schema_version`. `new_fields` may not be
/// required: `§4.7` forbids introducing a required field on an existing
/// type, since every prior observation would silently fail it.
pub async fn update_schema_incremental(
    pool: &PgPool,
    entity_type: &EntityType,
    new_fields: Vec<FieldDefinition>,
) -> Result<SchemaDefinition> {
    let latest = get_schema(pool, entity_type, None).await?;
    if let Some(bad) = new_fields.iter().find(|f| f.required) {
        return Err(Error::SchemaViolation(format!(
            "cannot introduce required field {:?} on an existing schema",
            bad.name
        )));
    }
    let mut next = latest.clone();
    next.schema_version = latest.schema_version.next_minor();
    for field in new_fields {
        if next.field(&field.name).is_some() {
            return Err(Error::SchemaViolation(format!("field {:?} already defined", field.name)));
        }
        next.fields.push(field);
    }
    if !latest.is_additive_successor(&next) {
        return Err(Error::internal("computed non-additive schema successor"));
    }
    neotoma_storage::schemas::insert(&next, pool).await?;
    tracing::info!(entity_type = %entity_type, schema_version = %next.schema_version, "schema evolved");
    Ok(next)
}

const MIN_OCCURRENCES: usize = 3;
const MIN_DISTINCT_SOURCES: usize = 2;
const SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SchemaCandidate {
    pub field_name: String,
    pub occurrences: usize,
    pub distinct_sources: usize,
}

/// Scans recent observations' `extraction_metadata.unknown_fields` for
/// fields seen often enough, from enough distinct sources, to be worth
/// promoting (`§4.2`).
pub async fn analyze_schema_candidates(pool: &PgPool, entity_type: &EntityType) -> Result<Vec<SchemaCandidate>> {
    let rows = neotoma_storage::observations::list_recent_with_unknown_fields(entity_type, SCAN_LIMIT, pool).await?;

    let mut occurrences: HashMap<String, usize> = HashMap::new();
    let mut sources: HashMap<String, HashSet<SourceId>> = HashMap::new();
    for row in &rows {
        let Some(metadata) = row.extraction_metadata() else {
            continue;
        };
        let Some(unknown) = metadata.get("unknown_fields").and_then(Value::as_object) else {
            continue;
        };
        for field_name in unknown.keys() {
            *occurrences.entry(field_name.clone()).or_default() += 1;
            if let Some(source_id) = row.source_id {
                sources.entry(field_name.clone()).or_default().insert(source_id);
            }
        }
    }

    let mut candidates: Vec<SchemaCandidate> = occurrences
        .into_iter()
        .filter_map(|(field_name, occurrences)| {
            let distinct_sources = sources.get(&field_name).map(HashSet::len).unwrap_or(0);
            (occurrences >= MIN_OCCURRENCES && distinct_sources >= MIN_DISTINCT_SOURCES).then_some(SchemaCandidate {
                field_name,
                occurrences,
                distinct_sources,
            })
        })
        .collect();
    candidates.sort_by(|a, b| a.field_name.cmp(&b.field_name));
    Ok(candidates)
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldRecommendation {
    pub field_name: String,
    pub inferred_type: FieldType,
    pub sample_count: usize,
}

lazy_static! {
    static ref UUID_RE: Regex =
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$").unwrap();
    static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    static ref DATETIME_RE: Regex = Regex::new(r"^\d{4}-\d{2}-\d{2}([T ]\d{2}:\d{2}(:\d{2})?)?").unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"^-?\d+(\.\d+)?$").unwrap();
}

/// Infers a likely `FieldType` for each schema candidate from a sample of
/// its observed values, so `update_schema_incremental` can be called with a
/// reasonable default without a human picking a type from scratch (`§4.2`).
pub async fn get_schema_recommendations(pool: &PgPool, entity_type: &EntityType) -> Result<Vec<FieldRecommendation>> {
    let candidates = analyze_schema_candidates(pool, entity_type).await?;
    let rows = neotoma_storage::observations::list_recent_with_unknown_fields(entity_type, SCAN_LIMIT, pool).await?;

    let mut samples: HashMap<String, Vec<String>> = HashMap::new();
    for row in &rows {
        let Some(metadata) = row.extraction_metadata() else {
            continue;
        };
        let Some(unknown) = metadata.get("unknown_fields").and_then(Value::as_object) else {
            continue;
        };
        for (name, value) in unknown {
            samples.entry(name.clone()).or_default().push(scalar_sample(value));
        }
    }

    Ok(candidates
        .into_iter()
        .map(|c| {
            let values = samples.get(&c.field_name).map(Vec::as_slice).unwrap_or(&[]);
            FieldRecommendation {
                inferred_type: infer_field_type(values),
                sample_count: values.len(),
                field_name: c.field_name,
            }
        })
        .collect())
}

fn scalar_sample(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn infer_field_type(samples: &[String]) -> FieldType {
    if samples.is_empty() {
        return FieldType::String;
    }
    if samples.iter().all(|s| UUID_RE.is_match(s)) {
        return FieldType::Uuid;
    }
    if samples.iter().all(|s| EMAIL_RE.is_match(s)) {
        return FieldType::Email;
    }
    if samples.iter().all(|s| DATETIME_RE.is_match(s)) {
        return FieldType::DateTime;
    }
    if samples.iter().all(|s| NUMBER_RE.is_match(s)) {
        return FieldType::Number;
    }
    if samples.iter().all(|s| s == "true" || s == "false") {
        return FieldType::Boolean;
    }
    FieldType::String
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_uuid() {
        let samples = vec!["3fa85f64-5717-4562-b3fc-2c963f66afa6".to_string()];
        assert_eq!(infer_field_type(&samples), FieldType::Uuid);
    }

    #[test]
    fn infers_email() {
        let samples = vec!["a@example.com".to_string(), "b@example.org".to_string()];
        assert_eq!(infer_field_type(&samples), FieldType::Email);
    }

    #[test]
    fn infers_number() {
        let samples = vec!["42".to_string(), "3.5".to_string()];
        assert_eq!(infer_field_type(&samples), FieldType::Number);
    }

    #[test]
    fn falls_back_to_string() {
        let samples = vec!["hello world".to_string()];
        assert_eq!(infer_field_type(&samples), FieldType::String);
    }
}
