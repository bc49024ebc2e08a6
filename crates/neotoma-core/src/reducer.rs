//! The pure entity-snapshot reducer (`§4.5`).
//!
//! `reduce` is the one function in this crate with no I/O: given the same
//! multiset of observations and the same schema, it produces byte-identical
//! output regardless of the order observations are passed in. Callers own
//! fetching observations and persisting the result; this module only turns
//! one into the other.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use neotoma_models::schema::{FieldDefinition, FieldType, MergePolicy, SchemaDefinition};
use neotoma_models::{ObservationId, SourceId, SourcePriority};
use serde_json::{Map, Value};

/// An observation as the reducer sees it, decoupled from how it's stored.
#[derive(Debug, Clone)]
pub struct ReducerObservation {
    pub observation_id: ObservationId,
    pub source_id: Option<SourceId>,
    pub observed_at: DateTime<Utc>,
    pub source_priority: SourcePriority,
    pub fields: Value,
    pub extraction_metadata: Option<Value>,
}

impl ReducerObservation {
    /// A field's value, falling back to `extraction_metadata.unknown_fields`
    /// so a schema field added after this observation was written is still
    /// reachable on recomputation (`§4.7`).
    fn raw_field(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(v) if !v.is_null() => Some(v),
            _ => self
                .extraction_metadata
                .as_ref()
                .and_then(|m| m.get("unknown_fields"))
                .and_then(|u| u.get(name))
                .filter(|v| !v.is_null()),
        }
    }

    fn is_deleted(&self) -> bool {
        matches!(self.fields.get("_deleted"), Some(Value::Bool(true)))
    }

    /// `(source_priority DESC, observed_at DESC, source_id ASC, observation_id
    /// ASC)` — all four keys required to eliminate ties (`§4.5`, `§9`).
    fn sort_key(&self) -> (Reverse<i32>, Reverse<DateTime<Utc>>, Option<SourceId>, ObservationId) {
        (
            Reverse(self.source_priority.value()),
            Reverse(self.observed_at),
            self.source_id,
            self.observation_id,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ReducedSnapshot {
    pub fields: Value,
    pub field_provenance: Value,
    pub canonical_name: Option<String>,
    pub observation_count: usize,
    pub tombstoned: bool,
    /// Set by callers that followed an entity redirect (`§4.6`, `§8`) before
    /// computing this snapshot. `reduce` itself has no notion of entities, so
    /// it always leaves this `None`.
    pub redirected_to: Option<neotoma_models::EntityId>,
}

pub fn reduce(observations: &[ReducerObservation], schema: &SchemaDefinition) -> ReducedSnapshot {
    let mut sorted: Vec<&ReducerObservation> = observations.iter().collect();
    sorted.sort_by_key(|o| o.sort_key());

    // Tombstone state tracks only the single highest-priority observation,
    // not "any deleted observation ever seen" (`§4.5`).
    let tombstoned = sorted.first().map(|o| o.is_deleted()).unwrap_or(false);

    let mut fields = Map::new();
    let mut provenance = Map::new();
    for field in &schema.fields {
        if let Some((value, winner)) = reduce_field(&sorted, field) {
            fields.insert(field.name.clone(), value);
            provenance.insert(field.name.clone(), provenance_entry(winner));
        }
    }

    let canonical_name = schema.canonicalization_rule.as_ref().and_then(|rule| {
        fields
            .get(&rule.source_field)
            .and_then(Value::as_str)
            .map(|raw| rule.apply(raw))
    });

    ReducedSnapshot {
        fields: Value::Object(fields),
        field_provenance: Value::Object(provenance),
        canonical_name,
        observation_count: observations.len(),
        tombstoned,
        redirected_to: None,
    }
}

fn reduce_field<'a>(
    sorted: &[&'a ReducerObservation],
    field: &FieldDefinition,
) -> Option<(Value, &'a ReducerObservation)> {
    match field.merge_policy {
        MergePolicy::LastWriterWins => sorted
            .iter()
            .find_map(|o| o.raw_field(&field.name).map(|v| (normalize(v, field), *o))),
        MergePolicy::Max | MergePolicy::Min => reduce_extremum(sorted, field),
        MergePolicy::Union => reduce_set(sorted, field, true),
        MergePolicy::ConcatDistinct => reduce_set(sorted, field, false),
    }
}

fn reduce_extremum<'a>(
    sorted: &[&'a ReducerObservation],
    field: &FieldDefinition,
) -> Option<(Value, &'a ReducerObservation)> {
    let want_max = matches!(field.merge_policy, MergePolicy::Max);
    let mut best: Option<(f64, &'a Value, &'a ReducerObservation)> = None;
    for o in sorted {
        let Some(raw) = o.raw_field(&field.name) else {
            continue;
        };
        let Some(n) = numeric_value(raw) else {
            continue;
        };
        let better = match best {
            None => true,
            Some((b, _, _)) => {
                if want_max {
                    n > b
                } else {
                    n < b
                }
            }
        };
        if better {
            best = Some((n, raw, o));
        }
    }
    best.map(|(_, raw, o)| (normalize(raw, field), o))
}

/// `Union`/`ConcatDistinct` over set-typed fields. Provenance is attributed
/// to the first (highest-ranked) observation that contributed any element,
/// since no single observation "wins" a merged set the way scalar policies do.
fn reduce_set<'a>(
    sorted: &[&'a ReducerObservation],
    field: &FieldDefinition,
    sort_ascending: bool,
) -> Option<(Value, &'a ReducerObservation)> {
    let mut seen = BTreeSet::new();
    let mut ordered = Vec::new();
    let mut contributor = None;
    for o in sorted {
        let Some(Value::Array(items)) = o.raw_field(&field.name) else {
            continue;
        };
        if contributor.is_none() {
            contributor = Some(*o);
        }
        for item in items {
            if seen.insert(canonical_scalar_key(item)) {
                ordered.push(item.clone());
            }
        }
    }
    let contributor = contributor?;
    if sort_ascending {
        ordered.sort_by(|a, b| canonical_scalar_key(a).cmp(&canonical_scalar_key(b)));
    }
    Some((Value::Array(ordered), contributor))
}

fn canonical_scalar_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn normalize(value: &Value, field: &FieldDefinition) -> Value {
    match field.value_type {
        FieldType::Number => normalize_number(value, field.precision),
        FieldType::DateTime => normalize_datetime(value),
        _ => value.clone(),
    }
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn normalize_number(value: &Value, precision: Option<u32>) -> Value {
    let Some(precision) = precision else {
        return value.clone();
    };
    let Some(n) = numeric_value(value) else {
        return value.clone();
    };
    Value::String(format!("{:.*}", precision as usize, n))
}

fn normalize_datetime(value: &Value) -> Value {
    let Some(raw) = value.as_str() else {
        return value.clone();
    };
    let parsed = DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc));
    match parsed {
        Ok(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Err(_) => value.clone(),
    }
}

fn provenance_entry(o: &ReducerObservation) -> Value {
    serde_json::json!({
        "observation_id": o.observation_id,
        "source_id": o.source_id,
        "source_priority": o.source_priority.value(),
        "observed_at": o.observed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use neotoma_models::schema::{CanonicalizationRule, EntityResolutionKey, EntityType, SchemaVersion};
    use neotoma_models::SourceId;

    fn obs(priority: SourcePriority, observed_at: &str, fields: Value) -> ReducerObservation {
        ReducerObservation {
            observation_id: ObservationId::new(),
            source_id: Some(SourceId::new()),
            observed_at: observed_at.parse().unwrap(),
            source_priority: priority,
            fields,
            extraction_metadata: None,
        }
    }

    fn person_schema() -> SchemaDefinition {
        SchemaDefinition {
            entity_type: EntityType::new("person").unwrap(),
            schema_version: SchemaVersion::INITIAL,
            fields: vec![
                FieldDefinition {
                    name: "name".into(),
                    value_type: FieldType::String,
                    required: true,
                    validation: None,
                    merge_policy: MergePolicy::LastWriterWins,
                    precision: None,
                },
                FieldDefinition {
                    name: "age".into(),
                    value_type: FieldType::Number,
                    required: false,
                    validation: None,
                    merge_policy: MergePolicy::Max,
                    precision: None,
                },
                FieldDefinition {
                    name: "tags".into(),
                    value_type: FieldType::Set,
                    required: false,
                    validation: None,
                    merge_policy: MergePolicy::Union,
                    precision: None,
                },
            ],
            canonicalization_rule: Some(CanonicalizationRule {
                source_field: "name".into(),
                lowercase: true,
                strip_diacritics: false,
                collapse_whitespace: true,
            }),
            entity_resolution_key: EntityResolutionKey::Identity,
            extraction_rules: Default::default(),
        }
    }

    #[test]
    fn last_writer_wins_picks_highest_priority_observation() {
        let schema = person_schema();
        let observations = vec![
            obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"name": "Alice"})),
            obs(SourcePriority::STRUCTURED, "2024-01-02T00:00:00Z", serde_json::json!({"name": "Alice Smith"})),
        ];
        let snapshot = reduce(&observations, &schema);
        assert_eq!(snapshot.fields["name"], "Alice Smith");
    }

    #[test]
    fn reduce_is_order_independent() {
        let schema = person_schema();
        let observations = vec![
            obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"name": "Alice", "age": 30})),
            obs(SourcePriority::STRUCTURED, "2024-01-02T00:00:00Z", serde_json::json!({"name": "Alice Smith", "age": 31})),
            obs(SourcePriority::CORRECTION, "2024-01-03T00:00:00Z", serde_json::json!({"age": 32})),
        ];
        let forward = reduce(&observations, &schema);
        let mut shuffled = observations.clone();
        shuffled.reverse();
        let backward = reduce(&shuffled, &schema);
        assert_eq!(
            serde_json::to_string(&forward.fields).unwrap(),
            serde_json::to_string(&backward.fields).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&forward.field_provenance).unwrap(),
            serde_json::to_string(&backward.field_provenance).unwrap()
        );
    }

    #[test]
    fn max_picks_highest_numeric_value_regardless_of_priority() {
        let schema = person_schema();
        let observations = vec![
            obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"age": 40})),
            obs(SourcePriority::STRUCTURED, "2024-01-02T00:00:00Z", serde_json::json!({"age": 22})),
        ];
        let snapshot = reduce(&observations, &schema);
        assert_eq!(snapshot.fields["age"], 40);
    }

    #[test]
    fn union_dedups_and_sorts_ascending() {
        let schema = person_schema();
        let observations = vec![
            obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"tags": ["zebra", "apple"]})),
            obs(SourcePriority::STRUCTURED, "2024-01-02T00:00:00Z", serde_json::json!({"tags": ["apple", "mango"]})),
        ];
        let snapshot = reduce(&observations, &schema);
        assert_eq!(snapshot.fields["tags"], serde_json::json!(["apple", "mango", "zebra"]));
    }

    #[test]
    fn concat_distinct_preserves_first_appearance_order() {
        let mut schema = person_schema();
        schema.fields[2].merge_policy = MergePolicy::ConcatDistinct;
        let observations = vec![
            obs(SourcePriority::STRUCTURED, "2024-01-02T00:00:00Z", serde_json::json!({"tags": ["mango", "apple"]})),
            obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"tags": ["apple", "zebra"]})),
        ];
        let snapshot = reduce(&observations, &schema);
        assert_eq!(snapshot.fields["tags"], serde_json::json!(["mango", "apple", "zebra"]));
    }

    #[test]
    fn deletion_and_restoration_tombstone_state_machine() {
        let schema = person_schema();
        let mut observations = vec![obs(
            SourcePriority::AI_EXTRACTION,
            "2024-01-01T00:00:00Z",
            serde_json::json!({"name": "Alice"}),
        )];
        assert!(!reduce(&observations, &schema).tombstoned);

        observations.push(obs(
            SourcePriority::CORRECTION,
            "2024-01-02T00:00:00Z",
            serde_json::json!({"_deleted": true}),
        ));
        assert!(reduce(&observations, &schema).tombstoned);

        observations.push(obs(
            SourcePriority::RESTORATION,
            "2024-01-03T00:00:00Z",
            serde_json::json!({"_deleted": false}),
        ));
        let restored = reduce(&observations, &schema);
        assert!(!restored.tombstoned);
        assert_eq!(restored.fields["name"], "Alice");
    }

    #[test]
    fn unknown_fields_fallback_feeds_newly_promoted_schema_fields() {
        let mut schema = person_schema();
        schema.fields.push(FieldDefinition {
            name: "nickname".into(),
            value_type: FieldType::String,
            required: false,
            validation: None,
            merge_policy: MergePolicy::LastWriterWins,
            precision: None,
        });
        let mut observation = obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"name": "Alice"}));
        observation.extraction_metadata = Some(serde_json::json!({"unknown_fields": {"nickname": "Al"}}));
        let snapshot = reduce(&[observation], &schema);
        assert_eq!(snapshot.fields["nickname"], "Al");
    }

    #[test]
    fn numeric_precision_formats_a_fixed_decimal_string() {
        let mut schema = person_schema();
        schema.fields[1].precision = Some(2);
        let observation = obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"age": 30.456}));
        let snapshot = reduce(&[observation], &schema);
        assert_eq!(snapshot.fields["age"], "30.46");
    }

    #[test]
    fn canonical_name_applies_the_schema_rule() {
        let schema = person_schema();
        let observation = obs(SourcePriority::AI_EXTRACTION, "2024-01-01T00:00:00Z", serde_json::json!({"name": "  José   García  "}));
        let snapshot = reduce(&[observation], &schema);
        assert_eq!(snapshot.canonical_name.as_deref(), Some("josé garcía"));
    }
}
