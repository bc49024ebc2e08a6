//! Entity identity assignment and merge (`§4.6`).

use neotoma_models::schema::{EntityResolutionKey, SchemaDefinition};
use neotoma_models::{ContentHash, EntityId, EntityType, Error, Result, UserId};
use serde_json::Value;
use sqlx::PgPool;

/// Computes the resolution-key string for a candidate's fields, or `None`
/// for `EntityResolutionKey::Identity` (every observation mints its own
/// entity; `§4.6`).
pub fn compute_resolution_key(schema: &SchemaDefinition, fields: &Value) -> Result<Option<String>> {
    match &schema.entity_resolution_key {
        EntityResolutionKey::Identity => Ok(None),
        EntityResolutionKey::Natural { fields: names } => Ok(Some(concat_key(fields, names)?)),
        EntityResolutionKey::ContentHash { fields: names } => {
            let raw = concat_key(fields, names)?;
            Ok(Some(ContentHash::of(raw.as_bytes()).to_hex()))
        }
    }
}

fn concat_key(fields: &Value, names: &[String]) -> Result<String> {
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        let value = fields
            .get(name)
            .ok_or_else(|| Error::invalid(format!("resolution key field {name:?} missing from candidate")))?;
        parts.push(scalar_to_key_part(value));
    }
    Ok(parts.join("\u{0}"))
}

fn scalar_to_key_part(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves `fields` to an entity id under `schema`, minting one if this is
/// the first observation under its resolution key. Repeatable: the same key
/// against the same database state always yields the same id (`§4.6`).
pub async fn resolve_or_mint(
    pool: &PgPool,
    user_id: UserId,
    entity_type: &EntityType,
    schema: &SchemaDefinition,
    fields: &Value,
) -> Result<EntityId> {
    let Some(key) = compute_resolution_key(schema, fields)? else {
        let mut txn = pool.begin().await.map_err(Error::from)?;
        let id = neotoma_storage::entities::mint_identity(user_id, entity_type, &mut txn).await?;
        txn.commit().await.map_err(Error::from)?;
        return Ok(id);
    };

    if let Some(id) = neotoma_storage::entities::find_by_resolution_key(user_id, entity_type, &key, pool).await? {
        return neotoma_storage::entities::follow_redirect(user_id, id, pool)
            .await
            .map_err(Into::into);
    }

    let mut txn = pool.begin().await.map_err(Error::from)?;
    match neotoma_storage::entities::mint_with_resolution_key(user_id, entity_type, &key, &mut txn).await {
        Ok(id) => {
            txn.commit().await.map_err(Error::from)?;
            Ok(id)
        }
        Err(err) if is_unique_violation(&err) => {
            // Lost the race to mint this key; the winner's row is now
            // visible, so retry the lookup instead of minting again (`§4.6`,
            // `§5`).
            txn.rollback().await.ok();
            let winner = neotoma_storage::entities::find_by_resolution_key(user_id, entity_type, &key, pool)
                .await?
                .ok_or_else(|| Error::internal("lost entity-mint race but no row found"))?;
            neotoma_storage::entities::follow_redirect(user_id, winner, pool)
                .await
                .map_err(Into::into)
        }
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub observations_moved: i64,
}

/// Performs the atomic merge (`§4.6`, `§7`): rewrite `from`'s observations
/// onto `to`, redirect `from`, and write the audit row, all in one
/// transaction. Callers should follow this with
/// `query::recompute_entity_snapshot(pool, user_id, to)` — left to the
/// caller since a cache rebuild after commit needs no transaction of its
/// own.
pub async fn merge(pool: &PgPool, user_id: UserId, from: &EntityId, to: &EntityId) -> Result<MergeResult> {
    if from == to {
        return Err(Error::invalid("cannot merge an entity into itself"));
    }
    let mut txn = pool.begin().await.map_err(Error::from)?;
    let moved = neotoma_storage::observations::rewrite_entity_id(from, to, &mut txn).await?;
    neotoma_storage::entities::mark_merged(from, to, &mut txn).await?;
    neotoma_storage::entities::insert_merge_audit(user_id, from, to, moved as i64, &mut txn).await?;
    txn.commit().await.map_err(Error::from)?;

    tracing::info!(from = %from, to = %to, observations_moved = moved, "entities merged");

    Ok(MergeResult {
        observations_moved: moved as i64,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[cfg(test)]
mod tests {
    use super::*;
    use neotoma_models::schema::{FieldDefinition, FieldType, MergePolicy};

    fn natural_schema() -> SchemaDefinition {
        SchemaDefinition {
            entity_type: EntityType::new("person").unwrap(),
            schema_version: neotoma_models::schema::SchemaVersion::INITIAL,
            fields: vec![
                FieldDefinition {
                    name: "email".into(),
                    value_type: FieldType::Email,
                    required: true,
                    validation: None,
                    merge_policy: MergePolicy::LastWriterWins,
                    precision: None,
                },
                FieldDefinition {
                    name: "name".into(),
                    value_type: FieldType::String,
                    required: false,
                    validation: None,
                    merge_policy: MergePolicy::LastWriterWins,
                    precision: None,
                },
            ],
            canonicalization_rule: None,
            entity_resolution_key: EntityResolutionKey::Natural {
                fields: vec!["email".into()],
            },
            extraction_rules: Default::default(),
        }
    }

    #[test]
    fn natural_key_is_stable_across_field_order() {
        let schema = natural_schema();
        let a = serde_json::json!({"email": "a@example.com", "name": "A"});
        let b = serde_json::json!({"name": "A", "email": "a@example.com"});
        assert_eq!(
            compute_resolution_key(&schema, &a).unwrap(),
            compute_resolution_key(&schema, &b).unwrap()
        );
    }

    #[test]
    fn natural_key_missing_field_is_invalid_input() {
        let schema = natural_schema();
        let fields = serde_json::json!({"name": "A"});
        let err = compute_resolution_key(&schema, &fields).unwrap_err();
        assert_eq!(err.tag(), neotoma_models::ErrorTag::InvalidInput);
    }

    #[test]
    fn identity_schema_has_no_resolution_key() {
        let mut schema = natural_schema();
        schema.entity_resolution_key = EntityResolutionKey::Identity;
        let fields = serde_json::json!({"email": "a@example.com"});
        assert_eq!(compute_resolution_key(&schema, &fields).unwrap(), None);
    }

    #[test]
    fn content_hash_key_is_deterministic() {
        let mut schema = natural_schema();
        schema.entity_resolution_key = EntityResolutionKey::ContentHash {
            fields: vec!["email".into()],
        };
        let fields = serde_json::json!({"email": "a@example.com"});
        let key_a = compute_resolution_key(&schema, &fields).unwrap();
        let key_b = compute_resolution_key(&schema, &fields).unwrap();
        assert_eq!(key_a, key_b);
        assert_ne!(key_a.unwrap(), "a@example.com");
    }
}
