//! End-to-end scenarios over a real Postgres, one per `§8` example (dedup,
//! correction overriding an AI extraction, reinterpretation additivity,
//! merge rewriting and redirecting, additive schema promotion, and the
//! deletion/restoration tombstone state machine). Each test builds its own
//! tenant and schema inline; `sqlx::test` gives every test a fresh migrated
//! database, so there is no shared fixture state to coordinate.

use neotoma_core::interpretation::{run_interpretation, ExtractionCandidate, InterpretationConfig};
use neotoma_core::{content_store, query, resolver, schema_registry};
use neotoma_models::schema::{
    CanonicalizationRule, EntityResolutionKey, FieldDefinition, FieldType, MergePolicy, SchemaDefinition,
};
use neotoma_models::{EntityType, SchemaVersion, SourcePriority, UserId};
use sqlx::PgPool;
use uuid::Uuid;

fn tenant() -> UserId {
    UserId::new(Uuid::new_v4())
}

fn person_schema() -> SchemaDefinition {
    SchemaDefinition {
        entity_type: EntityType::new("person").unwrap(),
        schema_version: SchemaVersion::INITIAL,
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
        canonicalization_rule: Some(CanonicalizationRule {
            source_field: "name".into(),
            lowercase: false,
            strip_diacritics: false,
            collapse_whitespace: true,
        }),
        entity_resolution_key: EntityResolutionKey::Natural {
            fields: vec!["email".into()],
        },
        extraction_rules: Default::default(),
    }
}

fn extraction_config() -> InterpretationConfig {
    InterpretationConfig {
        provider: "test-extractor".into(),
        model_id: "test-model".into(),
        temperature: None,
        prompt_hash: "test".into(),
        code_version: "0.0.0-test".into(),
    }
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn ingesting_identical_bytes_twice_dedups(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    let bytes = b"same file contents";

    let first = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes,
            storage_url: "s3://bucket/a",
            mime_type: "text/plain",
            original_filename: Some("a.txt"),
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    assert!(!first.deduplicated);

    let second = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes,
            storage_url: "s3://bucket/b",
            mime_type: "text/plain",
            original_filename: Some("b.txt"),
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    assert!(second.deduplicated);
    assert_eq!(first.source_id, second.source_id);

    Ok(())
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn correction_overrides_ai_extraction(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    schema_registry::register_schema(&pool, person_schema()).await.unwrap();

    let ingest = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: b"resume.pdf contents",
            storage_url: "s3://bucket/resume.pdf",
            mime_type: "application/pdf",
            original_filename: Some("resume.pdf"),
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let outcome = run_interpretation(
        &pool,
        user_id,
        ingest.source_id,
        vec![ExtractionCandidate {
            entity_type: EntityType::new("person").unwrap(),
            fields: serde_json::json!({"email": "a@example.com", "name": "A. Extracted"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();
    let entity_id = outcome.entity_ids[0].clone();

    let before = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert_eq!(before.fields["name"], "A. Extracted");

    neotoma_core::interpretation::correct(&pool, user_id, &entity_id, "name", serde_json::json!("Corrected Name"))
        .await
        .unwrap();

    let after = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert_eq!(after.fields["name"], "Corrected Name");

    // A later AI extraction must not override the correction (`§4.4`).
    let second_ai = run_interpretation(
        &pool,
        user_id,
        ingest.source_id,
        vec![ExtractionCandidate {
            entity_type: EntityType::new("person").unwrap(),
            fields: serde_json::json!({"email": "a@example.com", "name": "Yet Another Extraction"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();
    assert_eq!(second_ai.entity_ids[0], entity_id);

    let still_corrected = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert_eq!(still_corrected.fields["name"], "Corrected Name");

    Ok(())
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn reinterpretation_adds_without_erasing_prior_runs(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    schema_registry::register_schema(&pool, person_schema()).await.unwrap();

    let ingest = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: b"transcript contents",
            storage_url: "s3://bucket/transcript",
            mime_type: "text/plain",
            original_filename: None,
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();

    let first_run = run_interpretation(
        &pool,
        user_id,
        ingest.source_id,
        vec![ExtractionCandidate {
            entity_type: EntityType::new("person").unwrap(),
            fields: serde_json::json!({"email": "b@example.com", "name": "B"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();

    let second_run = run_interpretation(
        &pool,
        user_id,
        ingest.source_id,
        vec![ExtractionCandidate {
            entity_type: EntityType::new("person").unwrap(),
            fields: serde_json::json!({"email": "b@example.com", "name": "B. Better"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();

    assert_ne!(first_run.interpretation_id, second_run.interpretation_id);

    let entity_id = &second_run.entity_ids[0];
    let observations = query::list_observations(&pool, user_id, entity_id).await.unwrap();
    assert_eq!(observations.len(), 2);

    Ok(())
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn merge_rewrites_observations_and_redirects_the_losing_entity(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    schema_registry::register_schema(&pool, person_schema()).await.unwrap();
    let entity_type = EntityType::new("person").unwrap();

    // Two distinct resolution keys mint two distinct entities even though a
    // human would recognize them as the same person.
    let ingest_a = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: b"profile-a",
            storage_url: "s3://bucket/profile-a",
            mime_type: "text/plain",
            original_filename: None,
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let run_a = run_interpretation(
        &pool,
        user_id,
        ingest_a.source_id,
        vec![ExtractionCandidate {
            entity_type: entity_type.clone(),
            fields: serde_json::json!({"email": "dup-a@example.com", "name": "Dup Person"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();
    let a = run_a.entity_ids[0].clone();

    let ingest_b = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: b"profile-b",
            storage_url: "s3://bucket/profile-b",
            mime_type: "text/plain",
            original_filename: None,
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let run_b = run_interpretation(
        &pool,
        user_id,
        ingest_b.source_id,
        vec![ExtractionCandidate {
            entity_type: entity_type.clone(),
            fields: serde_json::json!({"email": "dup-b@example.com", "name": "Dup Person"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();
    let b = run_b.entity_ids[0].clone();
    assert_ne!(a, b);

    let result = resolver::merge(&pool, user_id, &b, &a).await.unwrap();
    assert_eq!(result.observations_moved, 1);
    query::recompute_entity_snapshot(&pool, user_id, &a).await.unwrap();

    let redirected = neotoma_storage::entities::follow_redirect(user_id, b.clone(), &pool).await.unwrap();
    assert_eq!(redirected, a);

    // Reads against the redirected id transparently resolve to `a`, but say so.
    let merged_snapshot = query::retrieve_entity_snapshot(&pool, user_id, &b, None).await.unwrap();
    assert_eq!(merged_snapshot.fields["name"], "Dup Person");
    assert_eq!(merged_snapshot.redirected_to, Some(a.clone()));

    // Querying the surviving entity directly carries no redirect indicator.
    let direct_snapshot = query::retrieve_entity_snapshot(&pool, user_id, &a, None).await.unwrap();
    assert_eq!(direct_snapshot.redirected_to, None);

    let combined = query::list_observations(&pool, user_id, &a).await.unwrap();
    assert_eq!(combined.len(), 2);

    Ok(())
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn additive_schema_promotion_surfaces_historical_unknown_fields(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    schema_registry::register_schema(&pool, person_schema()).await.unwrap();
    let entity_type = EntityType::new("person").unwrap();

    for i in 0..3 {
        let ingest = content_store::ingest_unstructured(
            &pool,
            content_store::IngestUnstructured {
                user_id,
                bytes: format!("doc-{i}").as_bytes(),
                storage_url: "s3://bucket/doc",
                mime_type: "text/plain",
                original_filename: None,
                provenance: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

        run_interpretation(
            &pool,
            user_id,
            ingest.source_id,
            vec![ExtractionCandidate {
                entity_type: entity_type.clone(),
                fields: serde_json::json!({
                    "email": format!("p{i}@example.com"),
                    "name": format!("Person {i}"),
                    "job_title": "Engineer",
                }),
                relationships: vec![],
            }],
            extraction_config(),
            SourcePriority::AI_EXTRACTION,
        )
        .await
        .unwrap();
    }

    let candidates = schema_registry::analyze_schema_candidates(&pool, &entity_type).await.unwrap();
    assert!(candidates.iter().any(|c| c.field_name == "job_title"));

    let promotion = neotoma_core::evolution::promote_schema_candidates(&pool, &entity_type)
        .await
        .unwrap()
        .expect("job_title should qualify for promotion");
    assert!(promotion.schema.field("job_title").is_some());
    assert_eq!(promotion.entities_recomputed, 3);

    Ok(())
}

#[sqlx::test(migrations = "../neotoma-storage/migrations")]
async fn deletion_then_restoration_round_trips_through_tombstone(pool: PgPool) -> sqlx::Result<()> {
    let user_id = tenant();
    schema_registry::register_schema(&pool, person_schema()).await.unwrap();
    let entity_type = EntityType::new("person").unwrap();

    let ingest = content_store::ingest_unstructured(
        &pool,
        content_store::IngestUnstructured {
            user_id,
            bytes: b"record",
            storage_url: "s3://bucket/record",
            mime_type: "text/plain",
            original_filename: None,
            provenance: serde_json::json!({}),
        },
    )
    .await
    .unwrap();
    let outcome = run_interpretation(
        &pool,
        user_id,
        ingest.source_id,
        vec![ExtractionCandidate {
            entity_type: entity_type.clone(),
            fields: serde_json::json!({"email": "c@example.com", "name": "C"}),
            relationships: vec![],
        }],
        extraction_config(),
        SourcePriority::AI_EXTRACTION,
    )
    .await
    .unwrap();
    let entity_id = outcome.entity_ids[0].clone();

    let live = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert!(!live.tombstoned);

    neotoma_core::interpretation::correct(&pool, user_id, &entity_id, "email", serde_json::json!("c@example.com"))
        .await
        .unwrap();

    neotoma_core::interpretation::delete(&pool, user_id, &entity_id).await.unwrap();
    let tombstoned = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert!(tombstoned.tombstoned);

    neotoma_core::interpretation::restore(&pool, user_id, &entity_id).await.unwrap();
    let restored = query::retrieve_entity_snapshot(&pool, user_id, &entity_id, None).await.unwrap();
    assert!(!restored.tombstoned);
    assert_eq!(restored.fields["name"], "C");

    Ok(())
}
