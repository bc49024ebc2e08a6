//! Content-addressed source storage (`§4.1`).
//!
//! Blob bytes themselves are written by the transport's blob-storage
//! collaborator (`§6`); this module only ever sees the already-written
//! `storage_url` plus enough metadata to compute the dedup key.

use neotoma_models::{ContentHash, Error, Result, SourceId, UserId};
use serde_json::Value;
use sqlx::PgPool;

pub struct IngestUnstructured<'a> {
    pub user_id: UserId,
    pub bytes: &'a [u8],
    pub storage_url: &'a str,
    pub mime_type: &'a str,
    pub original_filename: Option<&'a str>,
    pub provenance: Value,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub source_id: SourceId,
    pub deduplicated: bool,
}

/// Writes (or dedups onto) a source row. `bytes` are hashed, never stored
/// here directly — the caller has already persisted them at `storage_url`
/// before calling this (`§4.1`: blob write is the caller's concern; a write
/// failure there never reaches this function, so no row is inserted).
#[tracing::instrument(skip(pool, req), fields(user_id = %req.user_id))]
pub async fn ingest_unstructured(pool: &PgPool, req: IngestUnstructured<'_>) -> Result<IngestResult> {
    let content_hash = ContentHash::of(req.bytes);

    if let Some(existing) = neotoma_storage::sources::find_by_hash(req.user_id, &content_hash, pool).await? {
        tracing::info!(source_id = %existing.id, "source deduplicated");
        return Ok(IngestResult {
            source_id: existing.id,
            deduplicated: true,
        });
    }

    let inserted = neotoma_storage::sources::insert(
        neotoma_storage::sources::NewSource {
            user_id: req.user_id,
            content_hash: &content_hash,
            storage_url: req.storage_url,
            mime_type: req.mime_type,
            file_size: req.bytes.len() as i64,
            original_filename: req.original_filename,
            provenance: &req.provenance,
        },
        pool,
    )
    .await;

    match inserted {
        Ok(row) => {
            tracing::info!(source_id = %row.id, "source ingested");
            Ok(IngestResult {
                source_id: row.id,
                deduplicated: false,
            })
        }
        Err(err) if is_unique_violation(&err) => {
            // A concurrent writer won the race on `(user_id, content_hash)`;
            // the loser reports the winner's id as a dedup hit (`§4.1`).
            let winner = neotoma_storage::sources::find_by_hash(req.user_id, &content_hash, pool)
                .await?
                .ok_or_else(|| Error::internal("lost unique-violation race but no row found"))?;
            Ok(IngestResult {
                source_id: winner.id,
                deduplicated: true,
            })
        }
        Err(err) => Err(err.into()),
    }
}

/// Synthesizes a source for `ingest_structured` (`§6`): the "bytes" are the
/// canonicalized JSON payload, so resubmitting the same structured entities
/// dedups exactly like a file upload would.
pub fn canonicalize_for_hash(payload: &Value) -> Vec<u8> {
    // `serde_json`'s `Map` preserves insertion order at this workspace's
    // feature set, so two structurally-identical payloads built the same
    // way hash identically; callers should build `payload` with stable key
    // ordering if determinism across call sites matters.
    serde_json::to_vec(payload).expect("Value always serializes")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
