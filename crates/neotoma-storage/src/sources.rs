//! Persistence for the content store (`§4.1`).

use chrono::{DateTime, Utc};
use neotoma_models::{ContentHash, SourceId, UserId};
use serde_json::Value;
use sqlx::PgExecutor;

use crate::text_json::TextJson;

#[derive(Debug)]
pub struct SourceRow {
    pub id: SourceId,
    pub user_id: UserId,
    pub content_hash: Vec<u8>,
    pub storage_url: String,
    pub mime_type: String,
    pub file_size: i64,
    pub original_filename: Option<String>,
    pub provenance: TextJson<Value>,
    pub created_at: DateTime<Utc>,
}

impl SourceRow {
    pub fn content_hash(&self) -> Result<ContentHash, neotoma_models::Error> {
        ContentHash::from_bytes(&self.content_hash)
    }

    pub fn provenance(&self) -> &Value {
        &self.provenance.0
    }
}

/// Looks up an existing source by its per-tenant dedup key. A hit here is
/// exactly what the content store reports back to the caller as
/// `deduplicated: true`.
pub async fn find_by_hash(
    user_id: UserId,
    content_hash: &ContentHash,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SourceRow>> {
    sqlx::query_as!(
        SourceRow,
        r#"
        select
            id as "id: SourceId",
            user_id as "user_id: UserId",
            content_hash,
            storage_url,
            mime_type,
            file_size,
            original_filename,
            provenance as "provenance: TextJson<Value>",
            created_at
        from sources
        where user_id = $1 and content_hash = $2
        "#,
        user_id as UserId,
        content_hash.as_bytes().as_slice(),
    )
    .fetch_optional(db)
    .await
}

pub async fn fetch(
    user_id: UserId,
    id: SourceId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SourceRow>> {
    sqlx::query_as!(
        SourceRow,
        r#"
        select
            id as "id: SourceId",
            user_id as "user_id: UserId",
            content_hash,
            storage_url,
            mime_type,
            file_size,
            original_filename,
            provenance as "provenance: TextJson<Value>",
            created_at
        from sources
        where user_id = $1 and id = $2
        "#,
        user_id as UserId,
        id as SourceId,
    )
    .fetch_optional(db)
    .await
}

pub struct NewSource<'a> {
    pub user_id: UserId,
    pub content_hash: &'a ContentHash,
    pub storage_url: &'a str,
    pub mime_type: &'a str,
    pub file_size: i64,
    pub original_filename: Option<&'a str>,
    pub provenance: &'a Value,
}

/// Inserts a new source row. Relies on the `(user_id, content_hash)` unique
/// constraint: if a concurrent writer wins the race, this returns a unique
/// violation that the caller maps back to a dedup hit (`§4.1`).
pub async fn insert(new: NewSource<'_>, db: impl PgExecutor<'_>) -> sqlx::Result<SourceRow> {
    sqlx::query_as!(
        SourceRow,
        r#"
        insert into sources (
            user_id, content_hash, storage_url, mime_type,
            file_size, original_filename, provenance
        )
        values ($1, $2, $3, $4, $5, $6, $7)
        returning
            id as "id: SourceId",
            user_id as "user_id: UserId",
            content_hash,
            storage_url,
            mime_type,
            file_size,
            original_filename,
            provenance as "provenance: TextJson<Value>",
            created_at
        "#,
        new.user_id as UserId,
        new.content_hash.as_bytes().as_slice(),
        new.storage_url,
        new.mime_type,
        new.file_size,
        new.original_filename,
        TextJson(new.provenance) as TextJson<&Value>,
    )
    .fetch_one(db)
    .await
}

