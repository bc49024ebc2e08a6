//! Persistence for derived timeline events (`§3`, `§4.8`).

use chrono::{DateTime, Utc};
use neotoma_models::{InterpretationId, SourceId, UserId};
use serde_json::Value;
use sqlx::PgExecutor;
use uuid::Uuid;

use crate::text_json::TextJson;

#[derive(Debug)]
pub struct TimelineEventRow {
    pub id: Uuid,
    pub user_id: UserId,
    pub event_type: String,
    pub entity_ids: Vec<String>,
    pub source_id: Option<SourceId>,
    pub interpretation_id: Option<InterpretationId>,
    pub occurred_at: DateTime<Utc>,
    pub fields: TextJson<Value>,
    pub created_at: DateTime<Utc>,
}

impl TimelineEventRow {
    pub fn fields(&self) -> &Value {
        &self.fields.0
    }
}

pub struct NewTimelineEvent<'a> {
    pub user_id: UserId,
    pub event_type: &'a str,
    pub entity_ids: &'a [String],
    pub source_id: Option<SourceId>,
    pub interpretation_id: Option<InterpretationId>,
    pub occurred_at: DateTime<Utc>,
    pub fields: &'a Value,
}

pub async fn insert(
    new: NewTimelineEvent<'_>,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<TimelineEventRow> {
    sqlx::query_as!(
        TimelineEventRow,
        r#"
        insert into timeline_events (
            user_id, event_type, entity_ids, source_id, interpretation_id,
            occurred_at, fields
        )
        values ($1, $2, $3, $4, $5, $6, $7)
        returning
            id,
            user_id as "user_id: UserId",
            event_type,
            entity_ids,
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            occurred_at,
            fields as "fields: TextJson<Value>",
            created_at
        "#,
        new.user_id as UserId,
        new.event_type,
        new.entity_ids,
        new.source_id as Option<SourceId>,
        new.interpretation_id as Option<InterpretationId>,
        new.occurred_at,
        TextJson(new.fields) as TextJson<&Value>,
    )
    .fetch_one(db)
    .await
}

pub struct TimelineFilter<'a> {
    pub event_type: Option<&'a str>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

pub async fn list(
    user_id: UserId,
    filter: &TimelineFilter<'_>,
    limit: i64,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Vec<TimelineEventRow>> {
    sqlx::query_as!(
        TimelineEventRow,
        r#"
        select
            id,
            user_id as "user_id: UserId",
            event_type,
            entity_ids,
            source_id as "source_id: SourceId",
            interpretation_id as "interpretation_id: InterpretationId",
            occurred_at,
            fields as "fields: TextJson<Value>",
            created_at
        from timeline_events
        where user_id = $1
            and ($2::text is null or event_type = $2)
            and ($3::timestamptz is null or occurred_at >= $3)
            and ($4::timestamptz is null or occurred_at <= $4)
        order by occurred_at desc
        limit $5
        "#,
        user_id as UserId,
        filter.event_type,
        filter.from,
        filter.to,
        limit,
    )
    .fetch_all(db)
    .await
}
