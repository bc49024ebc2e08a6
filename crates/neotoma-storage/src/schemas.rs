//! Persistence for the schema registry (`§4.2`).

use chrono::{DateTime, Utc};
use neotoma_models::schema::SchemaDefinition;
use neotoma_models::{EntityType, SchemaVersion};
use sqlx::PgExecutor;

use crate::text_json::TextJson;

#[derive(Debug)]
pub struct SchemaRow {
    pub entity_type: String,
    pub schema_major: i32,
    pub schema_minor: i32,
    pub definition: TextJson<SchemaDefinition>,
    pub created_at: DateTime<Utc>,
}

impl SchemaRow {
    pub fn into_definition(self) -> SchemaDefinition {
        self.definition.0
    }
}

pub async fn insert(
    definition: &SchemaDefinition,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<()> {
    sqlx::query!(
        r#"
        insert into schema_definitions (entity_type, schema_major, schema_minor, definition)
        values ($1, $2, $3, $4)
        "#,
        definition.entity_type.as_str(),
        definition.schema_version.major as i32,
        definition.schema_version.minor as i32,
        TextJson(definition) as TextJson<&SchemaDefinition>,
    )
    .execute(db)
    .await?;
    Ok(())
}

/// Returns the highest registered `schema_version` for a type, or `None` if
/// the type has never been registered.
pub async fn get_latest(
    entity_type: &EntityType,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SchemaDefinition>> {
    let row = sqlx::query_as!(
        SchemaRow,
        r#"
        select
            entity_type,
            schema_major,
            schema_minor,
            definition as "definition: TextJson<SchemaDefinition>",
            created_at
        from schema_definitions
        where entity_type = $1
        order by schema_major desc, schema_minor desc
        limit 1
        "#,
        entity_type.as_str(),
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(SchemaRow::into_definition))
}

pub async fn get_version(
    entity_type: &EntityType,
    version: SchemaVersion,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<Option<SchemaDefinition>> {
    let row = sqlx::query_as!(
        SchemaRow,
        r#"
        select
            entity_type,
            schema_major,
            schema_minor,
            definition as "definition: TextJson<SchemaDefinition>",
            created_at
        from schema_definitions
        where entity_type = $1 and schema_major = $2 and schema_minor = $3
        "#,
        entity_type.as_str(),
        version.major as i32,
        version.minor as i32,
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(SchemaRow::into_definition))
}

pub async fn list_entity_types(db: impl PgExecutor<'_>) -> sqlx::Result<Vec<String>> {
    let rows = sqlx::query!(r#"select distinct entity_type from schema_definitions order by 1"#)
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(|r| r.entity_type).collect())
}
