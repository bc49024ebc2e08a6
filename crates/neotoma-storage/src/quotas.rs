//! Per-tenant interpretation quota (`§4.3`). A tenant with no row here gets
//! the column default applied by `fetch_or_default`, not a separate constant,
//! so the default lives in one place (the migration).

use neotoma_models::UserId;
use sqlx::PgExecutor;

const DEFAULT_MAX_PER_DAY: i32 = 1000;

pub async fn max_interpretations_per_day(
    user_id: UserId,
    db: impl PgExecutor<'_>,
) -> sqlx::Result<i32> {
    let row = sqlx::query!(
        r#"select max_interpretations_per_day from interpretation_quotas where user_id = $1"#,
        user_id as UserId,
    )
    .fetch_optional(db)
    .await?;
    Ok(row.map(|r| r.max_interpretations_per_day).unwrap_or(DEFAULT_MAX_PER_DAY))
}
