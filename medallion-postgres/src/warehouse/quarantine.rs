use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `quarantine`.
#[derive(Debug, Clone, FromRow)]
pub struct QuarantineRow {
    pub stage: String,
    pub scope: String,
    pub record_ref: String,
    pub reason: String,
    pub detail: String,
    pub payload: serde_json::Value,
    pub quarantined_at: DateTime<Utc>,
}

/// Quarantines a record unless it already is. The first quarantine of a record is kept.
pub async fn insert_quarantined_record<'c, E>(
    executor: E,
    stage: &str,
    scope: &str,
    record_ref: &str,
    reason: &str,
    detail: &str,
    payload: &serde_json::Value,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into quarantine (stage, scope, record_ref, reason, detail, payload)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (stage, scope, record_ref) do nothing
        "#,
    )
    .bind(stage)
    .bind(scope)
    .bind(record_ref)
    .bind(reason)
    .bind(detail)
    .bind(payload)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_quarantined_records<'c, E>(executor: E) -> sqlx::Result<Vec<QuarantineRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, QuarantineRow>(
        r#"
        select stage, scope, record_ref, reason, detail, payload, quarantined_at
        from quarantine
        order by stage, scope, record_ref
        "#,
    )
    .fetch_all(executor)
    .await
}
