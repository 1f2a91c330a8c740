use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `conformed_records`.
#[derive(Debug, Clone, FromRow)]
pub struct ConformedRecordRow {
    pub entity: String,
    pub business_key: String,
    pub attributes: serde_json::Value,
    pub version_commit_timestamp: DateTime<Utc>,
    pub version_offset: i64,
    pub active: bool,
}

pub async fn get_merge_watermark<'c, E>(executor: E, entity: &str) -> sqlx::Result<Option<i64>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        select watermark from merge_watermarks where entity = $1
        "#,
    )
    .bind(entity)
    .fetch_optional(executor)
    .await
}

/// Raises the watermark of `entity`, never lowering it.
pub async fn raise_merge_watermark<'c, E>(
    executor: E,
    entity: &str,
    watermark: i64,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into merge_watermarks (entity, watermark)
        values ($1, $2)
        on conflict (entity) do update
        set watermark = greatest(merge_watermarks.watermark, excluded.watermark)
        "#,
    )
    .bind(entity)
    .bind(watermark)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn upsert_conformed_record<'c, E>(
    executor: E,
    row: &ConformedRecordRow,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into conformed_records (
            entity, business_key, attributes, version_commit_timestamp, version_offset, active
        )
        values ($1, $2, $3, $4, $5, $6)
        on conflict (entity, business_key) do update
        set attributes = excluded.attributes,
            version_commit_timestamp = excluded.version_commit_timestamp,
            version_offset = excluded.version_offset,
            active = excluded.active
        "#,
    )
    .bind(&row.entity)
    .bind(&row.business_key)
    .bind(&row.attributes)
    .bind(row.version_commit_timestamp)
    .bind(row.version_offset)
    .bind(row.active)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_conformed_records_for<'c, E>(
    executor: E,
    entity: &str,
    business_keys: &[String],
) -> sqlx::Result<Vec<ConformedRecordRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, ConformedRecordRow>(
        r#"
        select entity, business_key, attributes, version_commit_timestamp, version_offset, active
        from conformed_records
        where entity = $1 and business_key = any($2)
        "#,
    )
    .bind(entity)
    .bind(business_keys)
    .fetch_all(executor)
    .await
}

pub async fn get_conformed_records<'c, E>(
    executor: E,
    entity: &str,
) -> sqlx::Result<Vec<ConformedRecordRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, ConformedRecordRow>(
        r#"
        select entity, business_key, attributes, version_commit_timestamp, version_offset, active
        from conformed_records
        where entity = $1
        order by business_key
        "#,
    )
    .bind(entity)
    .fetch_all(executor)
    .await
}
