use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `dimension_versions`.
#[derive(Debug, Clone, FromRow)]
pub struct DimensionVersionRow {
    pub surrogate_key: i64,
    pub entity: String,
    pub business_key: String,
    pub attributes: serde_json::Value,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
    pub is_current: bool,
}

/// Reads the last snapshot instant of `entity` and locks the marker row until the transaction
/// ends.
pub async fn lock_snapshot_marker<'c, E>(
    executor: E,
    entity: &str,
) -> sqlx::Result<Option<DateTime<Utc>>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        select last_as_of from snapshot_markers where entity = $1 for update
        "#,
    )
    .bind(entity)
    .fetch_optional(executor)
    .await
}

pub async fn get_snapshot_marker<'c, E>(
    executor: E,
    entity: &str,
) -> sqlx::Result<Option<DateTime<Utc>>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        select last_as_of from snapshot_markers where entity = $1
        "#,
    )
    .bind(entity)
    .fetch_optional(executor)
    .await
}

pub async fn set_snapshot_marker<'c, E>(
    executor: E,
    entity: &str,
    as_of: DateTime<Utc>,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into snapshot_markers (entity, last_as_of)
        values ($1, $2)
        on conflict (entity) do update set last_as_of = excluded.last_as_of
        "#,
    )
    .bind(entity)
    .bind(as_of)
    .execute(executor)
    .await?;

    Ok(())
}

/// Inserts a new current version and returns it with its assigned surrogate key.
pub async fn open_dimension_version<'c, E>(
    executor: E,
    entity: &str,
    business_key: &str,
    attributes: &serde_json::Value,
    valid_from: DateTime<Utc>,
) -> sqlx::Result<DimensionVersionRow>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        insert into dimension_versions (entity, business_key, attributes, valid_from, valid_to, is_current)
        values ($1, $2, $3, $4, null, true)
        returning surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        "#,
    )
    .bind(entity)
    .bind(business_key)
    .bind(attributes)
    .bind(valid_from)
    .fetch_one(executor)
    .await
}

/// Closes a current version. Returns the closed row, or `None` if no current version of
/// `business_key` has `surrogate_key`.
pub async fn close_dimension_version<'c, E>(
    executor: E,
    entity: &str,
    business_key: &str,
    surrogate_key: i64,
    valid_to: DateTime<Utc>,
) -> sqlx::Result<Option<DimensionVersionRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        update dimension_versions
        set valid_to = $4, is_current = false
        where entity = $1 and business_key = $2 and surrogate_key = $3 and is_current
        returning surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        "#,
    )
    .bind(entity)
    .bind(business_key)
    .bind(surrogate_key)
    .bind(valid_to)
    .fetch_optional(executor)
    .await
}

pub async fn get_current_dimension_version<'c, E>(
    executor: E,
    entity: &str,
    business_key: &str,
) -> sqlx::Result<Option<DimensionVersionRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        select surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        from dimension_versions
        where entity = $1 and business_key = $2 and is_current
        "#,
    )
    .bind(entity)
    .bind(business_key)
    .fetch_optional(executor)
    .await
}

pub async fn get_current_dimension_versions<'c, E>(
    executor: E,
    entity: &str,
) -> sqlx::Result<Vec<DimensionVersionRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        select surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        from dimension_versions
        where entity = $1 and is_current
        order by business_key
        "#,
    )
    .bind(entity)
    .fetch_all(executor)
    .await
}

/// Returns the version of `business_key` whose `[valid_from, valid_to)` contains `at`.
pub async fn get_dimension_version_at<'c, E>(
    executor: E,
    entity: &str,
    business_key: &str,
    at: DateTime<Utc>,
) -> sqlx::Result<Option<DimensionVersionRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        select surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        from dimension_versions
        where entity = $1
          and business_key = $2
          and valid_from <= $3
          and (valid_to is null or $3 < valid_to)
        "#,
    )
    .bind(entity)
    .bind(business_key)
    .bind(at)
    .fetch_optional(executor)
    .await
}

pub async fn get_dimension_versions<'c, E>(
    executor: E,
    entity: &str,
) -> sqlx::Result<Vec<DimensionVersionRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, DimensionVersionRow>(
        r#"
        select surrogate_key, entity, business_key, attributes, valid_from, valid_to, is_current
        from dimension_versions
        where entity = $1
        order by business_key, valid_from
        "#,
    )
    .bind(entity)
    .fetch_all(executor)
    .await
}
