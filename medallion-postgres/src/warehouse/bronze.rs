use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `raw_records`.
#[derive(Debug, Clone, FromRow)]
pub struct RawRecordRow {
    pub entity: String,
    pub load_sequence: i64,
    pub partition_key: String,
    pub source_offset: i64,
    pub operation: String,
    pub business_key: String,
    pub before_image: Option<serde_json::Value>,
    pub after_image: Option<serde_json::Value>,
    pub commit_timestamp: DateTime<Utc>,
    pub source_staged_object: String,
}

/// Records `object_name` as loaded. Returns `false` if it already was.
///
/// Run inside the load transaction: a concurrent load of the same object blocks on the primary
/// key until this transaction ends.
pub async fn mark_object_loaded<'c, E>(executor: E, object_name: &str) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    let result = sqlx::query(
        r#"
        insert into loaded_objects (object_name)
        values ($1)
        on conflict (object_name) do nothing
        "#,
    )
    .bind(object_name)
    .execute(executor)
    .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn get_loaded_object_names<'c, E>(executor: E) -> sqlx::Result<Vec<String>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        select object_name from loaded_objects order by object_name
        "#,
    )
    .fetch_all(executor)
    .await
}

pub async fn raw_record_exists<'c, E>(
    executor: E,
    partition_key: &str,
    source_offset: i64,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        select exists (
            select 1 from raw_records where partition_key = $1 and source_offset = $2
        )
        "#,
    )
    .bind(partition_key)
    .bind(source_offset)
    .fetch_one(executor)
    .await
}

/// Allocates the next load sequence of `entity`.
///
/// The sequence row stays locked until the transaction ends, so sequences are gapless: a
/// rolled back load releases the numbers it took.
pub async fn next_load_sequence<'c, E>(executor: E, entity: &str) -> sqlx::Result<i64>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        insert into entity_sequences (entity, last_load_sequence)
        values ($1, 1)
        on conflict (entity) do update
        set last_load_sequence = entity_sequences.last_load_sequence + 1
        returning last_load_sequence
        "#,
    )
    .bind(entity)
    .fetch_one(executor)
    .await
}

pub async fn insert_raw_record<'c, E>(executor: E, row: &RawRecordRow) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into raw_records (
            entity, load_sequence, partition_key, source_offset, operation, business_key,
            before_image, after_image, commit_timestamp, source_staged_object
        )
        values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(&row.entity)
    .bind(row.load_sequence)
    .bind(&row.partition_key)
    .bind(row.source_offset)
    .bind(&row.operation)
    .bind(&row.business_key)
    .bind(&row.before_image)
    .bind(&row.after_image)
    .bind(row.commit_timestamp)
    .bind(&row.source_staged_object)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_raw_records_after<'c, E>(
    executor: E,
    entity: &str,
    after_sequence: i64,
    limit: i64,
) -> sqlx::Result<Vec<RawRecordRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, RawRecordRow>(
        r#"
        select entity, load_sequence, partition_key, source_offset, operation, business_key,
               before_image, after_image, commit_timestamp, source_staged_object
        from raw_records
        where entity = $1 and load_sequence > $2
        order by load_sequence
        limit $3
        "#,
    )
    .bind(entity)
    .bind(after_sequence)
    .bind(limit)
    .fetch_all(executor)
    .await
}
