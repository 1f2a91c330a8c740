use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `load_cursors`.
#[derive(Debug, Clone, FromRow)]
pub struct LoadCursorRow {
    pub partition_key: String,
    pub last_committed_offset: i64,
}

pub async fn get_load_cursor<'c, E>(
    executor: E,
    partition_key: &str,
) -> sqlx::Result<Option<LoadCursorRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, LoadCursorRow>(
        r#"
        select partition_key, last_committed_offset
        from load_cursors
        where partition_key = $1
        "#,
    )
    .bind(partition_key)
    .fetch_optional(executor)
    .await
}

/// Stores the cursor unless the stored offset is already greater or equal.
///
/// Returns the offset stored after the statement, which is lower than `offset` only when the
/// caller tried to move the cursor backwards.
pub async fn advance_load_cursor<'c, E>(
    executor: E,
    partition_key: &str,
    offset: i64,
) -> sqlx::Result<i64>
where
    E: PgExecutor<'c>,
{
    sqlx::query_scalar(
        r#"
        insert into load_cursors (partition_key, last_committed_offset)
        values ($1, $2)
        on conflict (partition_key) do update
        set last_committed_offset = greatest(load_cursors.last_committed_offset, excluded.last_committed_offset),
            updated_at = now()
        returning last_committed_offset
        "#,
    )
    .bind(partition_key)
    .bind(offset)
    .fetch_one(executor)
    .await
}
