use chrono::{DateTime, Utc};
use sqlx::PgExecutor;
use sqlx::prelude::FromRow;

/// A row of `fact_records`.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct FactRecordRow {
    pub fact_table: String,
    pub natural_key: String,
    pub dimension_keys: serde_json::Value,
    pub measures: serde_json::Value,
    pub event_timestamp: DateTime<Utc>,
}

/// Locks and returns the stored row of a natural key.
pub async fn lock_fact_record<'c, E>(
    executor: E,
    fact_table: &str,
    natural_key: &str,
) -> sqlx::Result<Option<FactRecordRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, FactRecordRow>(
        r#"
        select fact_table, natural_key, dimension_keys, measures, event_timestamp
        from fact_records
        where fact_table = $1 and natural_key = $2
        for update
        "#,
    )
    .bind(fact_table)
    .bind(natural_key)
    .fetch_optional(executor)
    .await
}

pub async fn upsert_fact_record<'c, E>(executor: E, row: &FactRecordRow) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        insert into fact_records (fact_table, natural_key, dimension_keys, measures, event_timestamp)
        values ($1, $2, $3, $4, $5)
        on conflict (fact_table, natural_key) do update
        set dimension_keys = excluded.dimension_keys,
            measures = excluded.measures,
            event_timestamp = excluded.event_timestamp
        "#,
    )
    .bind(&row.fact_table)
    .bind(&row.natural_key)
    .bind(&row.dimension_keys)
    .bind(&row.measures)
    .bind(row.event_timestamp)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn get_fact_records<'c, E>(
    executor: E,
    fact_table: &str,
) -> sqlx::Result<Vec<FactRecordRow>>
where
    E: PgExecutor<'c>,
{
    sqlx::query_as::<_, FactRecordRow>(
        r#"
        select fact_table, natural_key, dimension_keys, measures, event_timestamp
        from fact_records
        where fact_table = $1
        order by natural_key
        "#,
    )
    .bind(fact_table)
    .fetch_all(executor)
    .await
}
