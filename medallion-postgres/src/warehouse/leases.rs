use sqlx::PgExecutor;

/// Takes or extends a lease for `holder`.
///
/// The lease is taken when it is free, expired or already held by `holder`. Returns `false` when
/// another holder owns an unexpired lease.
pub async fn try_acquire_lease<'c, E>(
    executor: E,
    stage: &str,
    lease_key: &str,
    holder: &str,
    ttl_ms: i64,
) -> sqlx::Result<bool>
where
    E: PgExecutor<'c>,
{
    let acquired: Option<String> = sqlx::query_scalar(
        r#"
        insert into leases (stage, lease_key, holder, expires_at)
        values ($1, $2, $3, now() + make_interval(secs => $4::double precision / 1000))
        on conflict (stage, lease_key) do update
        set holder = excluded.holder, expires_at = excluded.expires_at
        where leases.holder = excluded.holder or leases.expires_at <= now()
        returning holder
        "#,
    )
    .bind(stage)
    .bind(lease_key)
    .bind(holder)
    .bind(ttl_ms)
    .fetch_optional(executor)
    .await?;

    Ok(acquired.is_some())
}

pub async fn release_lease<'c, E>(
    executor: E,
    stage: &str,
    lease_key: &str,
    holder: &str,
) -> sqlx::Result<()>
where
    E: PgExecutor<'c>,
{
    sqlx::query(
        r#"
        delete from leases where stage = $1 and lease_key = $2 and holder = $3
        "#,
    )
    .bind(stage)
    .bind(lease_key)
    .bind(holder)
    .execute(executor)
    .await?;

    Ok(())
}
