//! Durable usage ledgers.
//!
//! Two ledgers live here: `api_usage_logs` counts our own requests against the
//! upstream provider (one row per league per day), and `client_api_usages`
//! aggregates downstream client traffic reconciled from edge KV counters (one
//! row per key per day per hour). Both are pruned on a retention window.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::Row;
use tracing::info;

use crate::database_ops::db::Db;

/// Count one provider request for `league_key` on `date`.
pub async fn increment_provider_usage(db: &Db, date: NaiveDate, league_key: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO api_usage_logs (date, league_key, request_count, created_at, updated_at)
         VALUES ($1, $2, 1, now(), now())
         ON CONFLICT (date, league_key) DO UPDATE
         SET request_count = api_usage_logs.request_count + 1,
             updated_at = now()",
    )
    .persistent(false)
    .bind(date)
    .bind(league_key)
    .execute(&db.pool)
    .await?;
    Ok(())
}

pub async fn provider_usage_on(db: &Db, date: NaiveDate) -> Result<i64> {
    let total: Option<i64> =
        sqlx::query_scalar("SELECT SUM(request_count)::bigint FROM api_usage_logs WHERE date = $1")
            .persistent(false)
            .bind(date)
            .fetch_one(&db.pool)
            .await?;
    Ok(total.unwrap_or(0))
}

/// Total provider requests in the calendar month containing `date`.
pub async fn provider_usage_in_month(db: &Db, date: NaiveDate) -> Result<i64> {
    let total: Option<i64> = sqlx::query_scalar(
        "SELECT SUM(request_count)::bigint FROM api_usage_logs
         WHERE date_trunc('month', date) = date_trunc('month', $1::date)",
    )
    .persistent(false)
    .bind(date)
    .fetch_one(&db.pool)
    .await?;
    Ok(total.unwrap_or(0))
}

/// Per-league provider request counts for one day, busiest first.
pub async fn provider_usage_by_league(
    db: &Db,
    date: NaiveDate,
) -> Result<Vec<(String, i64)>> {
    let rows = sqlx::query(
        "SELECT league_key, request_count FROM api_usage_logs
         WHERE date = $1 ORDER BY request_count DESC, league_key",
    )
    .persistent(false)
    .bind(date)
    .fetch_all(&db.pool)
    .await?;
    Ok(rows
        .iter()
        .map(|r| (r.get::<String, _>("league_key"), r.get::<i64, _>("request_count")))
        .collect())
}

/// Fold one reconciled edge counter into the per-key hourly ledger.
/// Re-running the reconciler for a counter that survived a partial failure
/// adds again, which is the accepted advisory-accounting tradeoff.
pub async fn record_client_usage(
    db: &Db,
    api_key: &str,
    email: &str,
    date: NaiveDate,
    hour: i32,
    requests: i64,
    rejected: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO client_api_usages
             (api_key, email, date, hour, request_count, rejected_count, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, now(), now())
         ON CONFLICT (api_key, date, hour) DO UPDATE
         SET request_count = client_api_usages.request_count + EXCLUDED.request_count,
             rejected_count = client_api_usages.rejected_count + EXCLUDED.rejected_count,
             email = EXCLUDED.email,
             updated_at = now()",
    )
    .persistent(false)
    .bind(api_key)
    .bind(email)
    .bind(date)
    .bind(hour)
    .bind(requests)
    .bind(rejected)
    .execute(&db.pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClientUsageToday {
    pub requests: i64,
    pub rejected: i64,
    pub distinct_keys: i64,
}

pub async fn client_usage_on(db: &Db, date: NaiveDate) -> Result<ClientUsageToday> {
    let row = sqlx::query(
        "SELECT COALESCE(SUM(request_count), 0)::bigint AS requests,
                COALESCE(SUM(rejected_count), 0)::bigint AS rejected,
                COUNT(DISTINCT api_key)::bigint AS distinct_keys
         FROM client_api_usages WHERE date = $1",
    )
    .persistent(false)
    .bind(date)
    .fetch_one(&db.pool)
    .await?;
    Ok(ClientUsageToday {
        requests: row.get("requests"),
        rejected: row.get("rejected"),
        distinct_keys: row.get("distinct_keys"),
    })
}

/// Drop ledger rows older than the retention window. Returns rows deleted.
pub async fn prune_usage(db: &Db, now: DateTime<Utc>, retention_days: i64) -> Result<u64> {
    let cutoff = now.date_naive() - chrono::Duration::days(retention_days);
    let client = sqlx::query("DELETE FROM client_api_usages WHERE date < $1")
        .persistent(false)
        .bind(cutoff)
        .execute(&db.pool)
        .await?
        .rows_affected();
    let provider = sqlx::query("DELETE FROM api_usage_logs WHERE date < $1")
        .persistent(false)
        .bind(cutoff)
        .execute(&db.pool)
        .await?
        .rows_affected();
    if client + provider > 0 {
        info!(client, provider, %cutoff, "pruned usage ledgers");
    }
    Ok(client + provider)
}
