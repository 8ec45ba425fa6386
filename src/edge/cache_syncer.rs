//! Propagates database state to the edge KV cache.
//!
//! Propagation is two-phase per endpoint: first a cheap freshness signal
//! (max `updated_at`) is compared against the endpoint's publish cursor in
//! KV, then the full body is materialized and written only when the signal
//! says something changed. Cursors only move forward, so a replayed or
//! delayed run can never clobber a newer publish with older data. A dataset
//! that empties out (rows aging past an endpoint's time-window filter) yields
//! no signal, so emptiness is detected against the cached body instead: a
//! non-empty body gets one empty publish, and from then on the endpoint
//! stays quiet.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};

use crate::database_ops::db::Db;
use crate::edge::endpoints::{self, CacheTier, Endpoint};
use crate::edge::kv::KvStore;

/// Whether the endpoint needs a publish. No cursor means it has never been
/// published (empty set included); a signal strictly newer than the cursor
/// triggers one. No signal with a cursor means the backing set is empty now:
/// publish once while the cached body still holds stale rows (or is gone),
/// then stay quiet once the empty body is out.
pub fn should_publish(
    signal: Option<DateTime<Utc>>,
    cursor: Option<DateTime<Utc>>,
    cached_body: Option<&str>,
) -> bool {
    match (signal, cursor) {
        (_, None) => true,
        (None, Some(_)) => cached_body.map_or(true, |body| !body_is_empty(body)),
        (Some(s), Some(c)) => s > c,
    }
}

fn body_is_empty(raw: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(raw)
        .map(|v| v.as_array().map_or(false, |a| a.is_empty()))
        .unwrap_or(false)
}

/// The cursor value to store after a publish. Monotonic: never moves
/// backwards even if the observed signal is older than the stored cursor.
pub fn next_cursor(
    signal: Option<DateTime<Utc>>,
    cursor: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let candidate = signal.unwrap_or(now);
    match cursor {
        Some(c) if c > candidate => c,
        _ => candidate,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PropagationStats {
    pub checked: usize,
    pub published: usize,
    pub skipped: usize,
    pub keys_mirrored: usize,
}

pub struct CacheSyncer {
    db: Db,
    cache_kv: Arc<dyn KvStore>,
    keys_kv: Arc<dyn KvStore>,
    endpoints: Vec<Endpoint>,
}

impl CacheSyncer {
    pub fn new(
        db: Db,
        cache_kv: Arc<dyn KvStore>,
        keys_kv: Arc<dyn KvStore>,
        league_keys: &[String],
    ) -> Self {
        Self {
            db,
            cache_kv,
            keys_kv,
            endpoints: endpoints::registry(league_keys),
        }
    }

    /// Check every endpoint in the tier and publish the stale ones. A failed
    /// endpoint is logged and skipped so the rest of the tier still runs.
    pub async fn run_tier(&self, tier: CacheTier, now: DateTime<Utc>) -> Result<PropagationStats> {
        let mut stats = PropagationStats::default();
        for endpoint in self.endpoints.iter().filter(|e| e.tier == tier) {
            stats.checked += 1;
            match self.propagate_endpoint(&endpoint.name, now).await {
                Ok(true) => stats.published += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(endpoint = %endpoint.name, error = %e, "propagation failed");
                    stats.skipped += 1;
                }
            }
        }
        info!(
            ?tier,
            checked = stats.checked,
            published = stats.published,
            skipped = stats.skipped,
            "cache propagation"
        );
        Ok(stats)
    }

    async fn propagate_endpoint(&self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        let signal = endpoints::freshness_signal(&self.db, name).await?;
        let cursor = self
            .cache_kv
            .get(&endpoints::cursor_key(name))
            .await?
            .and_then(|raw| parse_cursor(&raw));

        // The dataset emptying out is only visible against what the edge
        // currently holds, so fetch the cached body just for that case.
        let cached = if signal.is_none() && cursor.is_some() {
            self.cache_kv.get(&endpoints::cache_key(name)).await?
        } else {
            None
        };

        if !should_publish(signal, cursor, cached.as_deref()) {
            return Ok(false);
        }

        let body = endpoints::materialize(&self.db, name).await?;
        let new_cursor = next_cursor(signal, cursor, now);

        // Body and cursor go out as one staged batch. The backend applies it
        // non-transactionally with the body entry first, so a partial failure
        // leaves a stale cursor and costs one redundant republish, never a
        // cursor pointing at data that was not written.
        let staged = vec![
            (endpoints::cache_key(name), body.to_string()),
            (
                endpoints::cursor_key(name),
                new_cursor.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ];
        self.cache_kv.bulk_put(&staged).await?;
        info!(endpoint = name, cursor = %new_cursor, "published");
        Ok(true)
    }

    /// Mirror active api-key records into the key-validity namespace the edge
    /// worker authenticates against. Rows are staged from one query and then
    /// written out; revoked keys are overwritten in place with their revoked
    /// status rather than deleted, so the edge can tell "revoked" from
    /// "never existed".
    pub async fn mirror_api_keys(&self) -> Result<usize> {
        let rows = sqlx::query(
            "SELECT api_key, email, status FROM client_api_keys ORDER BY api_key",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;

        let staged: Vec<(String, String)> = rows
            .iter()
            .map(|row| {
                let api_key: String = row.get("api_key");
                let record = json!({
                    "status": row.get::<String, _>("status"),
                    "email": row.get::<String, _>("email"),
                });
                (api_key, record.to_string())
            })
            .collect();

        for batch in staged.chunks(100) {
            self.keys_kv.bulk_put(batch).await?;
        }
        info!(mirrored = staged.len(), "api keys mirrored");
        Ok(staged.len())
    }
}

fn parse_cursor(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn first_publish_happens_even_for_empty_sets() {
        assert!(should_publish(None, None, None));
        assert!(should_publish(Some(t(0)), None, None));
    }

    #[test]
    fn empty_set_is_published_only_once() {
        // After the empty publish the cursor exists and the cached body is
        // the empty array; nothing further to publish.
        assert!(!should_publish(None, Some(t(0)), Some("[]")));
    }

    #[test]
    fn dataset_emptying_out_republishes_once() {
        // Rows aged past the endpoint's window filter: no signal, but the
        // edge still serves the last non-empty body. That stale body gets
        // one empty publish; afterwards the endpoint is quiet.
        let stale = r#"[{"event_id":"evt-1","league":"basketball_nba"}]"#;
        assert!(should_publish(None, Some(t(0)), Some(stale)));
        assert!(!should_publish(None, Some(t(0)), Some("[]")));
    }

    #[test]
    fn missing_cached_body_is_restored() {
        assert!(should_publish(None, Some(t(0)), None));
    }

    #[test]
    fn publishes_only_on_strictly_newer_signal() {
        assert!(should_publish(Some(t(10)), Some(t(5)), None));
        assert!(!should_publish(Some(t(5)), Some(t(5)), None));
        assert!(!should_publish(Some(t(1)), Some(t(5)), None));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        assert_eq!(next_cursor(Some(t(10)), Some(t(5)), t(20)), t(10));
        assert_eq!(next_cursor(Some(t(3)), Some(t(5)), t(20)), t(5));
        // Empty set: cursor lands on the publish time.
        assert_eq!(next_cursor(None, None, t(20)), t(20));
    }

    #[test]
    fn cursor_round_trips_through_kv_text() {
        let cursor = t(42);
        let raw = cursor.to_rfc3339_opts(SecondsFormat::Micros, true);
        assert_eq!(parse_cursor(&raw), Some(cursor));
        assert_eq!(parse_cursor("garbage"), None);
    }
}
