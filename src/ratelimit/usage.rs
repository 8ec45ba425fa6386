//! Reconciles edge usage counters into the durable ledger.
//!
//! The edge worker bumps `usage:{apiKey}:{YYYY-MM-DDTHH}` for served requests
//! and `abuse:{apiKey}:{YYYY-MM-DDTHH}` for rate-limited ones. This job
//! drains those counters into `client_api_usages` and deletes them, leaving
//! KV holding only the hours still being written. Counters for the current
//! hour are left in place until the hour closes.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use itertools::Itertools;
use serde::Deserialize;
use tracing::{info, warn};

use crate::database_ops::db::Db;
use crate::database_ops::usage as ledger;
use crate::edge::kv::KvStore;
use crate::util::env::env_parse;

pub const DEFAULT_RETENTION_DAYS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Served,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterKey {
    pub kind: CounterKind,
    pub api_key: String,
    pub date: NaiveDate,
    pub hour: u32,
}

/// Parse `usage:{apiKey}:{YYYY-MM-DDTHH}` / `abuse:{apiKey}:{YYYY-MM-DDTHH}`.
/// Api keys never contain `:`, so splitting on the last colon isolates the
/// hour stamp. Anything that does not fit the shape is None.
pub fn parse_counter_key(key: &str) -> Option<CounterKey> {
    let (kind, rest) = if let Some(rest) = key.strip_prefix("usage:") {
        (CounterKind::Served, rest)
    } else if let Some(rest) = key.strip_prefix("abuse:") {
        (CounterKind::Rejected, rest)
    } else {
        return None;
    };
    let (api_key, stamp) = rest.rsplit_once(':')?;
    if api_key.is_empty() {
        return None;
    }
    let (date_part, hour_part) = stamp.split_once('T')?;
    let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()?;
    let hour: u32 = hour_part.parse().ok()?;
    if hour > 23 {
        return None;
    }
    Some(CounterKey {
        kind,
        api_key: api_key.to_string(),
        date,
        hour,
    })
}

/// The hour stamp the edge worker uses for the current moment.
pub fn hour_stamp(now: DateTime<Utc>) -> (NaiveDate, u32) {
    (now.date_naive(), now.hour())
}

#[derive(Deserialize)]
struct KeyRecord {
    #[serde(default)]
    email: Option<String>,
}

/// Map a raw key-validity record to the identity stored in the ledger.
/// Current records are JSON with an email; keys provisioned before the JSON
/// format exist as the literal `valid`; a missing record means the counter
/// outlived its key.
pub fn resolve_identity(record: Option<&str>) -> String {
    match record {
        None => "unknown".to_string(),
        Some(raw) if raw.trim() == "valid" => "legacy".to_string(),
        Some(raw) => serde_json::from_str::<KeyRecord>(raw)
            .ok()
            .and_then(|r| r.email)
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileStats {
    pub counters_seen: usize,
    pub counters_folded: usize,
    pub counters_deferred: usize,
    pub counters_malformed: usize,
    pub counters_failed: usize,
    pub rows_pruned: u64,
}

pub struct UsageReconciler {
    db: Db,
    counters_kv: Arc<dyn KvStore>,
    keys_kv: Arc<dyn KvStore>,
    retention_days: i64,
}

impl UsageReconciler {
    pub fn new(db: Db, counters_kv: Arc<dyn KvStore>, keys_kv: Arc<dyn KvStore>) -> Self {
        Self {
            db,
            counters_kv,
            keys_kv,
            retention_days: env_parse("USAGE_RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
        }
    }

    pub async fn run(&self, now: DateTime<Utc>) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let current = hour_stamp(now);

        let mut keys = self.counters_kv.list_keys("usage:").await?;
        keys.extend(self.counters_kv.list_keys("abuse:").await?);

        // List pagination can hand back a key twice across page boundaries.
        let mut reconciled: Vec<String> = Vec::new();
        for raw_key in keys.into_iter().unique() {
            stats.counters_seen += 1;
            let Some(counter) = parse_counter_key(&raw_key) else {
                warn!(key = %raw_key, "malformed usage counter key");
                stats.counters_malformed += 1;
                continue;
            };
            if (counter.date, counter.hour) == current {
                stats.counters_deferred += 1;
                continue;
            }
            match self.fold_counter(&raw_key, &counter).await {
                Ok(()) => {
                    stats.counters_folded += 1;
                    reconciled.push(raw_key);
                }
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "counter reconciliation failed");
                    stats.counters_failed += 1;
                }
            }
        }

        // Delete only what was folded, after all folds. A crash before the
        // delete re-folds those counters next run; the ledger absorbs that as
        // advisory overcounting.
        self.counters_kv.bulk_delete(&reconciled).await?;

        stats.rows_pruned = ledger::prune_usage(&self.db, now, self.retention_days).await?;
        info!(
            seen = stats.counters_seen,
            folded = stats.counters_folded,
            deferred = stats.counters_deferred,
            malformed = stats.counters_malformed,
            failed = stats.counters_failed,
            pruned = stats.rows_pruned,
            "usage reconciled"
        );
        Ok(stats)
    }

    async fn fold_counter(&self, raw_key: &str, counter: &CounterKey) -> Result<()> {
        let count = self
            .counters_kv
            .get(raw_key)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if count == 0 {
            return Ok(());
        }

        let record = self.keys_kv.get(&counter.api_key).await?;
        let email = resolve_identity(record.as_deref());
        let (requests, rejected) = match counter.kind {
            CounterKind::Served => (count, 0),
            CounterKind::Rejected => (0, count),
        };
        ledger::record_client_usage(
            &self.db,
            &counter.api_key,
            &email,
            counter.date,
            counter.hour as i32,
            requests,
            rejected,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_served_and_rejected_counters() {
        let served = parse_counter_key("usage:abc123:2026-08-23T14").unwrap();
        assert_eq!(served.kind, CounterKind::Served);
        assert_eq!(served.api_key, "abc123");
        assert_eq!(served.date, NaiveDate::from_ymd_opt(2026, 8, 23).unwrap());
        assert_eq!(served.hour, 14);

        let rejected = parse_counter_key("abuse:abc123:2026-08-23T00").unwrap();
        assert_eq!(rejected.kind, CounterKind::Rejected);
        assert_eq!(rejected.hour, 0);
    }

    #[test]
    fn rejects_malformed_counter_keys() {
        for key in [
            "usage:abc123",
            "usage::2026-08-23T14",
            "usage:abc123:2026-08-23",
            "usage:abc123:2026-08-23T24",
            "usage:abc123:not-a-date T1",
            "ratelimit:abc123:2026-08-23",
            "lastcall:abc123",
        ] {
            assert!(parse_counter_key(key).is_none(), "{key} should not parse");
        }
    }

    #[test]
    fn identity_fallbacks() {
        assert_eq!(resolve_identity(None), "unknown");
        assert_eq!(resolve_identity(Some("valid")), "legacy");
        assert_eq!(
            resolve_identity(Some(r#"{"status":"active","email":"a@b.com"}"#)),
            "a@b.com"
        );
        assert_eq!(resolve_identity(Some(r#"{"status":"active"}"#)), "unknown");
        assert_eq!(resolve_identity(Some("not json")), "unknown");
    }

    #[test]
    fn hour_stamp_matches_counter_format() {
        let now = DateTime::parse_from_rfc3339("2026-08-23T14:59:59Z")
            .unwrap()
            .with_timezone(&Utc);
        let (date, hour) = hour_stamp(now);
        assert_eq!(date, NaiveDate::from_ymd_opt(2026, 8, 23).unwrap());
        assert_eq!(hour, 14);
    }
}
