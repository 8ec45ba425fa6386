//! Per-api-key rate limiting over edge KV.
//!
//! Two layers, checked in order: a short cooldown between calls and a daily
//! request quota. Counters live in KV with TTLs that make them self-cleaning,
//! and the increments are read-modify-write with no transaction. Under
//! concurrent traffic two requests can both pass with the same counter value,
//! so the limiter is advisory and slightly permissive.

pub mod usage;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveTime, Utc};

use crate::edge::kv::KvStore;
use crate::util::env::env_parse;

pub const DEFAULT_COOLDOWN_SECS: i64 = 58;
pub const DEFAULT_DAILY_LIMIT: i64 = 1000;

/// Uniform outcome for both layers. `retry_after_secs` is set only when the
/// request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<i64>,
}

impl RateDecision {
    /// Headers every response carries regardless of outcome, plus
    /// Retry-After on denial.
    pub fn headers(&self, limit: i64) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("X-RateLimit-Limit", limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.max(0).to_string()),
            ("X-RateLimit-Reset", self.reset_at.timestamp().to_string()),
        ];
        if let Some(secs) = self.retry_after_secs {
            headers.push(("Retry-After", secs.to_string()));
        }
        headers
    }
}

pub fn cooldown_key(api_key: &str) -> String {
    format!("lastcall:{api_key}")
}

pub fn quota_key(api_key: &str, now: DateTime<Utc>) -> String {
    format!("ratelimit:{}:{}", api_key, now.format("%Y-%m-%d"))
}

/// Hourly served-request counter, drained later by the usage reconciler.
pub fn usage_key(api_key: &str, now: DateTime<Utc>) -> String {
    format!("usage:{}:{}", api_key, now.format("%Y-%m-%dT%H"))
}

/// Hourly rejection counter, drained later by the usage reconciler.
pub fn rejection_key(api_key: &str, now: DateTime<Utc>) -> String {
    format!("abuse:{}:{}", api_key, now.format("%Y-%m-%dT%H"))
}

const COUNTER_TTL_SECS: u64 = 48 * 3600;

/// Next UTC midnight after `now`; daily counters expire there.
pub fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now + Duration::days(1))
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc()
}

pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    cooldown_secs: i64,
    daily_limit: i64,
}

impl RateLimiter {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            cooldown_secs: env_parse("RATE_LIMIT_COOLDOWN_SECS", DEFAULT_COOLDOWN_SECS),
            daily_limit: env_parse("RATE_LIMIT_DAILY", DEFAULT_DAILY_LIMIT),
        }
    }

    pub fn with_limits(kv: Arc<dyn KvStore>, cooldown_secs: i64, daily_limit: i64) -> Self {
        Self { kv, cooldown_secs, daily_limit }
    }

    pub fn daily_limit(&self) -> i64 {
        self.daily_limit
    }

    /// Cooldown layer: at most one call per key per cooldown window. An
    /// allowed call stamps the window; a denied one leaves the stamp alone
    /// so the wait is measured from the last successful call.
    pub async fn check_cooldown(&self, api_key: &str, now: DateTime<Utc>) -> Result<RateDecision> {
        let key = cooldown_key(api_key);
        if let Some(raw) = self.kv.get(&key).await? {
            if let Some(last) = parse_timestamp(&raw) {
                let elapsed = (now - last).num_seconds();
                if elapsed < self.cooldown_secs {
                    self.record_rejection(api_key, now).await?;
                    let reset_at = last + Duration::seconds(self.cooldown_secs);
                    return Ok(RateDecision {
                        allowed: false,
                        remaining: 0,
                        reset_at,
                        retry_after_secs: Some(self.cooldown_secs - elapsed),
                    });
                }
            }
        }
        self.kv
            .put(&key, &now.timestamp().to_string(), Some(self.cooldown_secs.max(0) as u64))
            .await?;
        self.bump_counter(&usage_key(api_key, now)).await?;
        Ok(RateDecision {
            allowed: true,
            remaining: 1,
            reset_at: now + Duration::seconds(self.cooldown_secs),
            retry_after_secs: None,
        })
    }

    /// Daily quota layer. Consumes one unit when allowed.
    pub async fn check_daily_quota(
        &self,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<RateDecision> {
        let key = quota_key(api_key, now);
        let reset_at = next_utc_midnight(now);
        let count = self.read_count(&key).await?;

        if count >= self.daily_limit {
            self.record_rejection(api_key, now).await?;
            return Ok(RateDecision {
                allowed: false,
                remaining: 0,
                reset_at,
                retry_after_secs: Some((reset_at - now).num_seconds().max(0)),
            });
        }

        let ttl = (reset_at - now).num_seconds().max(60) as u64;
        self.kv.put(&key, &(count + 1).to_string(), Some(ttl)).await?;
        Ok(RateDecision {
            allowed: true,
            remaining: self.daily_limit - count - 1,
            reset_at,
            retry_after_secs: None,
        })
    }

    /// Quota standing without consuming anything, for the ops surface.
    pub async fn current_status(&self, api_key: &str, now: DateTime<Utc>) -> Result<RateDecision> {
        let count = self.read_count(&quota_key(api_key, now)).await?;
        let reset_at = next_utc_midnight(now);
        Ok(RateDecision {
            allowed: count < self.daily_limit,
            remaining: (self.daily_limit - count).max(0),
            reset_at,
            retry_after_secs: None,
        })
    }

    async fn record_rejection(&self, api_key: &str, now: DateTime<Utc>) -> Result<()> {
        self.bump_counter(&rejection_key(api_key, now)).await
    }

    /// Bump an hourly counter. Same advisory read-modify-write as the quota
    /// counter; the reconciler drains these into the durable ledger.
    async fn bump_counter(&self, key: &str) -> Result<()> {
        let count = self.read_count(key).await?;
        self.kv
            .put(key, &(count + 1).to_string(), Some(COUNTER_TTL_SECS))
            .await
    }

    async fn read_count(&self, key: &str) -> Result<i64> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0))
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::kv::MemoryKv;
    use chrono::TimeZone;

    fn limiter(kv: Arc<MemoryKv>) -> RateLimiter {
        RateLimiter::with_limits(kv, DEFAULT_COOLDOWN_SECS, 3)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_770_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn cooldown_denies_inside_window_and_allows_after() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());

        let first = rl.check_cooldown("abc123", at(0)).await.unwrap();
        assert!(first.allowed);

        let again = rl.check_cooldown("abc123", at(10)).await.unwrap();
        assert!(!again.allowed);
        assert_eq!(again.retry_after_secs, Some(48));
        assert_eq!(again.reset_at, at(58));

        let later = rl.check_cooldown("abc123", at(59)).await.unwrap();
        assert!(later.allowed);
    }

    #[tokio::test]
    async fn denied_cooldown_does_not_restamp_the_window() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());

        rl.check_cooldown("abc123", at(0)).await.unwrap();
        rl.check_cooldown("abc123", at(30)).await.unwrap();
        // Window still anchors at t=0, so t=58 clears it.
        let cleared = rl.check_cooldown("abc123", at(58)).await.unwrap();
        assert!(cleared.allowed);
    }

    #[tokio::test]
    async fn served_calls_bump_the_hourly_usage_counter() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());

        rl.check_cooldown("abc123", at(0)).await.unwrap();
        rl.check_cooldown("abc123", at(60)).await.unwrap();

        let counter = kv.get(&usage_key("abc123", at(60))).await.unwrap();
        assert_eq!(counter.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn denials_bump_the_hourly_rejection_counter() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());

        rl.check_cooldown("abc123", at(0)).await.unwrap();
        rl.check_cooldown("abc123", at(10)).await.unwrap();
        rl.check_cooldown("abc123", at(20)).await.unwrap();

        let counter = kv.get(&rejection_key("abc123", at(20))).await.unwrap();
        assert_eq!(counter.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn daily_quota_counts_down_then_denies() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());
        let now = at(0);

        for expected_remaining in [2, 1, 0] {
            let d = rl.check_daily_quota("abc123", now).await.unwrap();
            assert!(d.allowed);
            assert_eq!(d.remaining, expected_remaining);
        }

        let denied = rl.check_daily_quota("abc123", now).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, next_utc_midnight(now));
        assert!(denied.retry_after_secs.unwrap() > 0);
    }

    #[tokio::test]
    async fn quota_counters_are_per_key_and_per_day() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());
        let now = at(0);

        rl.check_daily_quota("alice", now).await.unwrap();
        let bob = rl.check_daily_quota("bob", now).await.unwrap();
        assert_eq!(bob.remaining, 2);

        // A new day starts a fresh counter key.
        let tomorrow = now + Duration::days(1);
        assert_ne!(quota_key("alice", now), quota_key("alice", tomorrow));
    }

    #[tokio::test]
    async fn status_peek_does_not_consume_quota() {
        let kv = Arc::new(MemoryKv::new());
        let rl = limiter(kv.clone());
        let now = at(0);

        rl.check_daily_quota("abc123", now).await.unwrap();
        let status = rl.current_status("abc123", now).await.unwrap();
        assert_eq!(status.remaining, 2);
        let status_again = rl.current_status("abc123", now).await.unwrap();
        assert_eq!(status_again.remaining, 2);
    }

    #[test]
    fn headers_include_retry_after_only_on_denial() {
        let allowed = RateDecision {
            allowed: true,
            remaining: 5,
            reset_at: at(100),
            retry_after_secs: None,
        };
        let names: Vec<_> = allowed.headers(1000).iter().map(|(n, _)| *n).collect();
        assert_eq!(
            names,
            vec!["X-RateLimit-Limit", "X-RateLimit-Remaining", "X-RateLimit-Reset"]
        );

        let denied = RateDecision {
            allowed: false,
            remaining: 0,
            reset_at: at(100),
            retry_after_secs: Some(42),
        };
        assert!(denied.headers(1000).iter().any(|(n, v)| *n == "Retry-After" && v == "42"));
    }

    #[test]
    fn midnight_rollover() {
        let now = Utc.with_ymd_and_hms(2026, 8, 23, 17, 45, 0).unwrap();
        assert_eq!(
            next_utc_midnight(now),
            Utc.with_ymd_and_hms(2026, 8, 24, 0, 0, 0).unwrap()
        );
    }
}
