//! HTTP client for the upstream odds provider (The Odds API v4).
//!
//! The provider is metered, so every response's quota headers are logged and
//! failures are classified so callers can pick the right retry policy:
//! rate limits back off long, transient faults back off short, anything else
//! aborts the unit of work without retry.

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::util::env::{env_opt, env_parse, env_req};

const DEFAULT_BASE_URL: &str = "https://api.the-odds-api.com/v4";
const QUOTA_WARN_THRESHOLD: i64 = 1_000;

#[derive(Debug, Error)]
pub enum OddsApiError {
    /// 429 from the provider; retry with a long backoff.
    #[error("upstream rate limit exceeded")]
    RateLimited,
    /// Timeout, connection failure or 5xx; retry with a short backoff.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Other 4xx or a malformed payload; do not retry.
    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl OddsApiError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, OddsApiError::Fatal(_))
    }
}

#[derive(Debug, Clone)]
pub struct OddsApiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout_secs: u64,
    pub regions: String,
    pub markets: String,
    pub odds_format: String,
}

impl OddsApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            api_key: env_req("ODDS_API_KEY")?,
            base_url: env_opt("ODDS_API_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.into()),
            timeout_secs: env_parse("ODDS_API_TIMEOUT_SECS", 15u64),
            regions: env_opt("ODDS_API_REGIONS").unwrap_or_else(|| "us".into()),
            markets: env_opt("ODDS_API_MARKETS").unwrap_or_else(|| "h2h,spreads,totals".into()),
            odds_format: env_opt("ODDS_API_FORMAT").unwrap_or_else(|| "american".into()),
        })
    }
}

// ---------------------------------------------------------------------------
// Upstream payload schema. Parsed strictly at the boundary so malformed
// payloads fail here (Fatal) instead of leaking nulls into entities.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SportInfo {
    pub key: String,
    pub group: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub active: bool,
    #[serde(default)]
    pub has_outrights: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OddsEvent {
    pub id: String,
    pub sport_key: String,
    pub commence_time: DateTime<Utc>,
    pub home_team: String,
    pub away_team: String,
    #[serde(default)]
    pub bookmakers: Vec<BookmakerOdds>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookmakerOdds {
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<Market>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub point: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoredEvent {
    pub id: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub scores: Option<Vec<ScoreEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreEntry {
    pub name: String,
    #[serde(default)]
    pub score: Option<String>,
}

#[derive(Clone)]
pub struct OddsApiClient {
    cfg: OddsApiConfig,
    http: Client,
}

impl OddsApiClient {
    pub fn new(cfg: OddsApiConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("betstack-sync/0.1")
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self { cfg, http })
    }

    /// List of sports/leagues. Free endpoint, doesn't count against the quota.
    pub async fn fetch_sports(&self, all: bool) -> Result<Vec<SportInfo>, OddsApiError> {
        let mut params: Vec<(&str, String)> = vec![("apiKey", self.cfg.api_key.clone())];
        if all {
            params.push(("all", "true".into()));
        }
        self.get_json("/sports", &params, "GET /sports").await
    }

    /// Odds for one league: events with nested bookmaker/market/outcome arrays.
    pub async fn fetch_odds(&self, sport_key: &str) -> Result<Vec<OddsEvent>, OddsApiError> {
        let params: Vec<(&str, String)> = vec![
            ("apiKey", self.cfg.api_key.clone()),
            ("regions", self.cfg.regions.clone()),
            ("markets", self.cfg.markets.clone()),
            ("oddsFormat", self.cfg.odds_format.clone()),
        ];
        let path = format!("/sports/{}/odds", urlencoding::encode(sport_key));
        let endpoint = format!("GET /sports/{sport_key}/odds");
        self.get_json(&path, &params, &endpoint).await
    }

    /// Scores for one league, covering games up to `days_from` days back.
    pub async fn fetch_scores(
        &self,
        sport_key: &str,
        days_from: u32,
    ) -> Result<Vec<ScoredEvent>, OddsApiError> {
        let params: Vec<(&str, String)> = vec![
            ("apiKey", self.cfg.api_key.clone()),
            ("daysFrom", days_from.to_string()),
        ];
        let path = format!("/sports/{}/scores", urlencoding::encode(sport_key));
        let endpoint = format!("GET /sports/{sport_key}/scores");
        self.get_json(&path, &params, &endpoint).await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
        endpoint: &str,
    ) -> Result<T, OddsApiError> {
        let url = format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path);
        let response = self
            .http
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    OddsApiError::Transient(e.to_string())
                } else {
                    OddsApiError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        self.log_quota_headers(&response, endpoint);

        if status.as_u16() == 429 {
            return Err(OddsApiError::RateLimited);
        }
        if status.is_server_error() {
            return Err(OddsApiError::Transient(format!(
                "{endpoint}: server error {status}"
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OddsApiError::Fatal(format!(
                "{endpoint}: client error {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| OddsApiError::Fatal(format!("{endpoint}: malformed payload: {e}")))
    }

    fn log_quota_headers(&self, response: &reqwest::Response, endpoint: &str) {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        };
        let used = header("x-requests-used");
        let remaining = header("x-requests-remaining");
        let cost = header("x-requests-last");
        info!(endpoint, ?used, ?remaining, ?cost, "provider quota");

        if let Some(rem) = remaining.as_deref().and_then(|s| s.parse::<i64>().ok()) {
            if rem < QUOTA_WARN_THRESHOLD {
                warn!(endpoint, remaining = rem, "provider quota running low");
            }
        }
    }
}
