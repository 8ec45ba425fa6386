//! Key-value storage behind the edge cache and rate-limit counters.
//!
//! Everything that touches KV goes through the `KvStore` trait so the cache
//! syncer, rate limiter and usage reconciler can be exercised against the
//! in-memory store. The production implementation talks to the Cloudflare KV
//! REST API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::Duration;
use tracing::debug;

use crate::util::env::env_req;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    /// Write a value, optionally expiring after `ttl_secs`. Cloudflare
    /// rejects TTLs under 60 seconds, so implementations may round up.
    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// All keys starting with `prefix`, following pagination to the end.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Write several entries in one round trip where the backend supports it.
    /// Not transactional anywhere: a partial failure can apply a prefix of
    /// the batch.
    async fn bulk_put(&self, entries: &[(String, String)]) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value, None).await?;
        }
        Ok(())
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }
}

const MIN_TTL_SECS: u64 = 60;

/// Which KV namespace a client is bound to. The edge worker keeps cached
/// payloads and counters in one namespace and api-key records in another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Cache,
    ApiKeys,
}

pub struct CloudflareKv {
    http: Client,
    base_url: String,
    api_token: String,
}

#[derive(Deserialize)]
struct ListResponse {
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ListResultInfo>,
}

#[derive(Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Deserialize)]
struct ListResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

impl CloudflareKv {
    pub fn from_env(namespace: Namespace) -> Result<Self> {
        let account_id = env_req("CLOUDFLARE_ACCOUNT_ID")?;
        let namespace_id = match namespace {
            Namespace::Cache => env_req("CLOUDFLARE_KV_NAMESPACE_ID")?,
            Namespace::ApiKeys => env_req("CLOUDFLARE_KV_KEYS_NAMESPACE_ID")?,
        };
        let api_token = env_req("CLOUDFLARE_API_TOKEN")?;
        let http = Client::builder()
            .user_agent("betstack-sync/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: format!(
                "https://api.cloudflare.com/client/v4/accounts/{account_id}/storage/kv/namespaces/{namespace_id}"
            ),
            api_token,
        })
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.base_url, urlencoding::encode(key))
    }
}

#[async_trait]
impl KvStore for CloudflareKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let response = self
            .http
            .get(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| format!("kv get {key}"))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("kv get {key}: status {}", response.status());
        }
        Ok(Some(response.text().await?))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut request = self
            .http
            .put(self.value_url(key))
            .bearer_auth(&self.api_token)
            .body(value.to_string());
        if let Some(ttl) = ttl_secs {
            request = request.query(&[("expiration_ttl", ttl.max(MIN_TTL_SECS).to_string())]);
        }
        let response = request.send().await.with_context(|| format!("kv put {key}"))?;
        if !response.status().is_success() {
            bail!("kv put {key}: status {}", response.status());
        }
        debug!(key, bytes = value.len(), "kv put");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.value_url(key))
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| format!("kv delete {key}"))?;
        // Deleting an already-gone key is fine.
        if !response.status().is_success() && response.status() != StatusCode::NOT_FOUND {
            bail!("kv delete {key}: status {}", response.status());
        }
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut params: Vec<(&str, String)> = vec![("prefix", prefix.to_string())];
            if let Some(c) = &cursor {
                params.push(("cursor", c.clone()));
            }
            let response = self
                .http
                .get(format!("{}/keys", self.base_url))
                .bearer_auth(&self.api_token)
                .query(&params)
                .send()
                .await
                .with_context(|| format!("kv list {prefix}"))?;
            if !response.status().is_success() {
                bail!("kv list {prefix}: status {}", response.status());
            }
            let page: ListResponse = response.json().await?;
            keys.extend(page.result.into_iter().map(|k| k.name));
            cursor = page
                .result_info
                .and_then(|i| i.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(keys)
    }

    async fn bulk_put(&self, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let body: Vec<_> = entries
            .iter()
            .map(|(key, value)| serde_json::json!({"key": key, "value": value}))
            .collect();
        let response = self
            .http
            .put(format!("{}/bulk", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("kv bulk put")?;
        if !response.status().is_success() {
            bail!("kv bulk put: status {}", response.status());
        }
        debug!(entries = entries.len(), "kv bulk put");
        Ok(())
    }

    async fn bulk_delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .delete(format!("{}/bulk", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&keys)
            .send()
            .await
            .context("kv bulk delete")?;
        if !response.status().is_success() {
            bail!("kv bulk delete: status {}", response.status());
        }
        Ok(())
    }
}

/// In-memory store for tests and local runs. TTLs are recorded but never
/// enforced; tests that care about expiry inspect `ttl_of` directly.
#[derive(Default)]
pub struct MemoryKv {
    entries: Mutex<HashMap<String, (String, Option<u64>)>>,
    writes: AtomicUsize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn ttl_of(&self, key: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(key).and_then(|(_, ttl)| *ttl)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).map(|(v, _)| v.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), (value.to_string(), ttl_secs));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
