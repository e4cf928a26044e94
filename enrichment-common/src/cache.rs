//! The API response cache and AI response cache, each a TTL-bounded lookup
//! table keyed on a canonicalized request shape.
//!
//! Both share one `TtlCache<Table>` implementation; only the table name and
//! the shape of the key-derivation inputs differ. Key derivation folds in a
//! `handler_version` so a handler's schema change naturally rolls the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::CacheError;
use crate::warehouse::WarehouseClient;

/// Canonicalizes a JSON value for hashing: object keys are already sorted by
/// `serde_json::Value`'s default `BTreeMap`-backed `Map`; this additionally
/// collapses whitespace in string values and, for any `url`/`host` field,
/// lowercases the host and strips a default port.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, v) in map {
                let v = if (key == "url" || key == "host") && v.is_string() {
                    Value::String(canonicalize_url_like(v.as_str().unwrap_or_default()))
                } else {
                    canonicalize(v)
                };
                out.insert(key, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::String(s) => Value::String(normalize_whitespace(&s)),
        other => other,
    }
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn canonicalize_url_like(raw: &str) -> String {
    if let Ok(mut url) = url::Url::parse(raw) {
        let host = url.host_str().map(|h| h.to_lowercase());
        if let Some(host) = host {
            let _ = url.set_host(Some(&host));
        }
        let default_port = match url.scheme() {
            "http" => Some(80),
            "https" => Some(443),
            _ => None,
        };
        if url.port() == default_port {
            let _ = url.set_port(None);
        }
        url.to_string()
    } else {
        raw.to_lowercase()
    }
}

/// Derives the deterministic cache key: a SHA-256 digest of the
/// canonicalized request plus the identity fields and handler version.
pub fn cache_key(identity_parts: &[&str], request: &Value, handler_version: u16) -> String {
    let canonical_request = canonicalize(request.clone());
    let mut hasher = Sha256::new();
    for part in identity_parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(handler_version.to_be_bytes());
    hasher.update(canonical_request.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub response: Value,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.created_at + chrono::Duration::seconds(self.ttl_seconds) > now
    }
}

struct TtlCache {
    warehouse: WarehouseClient,
    table: &'static str,
}

impl TtlCache {
    fn new(warehouse: WarehouseClient, table: &'static str) -> Self {
        Self { warehouse, table }
    }

    /// Returns the newest non-expired entry for `cache_key`, or `None` on
    /// miss. A warehouse read failure is treated as a miss: caching
    /// must never fail the caller.
    async fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        let result: Result<Option<CacheEntry>, CacheError> = self.get_inner(cache_key).await;
        match result {
            Ok(entry) => entry,
            Err(err) => {
                warn!(table = self.table, cache_key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn get_inner(&self, cache_key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let query = format!(
            "SELECT response_json, meta_json, ttl_seconds, created_at \
             FROM {} WHERE cache_key = $1 ORDER BY created_at DESC",
            self.table
        );
        let rows: Vec<(Value, Value, i64, DateTime<Utc>)> = sqlx::query_as(&query)
            .bind(cache_key)
            .fetch_all(self.warehouse.pool())
            .await?;

        let now = Utc::now();
        for (response, meta, ttl_seconds, created_at) in rows {
            let entry = CacheEntry {
                response,
                meta,
                created_at,
                ttl_seconds,
            };
            if entry.is_fresh(now) {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Appends one row. A write failure is logged and swallowed: the
    /// handler must not fail because caching could not happen.
    async fn put(
        &self,
        cache_key: &str,
        extra_columns: &[(&str, Value)],
        response: &Value,
        meta: &Value,
        ttl_seconds: i64,
    ) {
        if let Err(err) = self
            .put_inner(cache_key, extra_columns, response, meta, ttl_seconds)
            .await
        {
            warn!(table = self.table, cache_key, error = %err, "cache write failed, proceeding without it");
        }
    }

    async fn put_inner(
        &self,
        cache_key: &str,
        extra_columns: &[(&str, Value)],
        response: &Value,
        meta: &Value,
        ttl_seconds: i64,
    ) -> Result<(), CacheError> {
        let mut columns = vec!["cache_key".to_owned()];
        columns.extend(extra_columns.iter().map(|(name, _)| (*name).to_owned()));
        columns.push("response_json".to_owned());
        columns.push("meta_json".to_owned());
        columns.push("ttl_seconds".to_owned());

        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
        let query = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders.join(", ")
        );

        let mut q = sqlx::query(&query).bind(cache_key);
        for (_, value) in extra_columns {
            q = q.bind(value.clone());
        }
        q = q.bind(response.clone()).bind(meta.clone()).bind(ttl_seconds);
        q.execute(self.warehouse.pool()).await?;
        Ok(())
    }
}

/// Keyed on `(provider, method, canonicalized request)`.
pub struct ApiResponseCache {
    inner: TtlCache,
}

impl ApiResponseCache {
    pub fn new(warehouse: WarehouseClient) -> Self {
        Self {
            inner: TtlCache::new(warehouse, "api_request_cache"),
        }
    }

    pub fn key(provider: &str, method: &str, request: &Value, handler_version: u16) -> String {
        cache_key(&[provider, method], request, handler_version)
    }

    pub async fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        self.inner.get(cache_key).await
    }

    pub async fn put(
        &self,
        cache_key: &str,
        provider: &str,
        request: &Value,
        response: &Value,
        meta: &Value,
        ttl_seconds: i64,
    ) {
        self.inner
            .put(
                cache_key,
                &[
                    ("provider", Value::String(provider.to_owned())),
                    ("request_json", request.clone()),
                ],
                response,
                meta,
                ttl_seconds,
            )
            .await;
    }
}

/// Keyed on `(model, prompt_fingerprint, config_fingerprint)`.
pub struct AiResponseCache {
    inner: TtlCache,
}

impl AiResponseCache {
    pub fn new(warehouse: WarehouseClient) -> Self {
        Self {
            inner: TtlCache::new(warehouse, "ai_prompt_cache"),
        }
    }

    pub fn key(
        model: &str,
        prompt_fingerprint: &str,
        config_fingerprint: &str,
        handler_version: u16,
    ) -> String {
        cache_key(
            &[model, prompt_fingerprint, config_fingerprint],
            &Value::Null,
            handler_version,
        )
    }

    pub async fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        self.inner.get(cache_key).await
    }

    pub async fn put(
        &self,
        cache_key: &str,
        model: &str,
        prompt_fingerprint: &str,
        response: &Value,
        meta: &Value,
        ttl_seconds: i64,
    ) {
        self.inner
            .put(
                cache_key,
                &[
                    ("model", Value::String(model.to_owned())),
                    (
                        "prompt_fingerprint",
                        Value::String(prompt_fingerprint.to_owned()),
                    ),
                ],
                response,
                meta,
                ttl_seconds,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalize_sorts_and_trims() {
        let value = json!({"b": "  two   words  ", "a": 1});
        let canon = canonicalize(value).to_string();
        // serde_json::Map is BTreeMap-backed by default, so keys come out sorted.
        assert_eq!(canon, r#"{"a":1,"b":"two words"}"#);
    }

    #[test]
    fn canonicalize_normalizes_host_case_and_default_port() {
        let value = json!({"url": "HTTPS://Example.COM:443/path"});
        let canon = canonicalize(value);
        assert_eq!(canon["url"], "https://example.com/path");
    }

    #[test]
    fn cache_key_is_order_insensitive_and_version_sensitive() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(
            cache_key(&["prov", "GET"], &a, 1),
            cache_key(&["prov", "GET"], &b, 1)
        );
        assert_ne!(
            cache_key(&["prov", "GET"], &a, 1),
            cache_key(&["prov", "GET"], &a, 2)
        );
    }
}
