//! Cache engine: key derivation, read-through lookup, tiered storage
//!
//! Metadata lives in the `CacheStore`, large bodies in the `BlobStore`
//! (keyed by content hash). Expiry is lazy: an expired entry found on
//! lookup is evicted and reported as a miss, which may race harmlessly
//! with a concurrent write of a fresher entry under the same key.

use crate::error::ProxyError;
use crate::http::{header_pairs, headers_from_pairs, ProxyResponse};
use crate::rules::PatternCache;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{Duration, Utc};
use http::{header, Method, StatusCode};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use store::{BlobStore, CacheSetting, CacheStore, CachedEntry, ConfigStore, InlineBody};
use tracing::{debug, warn};

/// Derive the cache key: SHA-256 over scope + original path and query.
pub fn cache_key(path_and_query: &str, scope: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Some(scope) = scope {
        hasher.update(scope.as_bytes());
    }
    hasher.update(path_and_query.as_bytes());
    hex_digest(hasher)
}

fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex_digest(hasher)
}

fn hex_digest(hasher: Sha256) -> String {
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Result of a read-through lookup.
pub enum CacheLookup {
    /// Valid entry within its expiry.
    Hit(ProxyResponse),
    /// Past expiry but within the stale-while-revalidate window.
    Stale(ProxyResponse),
    Miss,
}

/// Read-through response cache over a metadata store and an optional
/// blob store.
pub struct CacheEngine {
    config: Arc<dyn ConfigStore>,
    entries: Arc<dyn CacheStore>,
    blobs: Option<Arc<dyn BlobStore>>,
    inline_max: usize,
    patterns: PatternCache,
}

impl CacheEngine {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        entries: Arc<dyn CacheStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        inline_max: usize,
    ) -> Self {
        Self {
            config,
            entries,
            blobs,
            inline_max,
            patterns: PatternCache::new(),
        }
    }

    /// Look up a cached response. Store failures and unreadable bodies
    /// degrade to a miss; expired or orphaned entries are evicted.
    pub async fn lookup(&self, key: &str) -> CacheLookup {
        let entry = match self.entries.get_entry(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                warn!(error = %e, key = %key, "Cache metadata read failed, treating as miss");
                return CacheLookup::Miss;
            }
        };

        let now = Utc::now();
        let fresh = now <= entry.expires_at;
        let within_stale_window =
            !fresh && entry.stale_until.map(|until| now <= until).unwrap_or(false);

        if !fresh && !within_stale_window {
            debug!(key = %key, "Cache entry expired, evicting");
            self.evict(key).await;
            return CacheLookup::Miss;
        }

        let body = match self.load_body(&entry).await {
            Some(body) => body,
            None => {
                warn!(key = %key, body_ref = ?entry.body_ref, "Cached body unavailable, evicting entry");
                self.evict(key).await;
                return CacheLookup::Miss;
            }
        };

        let response = ProxyResponse {
            status: StatusCode::from_u16(entry.status_code).unwrap_or(StatusCode::OK),
            headers: headers_from_pairs(&entry.headers),
            body,
        };

        if fresh {
            CacheLookup::Hit(response)
        } else {
            CacheLookup::Stale(response)
        }
    }

    async fn load_body(&self, entry: &CachedEntry) -> Option<Bytes> {
        if let Some(blob_key) = &entry.body_ref {
            let blobs = self.blobs.as_ref()?;
            return match blobs.get(blob_key).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, blob = %blob_key, "Blob read failed");
                    None
                }
            };
        }
        match &entry.body_inline {
            Some(InlineBody::Text(text)) => Some(Bytes::from(text.clone())),
            Some(InlineBody::Base64(encoded)) => BASE64.decode(encoded).ok().map(Bytes::from),
            None => Some(Bytes::new()),
        }
    }

    async fn evict(&self, key: &str) {
        if let Err(e) = self.entries.delete_entry(key).await {
            warn!(error = %e, key = %key, "Cache eviction failed");
        }
    }

    /// First active, scope-matching setting (by priority) whose pattern
    /// matches the original path and query.
    pub async fn match_setting(
        &self,
        path_and_query: &str,
        scope: Option<&str>,
    ) -> Option<CacheSetting> {
        let settings = match self.config.active_cache_settings(scope).await {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "Cache setting lookup failed, skipping cache");
                return None;
            }
        };

        for setting in settings {
            let Some(regex) = self.patterns.get(&setting.url_pattern) else {
                warn!(setting = %setting.name, pattern = %setting.url_pattern, "Invalid cache pattern, skipping");
                continue;
            };
            if regex.is_match(path_and_query) {
                return Some(setting);
            }
        }
        None
    }

    /// Store an eligible response. Returns false when the response was not
    /// cacheable; callers treat errors as skip-cache, never as a request
    /// failure.
    pub async fn store(
        &self,
        path_and_query: &str,
        scope: Option<&str>,
        method: &Method,
        response: &ProxyResponse,
        setting: &CacheSetting,
    ) -> Result<bool, ProxyError> {
        if !is_cacheable(method, response) {
            debug!(path = %path_and_query, "Response not eligible for caching");
            return Ok(false);
        }

        let key = cache_key(path_and_query, scope);
        let hash = body_hash(&response.body);

        let (body_ref, body_inline) = if response.body.len() <= self.inline_max {
            let inline = match String::from_utf8(response.body.to_vec()) {
                Ok(text) => InlineBody::Text(text),
                Err(_) => InlineBody::Base64(BASE64.encode(&response.body)),
            };
            (None, Some(inline))
        } else if let Some(blobs) = &self.blobs {
            blobs.put(&hash, response.body.clone()).await?;
            (Some(hash.clone()), None)
        } else {
            debug!(
                key = %key,
                bytes = response.body.len(),
                "Body exceeds inline limit and no blob store is configured, skipping cache"
            );
            return Ok(false);
        };

        let now = Utc::now();
        let expires_at = now + Duration::seconds(setting.duration_seconds as i64);
        let stale_until = setting
            .stale_while_revalidate_seconds
            .map(|secs| expires_at + Duration::seconds(secs as i64));

        self.entries
            .put_entry(CachedEntry {
                cache_key: key.clone(),
                target_scope: scope.map(|s| s.to_string()),
                status_code: response.status.as_u16(),
                headers: header_pairs(&response.headers),
                body_hash: hash,
                body_ref,
                body_inline,
                expires_at,
                stale_until,
                created_at: now,
            })
            .await?;

        debug!(key = %key, expires_at = %expires_at, "Response cached");
        Ok(true)
    }

    /// Drop all entries of one scope, or everything when `None`.
    pub async fn invalidate(&self, scope: Option<&str>) -> Result<u64, ProxyError> {
        Ok(self.entries.delete_scope(scope).await?)
    }

    /// Drop entries whose stale window has fully passed.
    pub async fn invalidate_expired(&self) -> Result<u64, ProxyError> {
        Ok(self.entries.delete_expired(Utc::now()).await?)
    }

    pub async fn invalidate_key(&self, key: &str) -> Result<(), ProxyError> {
        Ok(self.entries.delete_entry(key).await?)
    }
}

/// Only GET requests with 2xx responses that do not opt out of caching
/// are stored.
pub fn is_cacheable(method: &Method, response: &ProxyResponse) -> bool {
    if method != Method::GET {
        return false;
    }
    if !response.status.is_success() {
        return false;
    }

    for value in response.headers.get_all(header::CACHE_CONTROL) {
        if let Ok(value) = value.to_str() {
            let value = value.to_ascii_lowercase();
            if value.contains("no-store") || value.contains("no-cache") {
                return false;
            }
        }
    }
    for value in response.headers.get_all(header::PRAGMA) {
        if let Ok(value) = value.to_str() {
            if value.to_ascii_lowercase().contains("no-cache") {
                return false;
            }
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use store::{MemoryBlobStore, MemoryStore};

    fn setting(duration: u64, swr: Option<u64>) -> CacheSetting {
        CacheSetting {
            id: "s".to_string(),
            name: "s".to_string(),
            active: true,
            url_pattern: ".*".to_string(),
            duration_seconds: duration,
            stale_while_revalidate_seconds: swr,
            target_scope: None,
            priority: 0,
        }
    }

    fn ok_response(body: &'static [u8]) -> ProxyResponse {
        let mut response = ProxyResponse::new(StatusCode::OK);
        response
            .headers
            .insert("content-type", HeaderValue::from_static("text/plain"));
        response.body = Bytes::from_static(body);
        response
    }

    fn engine_with(
        store: Arc<MemoryStore>,
        blobs: Option<Arc<dyn BlobStore>>,
        inline_max: usize,
    ) -> CacheEngine {
        CacheEngine::new(store.clone(), store, blobs, inline_max)
    }

    #[test]
    fn test_cache_key_is_pure() {
        let a = cache_key("/users?page=1", Some("https://api.example.com/"));
        let b = cache_key("/users?page=1", Some("https://api.example.com/"));
        let c = cache_key("/users?page=2", Some("https://api.example.com/"));
        let d = cache_key("/users?page=1", Some("https://other.example.com/"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_store_and_lookup_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let response = ok_response(b"hello world");
        let stored = engine
            .store("/hello", Some("scope"), &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(stored);

        let key = cache_key("/hello", Some("scope"));
        match engine.lookup(&key).await {
            CacheLookup::Hit(cached) => {
                assert_eq!(cached.status, StatusCode::OK);
                assert_eq!(cached.body, response.body);
                assert_eq!(cached.content_type().as_deref(), Some("text/plain"));
            }
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_expired_entry_is_evicted_on_lookup() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let now = Utc::now();
        store
            .put_entry(CachedEntry {
                cache_key: "k".to_string(),
                target_scope: None,
                status_code: 200,
                headers: Vec::new(),
                body_hash: "h".to_string(),
                body_ref: None,
                body_inline: Some(InlineBody::Text("x".to_string())),
                expires_at: now - Duration::seconds(5),
                stale_until: None,
                created_at: now - Duration::seconds(65),
            })
            .await
            .unwrap();

        assert!(matches!(engine.lookup("k").await, CacheLookup::Miss));
        assert_eq!(store.cached_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_within_window() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let now = Utc::now();
        store
            .put_entry(CachedEntry {
                cache_key: "k".to_string(),
                target_scope: None,
                status_code: 200,
                headers: Vec::new(),
                body_hash: "h".to_string(),
                body_ref: None,
                body_inline: Some(InlineBody::Text("stale".to_string())),
                expires_at: now - Duration::seconds(5),
                stale_until: Some(now + Duration::seconds(55)),
                created_at: now - Duration::seconds(65),
            })
            .await
            .unwrap();

        match engine.lookup("k").await {
            CacheLookup::Stale(response) => assert_eq!(&response.body[..], b"stale"),
            _ => panic!("expected stale"),
        }
        // Stale entries stay until the refresh overwrites them
        assert_eq!(store.cached_entry_count(), 1);
    }

    #[tokio::test]
    async fn test_post_and_no_store_are_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let response = ok_response(b"x");
        let stored = engine
            .store("/p", None, &Method::POST, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(!stored);

        let mut response = ok_response(b"x");
        response
            .headers
            .insert("cache-control", HeaderValue::from_static("no-store"));
        let stored = engine
            .store("/p", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(!stored);

        let mut response = ok_response(b"x");
        response
            .headers
            .insert("pragma", HeaderValue::from_static("no-cache"));
        let stored = engine
            .store("/p", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(!stored);

        assert_eq!(store.cached_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_non_2xx_is_not_cached() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let mut response = ok_response(b"not here");
        response.status = StatusCode::NOT_FOUND;
        let stored = engine
            .store("/missing", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(!stored);
    }

    #[tokio::test]
    async fn test_large_body_goes_to_blob_store() {
        let store = Arc::new(MemoryStore::new());
        let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let engine = engine_with(store.clone(), Some(blobs), 4);

        let response = ok_response(b"this body exceeds the inline limit");
        let stored = engine
            .store("/big", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(stored);

        let key = cache_key("/big", None);
        let entry = store.get_entry(&key).await.unwrap().unwrap();
        assert!(entry.body_ref.is_some());
        assert!(entry.body_inline.is_none());

        match engine.lookup(&key).await {
            CacheLookup::Hit(cached) => assert_eq!(cached.body, response.body),
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_large_body_without_blob_store_skips_cache() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 4);

        let response = ok_response(b"too large to inline");
        let stored = engine
            .store("/big", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();
        assert!(!stored);
        assert_eq!(store.cached_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_blob_self_heals() {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let engine = engine_with(store.clone(), Some(blobs.clone()), 4);

        let response = ok_response(b"blob-backed response body");
        engine
            .store("/big", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();

        let key = cache_key("/big", None);
        let entry = store.get_entry(&key).await.unwrap().unwrap();
        blobs.delete(entry.body_ref.as_deref().unwrap()).await.unwrap();

        assert!(matches!(engine.lookup(&key).await, CacheLookup::Miss));
        assert_eq!(store.cached_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_binary_body_inlines_as_base64() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(store.clone(), None, 100 * 1024);

        let mut response = ok_response(b"");
        response.body = Bytes::from_static(&[0xff, 0xfe, 0x00, 0x01]);
        engine
            .store("/bin", None, &Method::GET, &response, &setting(60, None))
            .await
            .unwrap();

        let key = cache_key("/bin", None);
        let entry = store.get_entry(&key).await.unwrap().unwrap();
        assert!(matches!(entry.body_inline, Some(InlineBody::Base64(_))));

        match engine.lookup(&key).await {
            CacheLookup::Hit(cached) => assert_eq!(cached.body, response.body),
            _ => panic!("expected hit"),
        }
    }

    #[tokio::test]
    async fn test_match_setting_first_by_priority() {
        let store = Arc::new(MemoryStore::new());
        let mut low = setting(60, None);
        low.id = "low".to_string();
        low.name = "low".to_string();
        low.url_pattern = "\\.css$".to_string();
        low.priority = 0;
        let mut high = setting(600, None);
        high.id = "high".to_string();
        high.name = "high".to_string();
        high.priority = 1;
        store.insert_cache_setting(high);
        store.insert_cache_setting(low);

        let engine = engine_with(store.clone(), None, 100 * 1024);

        let matched = engine.match_setting("/styles/app.css", None).await.unwrap();
        assert_eq!(matched.name, "low");

        let matched = engine.match_setting("/index.html", None).await.unwrap();
        assert_eq!(matched.name, "high");
    }
}
