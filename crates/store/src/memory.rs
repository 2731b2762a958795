//! In-memory storage backends
//!
//! `MemoryStore` holds the administered configuration entities and the
//! cached-response metadata; it is seeded from the bootstrap config file at
//! startup. `MemoryBlobStore` and `MemoryLogSink` complete the boundary for
//! tests and single-process deployments.

use crate::config::GproxyConfig;
use crate::entities::{
    generate_id, AsyncPolicy, CacheSetting, CachedEntry, HeaderRule, ProxyTarget,
    RequestLogEntry, ResponseRule, RulePhase,
};
use crate::{BlobStore, CacheStore, ConfigStore, LogSink, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

/// True when a record's scope makes it applicable to the request scope.
/// Absent or empty scope means the record is global.
fn scope_matches(record_scope: &Option<String>, scope: Option<&str>) -> bool {
    match record_scope.as_deref() {
        None | Some("") => true,
        Some(s) => Some(s) == scope,
    }
}

/// In-memory configuration and cache-entry store.
#[derive(Default)]
pub struct MemoryStore {
    targets: RwLock<Vec<ProxyTarget>>,
    policies: RwLock<Vec<AsyncPolicy>>,
    header_rules: RwLock<Vec<HeaderRule>>,
    response_rules: RwLock<Vec<ResponseRule>>,
    cache_settings: RwLock<Vec<CacheSetting>>,
    entries: DashMap<String, CachedEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from the bootstrap configuration.
    pub fn from_config(config: &GproxyConfig) -> Self {
        let store = Self::new();

        for t in &config.targets {
            store.insert_target(ProxyTarget {
                id: generate_id(),
                url_prefix: t.url_prefix.clone(),
                active: t.active,
                js_injection_enabled: t.js_injection_enabled,
                notes: t.notes.clone(),
            });
        }
        for p in &config.policies {
            store.insert_policy(AsyncPolicy {
                id: generate_id(),
                name: p.name.clone(),
                active: p.active,
                url_pattern: p.url_pattern.clone(),
                action: p.action,
                target_scope: p.target_scope.clone(),
                priority: p.priority,
            });
        }
        for r in &config.header_rules {
            store.insert_header_rule(HeaderRule {
                id: generate_id(),
                name: r.name.clone(),
                active: r.active,
                phase: r.phase,
                header_name: r.header_name.clone(),
                action: r.action,
                value_pattern: r.value_pattern.clone(),
                replacement_value: r.replacement_value.clone(),
                target_scope: r.target_scope.clone(),
                priority: r.priority,
            });
        }
        for r in &config.response_rules {
            store.insert_response_rule(ResponseRule {
                id: generate_id(),
                name: r.name.clone(),
                active: r.active,
                match_status_code: r.match_status_code.clone(),
                match_content_type: r.match_content_type.clone(),
                body_action: r.body_action,
                body_pattern: r.body_pattern.clone(),
                body_replacement: r.body_replacement.clone(),
                target_scope: r.target_scope.clone(),
                priority: r.priority,
            });
        }
        for s in &config.cache_settings {
            store.insert_cache_setting(CacheSetting {
                id: generate_id(),
                name: s.name.clone(),
                active: s.active,
                url_pattern: s.url_pattern.clone(),
                duration_seconds: s.duration_seconds,
                stale_while_revalidate_seconds: s.stale_while_revalidate_seconds,
                target_scope: s.target_scope.clone(),
                priority: s.priority,
            });
        }

        store
    }

    pub fn insert_target(&self, target: ProxyTarget) {
        self.targets.write().push(target);
    }

    pub fn insert_policy(&self, policy: AsyncPolicy) {
        self.policies.write().push(policy);
    }

    pub fn insert_header_rule(&self, rule: HeaderRule) {
        self.header_rules.write().push(rule);
    }

    pub fn insert_response_rule(&self, rule: ResponseRule) {
        self.response_rules.write().push(rule);
    }

    pub fn insert_cache_setting(&self, setting: CacheSetting) {
        self.cache_settings.write().push(setting);
    }

    pub fn cached_entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn resolve_target(&self, original_url: &str) -> Result<Option<ProxyTarget>, StoreError> {
        let targets = self.targets.read();

        let mut best: Option<&ProxyTarget> = None;
        for target in targets.iter().filter(|t| t.active) {
            if original_url.starts_with(&target.url_prefix) {
                let longer = best
                    .map(|b| target.url_prefix.len() > b.url_prefix.len())
                    .unwrap_or(true);
                if longer {
                    best = Some(target);
                }
            }
        }
        Ok(best.cloned())
    }

    async fn active_policies(&self, scope: Option<&str>) -> Result<Vec<AsyncPolicy>, StoreError> {
        let mut out: Vec<AsyncPolicy> = self
            .policies
            .read()
            .iter()
            .filter(|p| p.active && scope_matches(&p.target_scope, scope))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.priority);
        Ok(out)
    }

    async fn active_header_rules(
        &self,
        scope: Option<&str>,
        phase: RulePhase,
    ) -> Result<Vec<HeaderRule>, StoreError> {
        let mut out: Vec<HeaderRule> = self
            .header_rules
            .read()
            .iter()
            .filter(|r| r.active && r.phase == phase && scope_matches(&r.target_scope, scope))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.priority);
        Ok(out)
    }

    async fn active_response_rules(
        &self,
        scope: Option<&str>,
    ) -> Result<Vec<ResponseRule>, StoreError> {
        let mut out: Vec<ResponseRule> = self
            .response_rules
            .read()
            .iter()
            .filter(|r| r.active && scope_matches(&r.target_scope, scope))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.priority);
        Ok(out)
    }

    async fn active_cache_settings(
        &self,
        scope: Option<&str>,
    ) -> Result<Vec<CacheSetting>, StoreError> {
        let mut out: Vec<CacheSetting> = self
            .cache_settings
            .read()
            .iter()
            .filter(|s| s.active && scope_matches(&s.target_scope, scope))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.priority);
        Ok(out)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedEntry>, StoreError> {
        Ok(self.entries.get(key).map(|e| e.value().clone()))
    }

    async fn put_entry(&self, entry: CachedEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.stale_until.unwrap_or(e.expires_at) >= now);
        Ok((before - self.entries.len()) as u64)
    }

    async fn delete_scope(&self, scope: Option<&str>) -> Result<u64, StoreError> {
        let before = self.entries.len();
        match scope {
            Some(scope) => {
                self.entries
                    .retain(|_, e| e.target_scope.as_deref() != Some(scope));
            }
            None => self.entries.clear(),
        }
        Ok((before - self.entries.len()) as u64)
    }
}

/// In-memory blob storage.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, Bytes>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self.blobs.get(key).map(|b| b.value().clone()))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError> {
        self.blobs.insert(key.to_string(), body);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.blobs.remove(key);
        Ok(())
    }
}

/// Log sink collecting entries in memory, for tests and inspection.
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<RequestLogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<RequestLogEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        self.entries.lock().push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::PolicyAction;
    use chrono::Duration;

    fn target(prefix: &str, active: bool) -> ProxyTarget {
        ProxyTarget {
            id: generate_id(),
            url_prefix: prefix.to_string(),
            active,
            js_injection_enabled: false,
            notes: None,
        }
    }

    fn entry(key: &str, scope: Option<&str>, expires_at: DateTime<Utc>) -> CachedEntry {
        CachedEntry {
            cache_key: key.to_string(),
            target_scope: scope.map(|s| s.to_string()),
            status_code: 200,
            headers: Vec::new(),
            body_hash: "h".to_string(),
            body_ref: None,
            body_inline: Some(crate::InlineBody::Text("x".to_string())),
            expires_at,
            stale_until: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_resolve_target_longest_prefix() {
        let store = MemoryStore::new();
        store.insert_target(target("https://api.example.com/", true));
        store.insert_target(target("https://api.example.com/v2/", true));
        store.insert_target(target("https://api.example.com/v2/deep/", false));

        let resolved = store
            .resolve_target("https://api.example.com/v2/deep/users")
            .await
            .unwrap()
            .unwrap();

        // Longest active prefix wins, inactive targets never match
        assert_eq!(resolved.url_prefix, "https://api.example.com/v2/");
    }

    #[tokio::test]
    async fn test_resolve_target_no_match() {
        let store = MemoryStore::new();
        store.insert_target(target("https://api.example.com/", true));

        let resolved = store
            .resolve_target("https://other.example.com/")
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn test_active_policies_scope_and_order() {
        let store = MemoryStore::new();
        let mk = |name: &str, scope: Option<&str>, priority: i32| AsyncPolicy {
            id: generate_id(),
            name: name.to_string(),
            active: true,
            url_pattern: ".".to_string(),
            action: PolicyAction::Proxy,
            target_scope: scope.map(|s| s.to_string()),
            priority,
        };
        store.insert_policy(mk("scoped", Some("https://a/"), 1));
        store.insert_policy(mk("global", None, 0));
        store.insert_policy(mk("other-scope", Some("https://b/"), 0));
        store.insert_policy(mk("empty-scope", Some(""), 2));

        let policies = store.active_policies(Some("https://a/")).await.unwrap();
        let names: Vec<&str> = policies.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["global", "scoped", "empty-scope"]);
    }

    #[tokio::test]
    async fn test_delete_expired_and_scope() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .put_entry(entry("old", Some("a"), now - Duration::seconds(10)))
            .await
            .unwrap();
        store
            .put_entry(entry("fresh", Some("a"), now + Duration::seconds(60)))
            .await
            .unwrap();
        store
            .put_entry(entry("other", Some("b"), now + Duration::seconds(60)))
            .await
            .unwrap();

        assert_eq!(store.delete_expired(now).await.unwrap(), 1);
        assert!(store.get_entry("old").await.unwrap().is_none());

        assert_eq!(store.delete_scope(Some("a")).await.unwrap(), 1);
        assert!(store.get_entry("fresh").await.unwrap().is_none());
        assert!(store.get_entry("other").await.unwrap().is_some());

        assert_eq!(store.delete_scope(None).await.unwrap(), 1);
        assert_eq!(store.cached_entry_count(), 0);
    }
}
