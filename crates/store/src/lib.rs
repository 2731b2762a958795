//! gproxy-store: storage boundary for gproxy
//!
//! Defines the domain records and the backend-agnostic traits the proxy
//! core reads configuration through and writes cache/log records into,
//! plus the in-memory and filesystem implementations shipped with the
//! binary.

pub mod config;
pub mod entities;
pub mod error;
pub mod fs_blob;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use config::{
    CacheOptions, CacheSettingConfig, ConfigError, GproxyConfig, HeaderRuleConfig, LogOptions,
    PolicyConfig, ResponseRuleConfig, ServerOptions, TargetConfig,
};
pub use entities::{
    AsyncPolicy, BodyAction, CacheSetting, CacheStatus, CachedEntry, HeaderAction, HeaderRule,
    InlineBody, PolicyAction, ProxyTarget, RequestLogEntry, ResponseRule, RulePhase,
};
pub use error::StoreError;
pub use fs_blob::FsBlobStore;
pub use memory::{MemoryBlobStore, MemoryLogSink, MemoryStore};

/// Read access to the administered configuration entities.
///
/// Every `active_*` method returns only active records whose scope is
/// global or equal to the given target prefix, ordered by ascending
/// priority.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Longest-prefix resolution among active targets.
    async fn resolve_target(&self, original_url: &str) -> Result<Option<ProxyTarget>, StoreError>;

    async fn active_policies(&self, scope: Option<&str>) -> Result<Vec<AsyncPolicy>, StoreError>;

    async fn active_header_rules(
        &self,
        scope: Option<&str>,
        phase: RulePhase,
    ) -> Result<Vec<HeaderRule>, StoreError>;

    async fn active_response_rules(
        &self,
        scope: Option<&str>,
    ) -> Result<Vec<ResponseRule>, StoreError>;

    async fn active_cache_settings(
        &self,
        scope: Option<&str>,
    ) -> Result<Vec<CacheSetting>, StoreError>;
}

/// Metadata store for cached responses, keyed by the derived cache key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get_entry(&self, key: &str) -> Result<Option<CachedEntry>, StoreError>;

    async fn put_entry(&self, entry: CachedEntry) -> Result<(), StoreError>;

    async fn delete_entry(&self, key: &str) -> Result<(), StoreError>;

    /// Delete entries whose stale window (or expiry, without one) has
    /// passed. Returns the number of deleted entries.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Delete all entries of one target scope, or everything when `None`.
    async fn delete_scope(&self, scope: Option<&str>) -> Result<u64, StoreError>;
}

/// Body storage for cached responses too large to inline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Append-only sink for request audit records.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError>;
}
