//! Domain records consumed by the proxy core.
//!
//! All of these are administered outside the core; the pipeline only ever
//! reads the active subsets through the `ConfigStore` trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered origin the proxy is allowed to front.
///
/// Resolution picks the active target whose `url_prefix` is the longest
/// string-prefix of the reconstructed original URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyTarget {
    pub id: String,
    /// Origin URL prefix, e.g. `https://api.example.com/`
    pub url_prefix: String,
    pub active: bool,
    pub js_injection_enabled: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// What to do with a request once a policy matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    /// Forward through the configured target prefix.
    Proxy,
    /// Fetch the literal original URL, bypassing the target prefix.
    Direct,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Proxy => "proxy",
            PolicyAction::Direct => "direct",
        }
    }
}

/// Proxy-vs-direct routing policy, first regex match by priority wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncPolicy {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Regex tested against the reconstructed original URL.
    pub url_pattern: String,
    pub action: PolicyAction,
    /// Restricts the policy to one target prefix; absent/empty means global.
    #[serde(default)]
    pub target_scope: Option<String>,
    pub priority: i32,
}

/// Which side of the exchange a header rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    Request,
    Response,
}

/// Header mutation performed by a `HeaderRule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderAction {
    /// Append a value, keeping existing values of the same name.
    Add,
    /// Replace all values with the replacement value.
    Set,
    /// Delete all values of the name.
    Remove,
    /// Regex-substitute within each current value; no-op when absent.
    Replace,
}

/// Ordered header transformation; every active, scope-matching rule of the
/// phase is applied, there is no first-match short-circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRule {
    pub id: String,
    pub name: String,
    pub active: bool,
    pub phase: RulePhase,
    pub header_name: String,
    pub action: HeaderAction,
    #[serde(default)]
    pub value_pattern: Option<String>,
    #[serde(default)]
    pub replacement_value: Option<String>,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub priority: i32,
}

/// Body mutation performed by a `ResponseRule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyAction {
    /// Global regex substitution on the textual body.
    ReplaceText,
    /// Append a `<script>` tag before `</body>` on HTML responses.
    InjectScript,
    /// Structural JSON edit; declared unsupported, rules using it are skipped.
    ReplaceJsonValue,
    None,
}

/// Ordered response body transformation, gated on status and content type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRule {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Exact code ("404"), class wildcard ("4xx") or "*"/absent for any.
    #[serde(default)]
    pub match_status_code: Option<String>,
    /// Case-insensitive regex over Content-Type; "*"/absent matches any.
    #[serde(default)]
    pub match_content_type: Option<String>,
    pub body_action: BodyAction,
    #[serde(default)]
    pub body_pattern: Option<String>,
    #[serde(default)]
    pub body_replacement: Option<String>,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub priority: i32,
}

/// Caching directive; the first regex match by priority governs a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSetting {
    pub id: String,
    pub name: String,
    pub active: bool,
    /// Regex tested against the original path and query.
    pub url_pattern: String,
    pub duration_seconds: u64,
    #[serde(default)]
    pub stale_while_revalidate_seconds: Option<u64>,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub priority: i32,
}

/// Small cached body stored directly on the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum InlineBody {
    Text(String),
    Base64(String),
}

/// A cached origin response.
///
/// Exactly one of `body_ref` and `body_inline` is populated; bodies above
/// the inline threshold live in the blob store under `body_ref`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub cache_key: String,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body_hash: String,
    #[serde(default)]
    pub body_ref: Option<String>,
    #[serde(default)]
    pub body_inline: Option<InlineBody>,
    pub expires_at: DateTime<Utc>,
    /// End of the stale-while-revalidate window, when configured.
    #[serde(default)]
    pub stale_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// How the cache participated in serving a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// Append-only audit record, written once per request after the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub target_scope: Option<String>,
    pub original_url: String,
    pub method: String,
    pub request_headers: Vec<(String, String)>,
    #[serde(default)]
    pub request_body: Option<String>,
    pub proxied_url: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub response_headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub response_body: Option<String>,
    pub duration_ms: u64,
    pub cache_status: CacheStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub client_ip: String,
}

impl RequestLogEntry {
    /// Start an entry with the fields known before the pipeline runs.
    pub fn new(
        target_scope: Option<String>,
        original_url: impl Into<String>,
        method: impl Into<String>,
        request_headers: Vec<(String, String)>,
        client_ip: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            target_scope,
            original_url: original_url.into(),
            method: method.into(),
            request_headers,
            request_body: None,
            proxied_url: String::new(),
            status: None,
            response_headers: None,
            response_body: None,
            duration_ms: 0,
            cache_status: CacheStatus::Bypass,
            error: None,
            client_ip: client_ip.into(),
        }
    }
}

pub(crate) fn generate_id() -> String {
    Uuid::new_v4().to_string()
}
