//! Bootstrap configuration for gproxy
//!
//! The durable configuration store is external to the core; this file format
//! seeds the in-memory store at startup with targets, policies, rules and
//! cache settings, alongside the server-level options.

use crate::entities::{BodyAction, HeaderAction, PolicyAction, RulePhase};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GproxyConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerOptions,

    /// Request log settings
    #[serde(default)]
    pub log: LogOptions,

    /// Cache engine settings
    #[serde(default)]
    pub cache: CacheOptions,

    /// Registered proxy targets
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Proxy-vs-direct policies
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,

    /// Header rules
    #[serde(default)]
    pub header_rules: Vec<HeaderRuleConfig>,

    /// Response body rules
    #[serde(default)]
    pub response_rules: Vec<ResponseRuleConfig>,

    /// Cache settings
    #[serde(default)]
    pub cache_settings: Vec<CacheSettingConfig>,
}

impl GproxyConfig {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: GproxyConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen.is_empty() {
            return Err(ConfigError::Validation(
                "no listen addresses configured".to_string(),
            ));
        }

        let mut prefixes = HashSet::new();
        for target in &self.targets {
            if target.url_prefix.is_empty() {
                return Err(ConfigError::Validation(
                    "target with empty url_prefix".to_string(),
                ));
            }
            if !prefixes.insert(target.url_prefix.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate target url_prefix '{}'",
                    target.url_prefix
                )));
            }
        }

        let mut names = HashSet::new();
        for policy in &self.policies {
            if !names.insert(policy.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate policy name '{}'",
                    policy.name
                )));
            }
        }

        Ok(())
    }

    /// Collect warnings for regex patterns that fail to compile.
    ///
    /// Invalid patterns are not fatal: the affected entry is skipped at
    /// evaluation time, so startup only reports them.
    pub fn pattern_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut check = |pattern: &str, what: String| {
            if Regex::new(pattern).is_err() {
                warnings.push(format!("{}: invalid regex '{}'", what, pattern));
            }
        };

        for policy in &self.policies {
            check(&policy.url_pattern, format!("policy '{}'", policy.name));
        }
        for setting in &self.cache_settings {
            check(
                &setting.url_pattern,
                format!("cache setting '{}'", setting.name),
            );
        }
        for rule in &self.header_rules {
            if rule.action == HeaderAction::Replace {
                if let Some(pattern) = &rule.value_pattern {
                    check(pattern, format!("header rule '{}'", rule.name));
                }
            }
        }
        for rule in &self.response_rules {
            if rule.body_action == BodyAction::ReplaceText {
                if let Some(pattern) = &rule.body_pattern {
                    check(pattern, format!("response rule '{}'", rule.name));
                }
            }
            if let Some(pattern) = &rule.match_content_type {
                if pattern != "*" {
                    check(pattern, format!("response rule '{}'", rule.name));
                }
            }
        }

        warnings
    }
}

/// Server-level options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    /// Listen addresses, e.g. ":8080" or "127.0.0.1:8080"
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// Path prefix of the proxy URL scheme
    #[serde(default = "default_route_prefix")]
    pub route_prefix: String,

    /// Timeout for outbound origin fetches in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

fn default_listen() -> Vec<String> {
    vec![":8080".to_string()]
}

fn default_route_prefix() -> String {
    "/proxy".to_string()
}

fn default_upstream_timeout() -> u64 {
    30
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            route_prefix: default_route_prefix(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

/// Request log options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOptions {
    /// Request log file path (JSON lines); logging to file is disabled
    /// when unset
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Capacity of the bounded log channel; entries beyond it are dropped
    #[serde(default = "default_log_capacity")]
    pub channel_capacity: usize,
}

fn default_log_capacity() -> usize {
    1024
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            path: None,
            channel_capacity: default_log_capacity(),
        }
    }
}

/// Cache engine options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Largest body stored inline on the entry, in bytes (default: 100 KiB)
    #[serde(default = "default_inline_max")]
    pub inline_max_bytes: usize,

    /// Directory for blob-stored bodies; oversized bodies skip caching
    /// when unset
    #[serde(default)]
    pub blob_dir: Option<PathBuf>,

    /// Interval for the expired-entry sweep in seconds (0 disables it)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_inline_max() -> usize {
    100 * 1024
}

fn default_sweep_interval() -> u64 {
    300
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            inline_max_bytes: default_inline_max(),
            blob_dir: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Seeded proxy target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub url_prefix: String,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub js_injection_enabled: bool,

    #[serde(default)]
    pub notes: Option<String>,
}

/// Seeded proxy-vs-direct policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,

    #[serde(default = "default_active")]
    pub active: bool,

    pub url_pattern: String,
    pub action: PolicyAction,

    #[serde(default)]
    pub target_scope: Option<String>,

    #[serde(default)]
    pub priority: i32,
}

/// Seeded header rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderRuleConfig {
    pub name: String,

    #[serde(default = "default_active")]
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

    #[serde(default)]
    pub priority: i32,
}

/// Seeded response body rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRuleConfig {
    pub name: String,

    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default)]
    pub match_status_code: Option<String>,

    #[serde(default)]
    pub match_content_type: Option<String>,

    pub body_action: BodyAction,

    #[serde(default)]
    pub body_pattern: Option<String>,

    #[serde(default)]
    pub body_replacement: Option<String>,

    #[serde(default)]
    pub target_scope: Option<String>,

    #[serde(default)]
    pub priority: i32,
}

/// Seeded cache setting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettingConfig {
    pub name: String,

    #[serde(default = "default_active")]
    pub active: bool,

    pub url_pattern: String,
    pub duration_seconds: u64,

    #[serde(default)]
    pub stale_while_revalidate_seconds: Option<u64>,

    #[serde(default)]
    pub target_scope: Option<String>,

    #[serde(default)]
    pub priority: i32,
}

fn default_active() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let config: GproxyConfig = toml::from_str(
            r#"
            [[targets]]
            url_prefix = "https://api.example.com/"

            [[policies]]
            name = "admin-direct"
            url_pattern = "^https://api\\.example\\.com/admin"
            action = "direct"

            [[header_rules]]
            name = "tag"
            phase = "response"
            header_name = "x-served-by"
            action = "set"
            replacement_value = "gproxy"

            [[cache_settings]]
            name = "assets"
            url_pattern = "\\.css$"
            duration_seconds = 600
            "#,
        )
        .unwrap();

        assert_eq!(config.server.route_prefix, "/proxy");
        assert_eq!(config.targets.len(), 1);
        assert!(config.targets[0].active);
        assert_eq!(config.policies[0].action, PolicyAction::Direct);
        assert_eq!(config.header_rules[0].action, HeaderAction::Set);
        assert_eq!(config.cache_settings[0].duration_seconds, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_prefix() {
        let config: GproxyConfig = toml::from_str(
            r#"
            [[targets]]
            url_prefix = "https://a.example.com/"
            [[targets]]
            url_prefix = "https://a.example.com/"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_policy_name() {
        let config: GproxyConfig = toml::from_str(
            r#"
            [[policies]]
            name = "p"
            url_pattern = "a"
            action = "proxy"
            [[policies]]
            name = "p"
            url_pattern = "b"
            action = "direct"
            "#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pattern_warnings() {
        let config: GproxyConfig = toml::from_str(
            r#"
            [[policies]]
            name = "broken"
            url_pattern = "("
            action = "proxy"

            [[policies]]
            name = "fine"
            url_pattern = "^https://"
            action = "proxy"
            "#,
        )
        .unwrap();

        let warnings = config.pattern_warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("broken"));
    }
}
