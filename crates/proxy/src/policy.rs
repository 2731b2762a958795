//! Proxy-vs-direct policy evaluation

use crate::rules::PatternCache;
use std::sync::Arc;
use store::{ConfigStore, PolicyAction};
use tracing::{debug, warn};

/// Outcome of evaluating the active policies against a request URL.
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    pub matched_policy: Option<String>,
}

impl PolicyDecision {
    fn default_proxy() -> Self {
        Self {
            action: PolicyAction::Proxy,
            matched_policy: None,
        }
    }
}

/// Decides whether a request is proxied through its target prefix or
/// fetched directly. First regex match in priority order wins; no match
/// means proxy.
pub struct PolicyEvaluator {
    config: Arc<dyn ConfigStore>,
    patterns: PatternCache,
}

impl PolicyEvaluator {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self {
            config,
            patterns: PatternCache::new(),
        }
    }

    pub async fn evaluate(&self, original_url: &str, scope: Option<&str>) -> PolicyDecision {
        // A degraded policy backend must not take the proxy down.
        let policies = match self.config.active_policies(scope).await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "Policy lookup failed, defaulting to proxy");
                return PolicyDecision::default_proxy();
            }
        };

        for policy in policies {
            let Some(regex) = self.patterns.get(&policy.url_pattern) else {
                warn!(policy = %policy.name, pattern = %policy.url_pattern, "Invalid policy pattern, skipping");
                continue;
            };
            if regex.is_match(original_url) {
                debug!(policy = %policy.name, action = %policy.action.as_str(), url = %original_url, "Policy matched");
                return PolicyDecision {
                    action: policy.action,
                    matched_policy: Some(policy.name),
                };
            }
        }

        PolicyDecision::default_proxy()
    }
}
