//! Rule engine: ordered header and response body transformations
//!
//! Every active, scope-matching rule is applied in ascending priority
//! order; there is no first-match short-circuit. A rule with an invalid
//! pattern is skipped on its own, the rest of the chain still runs.

use crate::http::ProxyResponse;
use dashmap::DashMap;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use regex::Regex;
use std::sync::Arc;
use store::{BodyAction, ConfigStore, HeaderAction, HeaderRule, ResponseRule, RulePhase};
use tracing::warn;

/// Compiled-regex memo shared by the pattern-driven components, so rule
/// patterns compile once per configuration, not once per request.
pub(crate) struct PatternCache {
    compiled: DashMap<String, Option<Arc<Regex>>>,
}

impl PatternCache {
    pub(crate) fn new() -> Self {
        Self {
            compiled: DashMap::new(),
        }
    }

    /// Compile and memoize; `None` for invalid patterns (also memoized).
    pub(crate) fn get(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(cached) = self.compiled.get(pattern) {
            return cached.clone();
        }
        let compiled = Regex::new(pattern).ok().map(Arc::new);
        self.compiled.insert(pattern.to_string(), compiled.clone());
        compiled
    }

    pub(crate) fn get_case_insensitive(&self, pattern: &str) -> Option<Arc<Regex>> {
        self.get(&format!("(?i:{})", pattern))
    }
}

/// Applies administered header and body rules to requests and responses.
pub struct RuleEngine {
    config: Arc<dyn ConfigStore>,
    patterns: PatternCache,
}

impl RuleEngine {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self {
            config,
            patterns: PatternCache::new(),
        }
    }

    /// Apply all active header rules of the phase and scope, in priority
    /// order. A failed rule lookup leaves the headers untouched.
    pub async fn apply_header_rules(
        &self,
        headers: HeaderMap,
        phase: RulePhase,
        scope: Option<&str>,
    ) -> HeaderMap {
        let rules = match self.config.active_header_rules(scope, phase).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Header rule lookup failed, leaving headers unchanged");
                return headers;
            }
        };

        let mut headers = headers;
        for rule in &rules {
            self.apply_header_rule(&mut headers, rule);
        }
        headers
    }

    fn apply_header_rule(&self, headers: &mut HeaderMap, rule: &HeaderRule) {
        let Ok(name) = HeaderName::try_from(rule.header_name.to_ascii_lowercase()) else {
            warn!(rule = %rule.name, header = %rule.header_name, "Invalid header name in rule, skipping");
            return;
        };

        match rule.action {
            HeaderAction::Add => {
                if let Some(value) = parse_value(rule.replacement_value.as_deref()) {
                    headers.append(name, value);
                }
            }
            HeaderAction::Set => {
                if let Some(value) = parse_value(rule.replacement_value.as_deref()) {
                    headers.insert(name, value);
                }
            }
            HeaderAction::Remove => {
                while headers.remove(&name).is_some() {}
            }
            HeaderAction::Replace => {
                let (Some(pattern), Some(replacement)) = (
                    rule.value_pattern.as_deref(),
                    rule.replacement_value.as_deref(),
                ) else {
                    return;
                };
                if !headers.contains_key(&name) {
                    return;
                }
                let Some(regex) = self.patterns.get(pattern) else {
                    warn!(rule = %rule.name, pattern = %pattern, "Invalid pattern in header rule, skipping");
                    return;
                };

                let replaced: Vec<HeaderValue> = headers
                    .get_all(&name)
                    .iter()
                    .filter_map(|value| value.to_str().ok())
                    .map(|value| regex.replace_all(value, replacement).into_owned())
                    .filter_map(|value| HeaderValue::try_from(value).ok())
                    .collect();

                while headers.remove(&name).is_some() {}
                for value in replaced {
                    headers.append(name.clone(), value);
                }
            }
        }
    }

    /// Apply all active body rules of the scope whose status and
    /// content-type predicates hold, each stage feeding the next.
    pub async fn apply_body_rules(
        &self,
        response: ProxyResponse,
        scope: Option<&str>,
    ) -> ProxyResponse {
        let rules = match self.config.active_response_rules(scope).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Response rule lookup failed, leaving response unchanged");
                return response;
            }
        };

        let mut response = response;
        for rule in &rules {
            if !status_matches(rule.match_status_code.as_deref(), response.status.as_u16()) {
                continue;
            }
            let content_type = response.content_type();
            if !self.content_type_matches(rule.match_content_type.as_deref(), content_type.as_deref())
            {
                continue;
            }
            response = self.apply_body_rule(response, rule);
        }
        response
    }

    fn apply_body_rule(&self, response: ProxyResponse, rule: &ResponseRule) -> ProxyResponse {
        match rule.body_action {
            BodyAction::None => response,
            BodyAction::ReplaceJsonValue => {
                warn!(rule = %rule.name, "replace_json_value is not supported, skipping rule");
                response
            }
            BodyAction::ReplaceText => {
                let (Some(pattern), Some(replacement)) =
                    (rule.body_pattern.as_deref(), rule.body_replacement.as_deref())
                else {
                    return response;
                };
                let Some(regex) = self.patterns.get(pattern) else {
                    warn!(rule = %rule.name, pattern = %pattern, "Invalid pattern in response rule, skipping");
                    return response;
                };

                let body = String::from_utf8_lossy(&response.body).into_owned();
                let rewritten = regex.replace_all(&body, replacement).into_owned();
                if rewritten == body {
                    response
                } else {
                    response.with_text_body(rewritten)
                }
            }
            BodyAction::InjectScript => {
                let Some(replacement) = rule.body_replacement.as_deref() else {
                    return response;
                };
                let is_html = response
                    .content_type()
                    .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
                    .unwrap_or(false);
                if !is_html {
                    return response;
                }

                let script_tag = if replacement.starts_with("http") {
                    format!(r#"<script src="{}"></script>"#, replacement)
                } else {
                    format!("<script>{}</script>", replacement)
                };

                let body = String::from_utf8_lossy(&response.body).into_owned();
                let rewritten = match body.rfind("</body>") {
                    Some(idx) => {
                        let mut out = String::with_capacity(body.len() + script_tag.len());
                        out.push_str(&body[..idx]);
                        out.push_str(&script_tag);
                        out.push_str(&body[idx..]);
                        out
                    }
                    None => {
                        let mut out = body;
                        out.push_str(&script_tag);
                        out
                    }
                };
                response.with_text_body(rewritten)
            }
        }
    }

    fn content_type_matches(&self, rule_type: Option<&str>, actual: Option<&str>) -> bool {
        let Some(rule_type) = rule_type else {
            return true;
        };
        if rule_type == "*" || rule_type.is_empty() {
            return true;
        }
        let Some(actual) = actual else {
            return false;
        };
        match self.patterns.get_case_insensitive(rule_type) {
            Some(regex) => regex.is_match(actual),
            None => {
                warn!(pattern = %rule_type, "Invalid content-type pattern, treating as non-match");
                false
            }
        }
    }
}

fn parse_value(value: Option<&str>) -> Option<HeaderValue> {
    let value = value?;
    match HeaderValue::try_from(value) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(value = %value, "Invalid header value in rule, skipping");
            None
        }
    }
}

/// Match a status code against an exact code ("404"), a class wildcard
/// ("4xx") or "*"/absent for any.
fn status_matches(rule_code: Option<&str>, actual: u16) -> bool {
    let Some(rule_code) = rule_code else {
        return true;
    };
    if rule_code == "*" || rule_code.is_empty() {
        return true;
    }
    if let Some(class) = rule_code.strip_suffix("xx") {
        return class
            .parse::<u16>()
            .map(|class| actual / 100 == class)
            .unwrap_or(false);
    }
    rule_code.parse::<u16>().map(|code| code == actual).unwrap_or(false)
}
