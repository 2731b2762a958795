//! Proxy orchestrator: the per-request state machine
//!
//! Resolve target → evaluate policy → (direct fetch | cache lookup →
//! origin fetch through the rule engine → redirect rewrite → conditional
//! store) → tag cache status → respond → log asynchronously.

use crate::cache::{cache_key, CacheEngine, CacheLookup};
use crate::error::ProxyError;
use crate::http::{
    error_response, header_pairs, set_forwarding_headers, strip_headers, ProxyRequest,
    ProxyResponse, CACHE_STATUS_HEADER, EDGE_HEADERS, FORWARDING_HEADERS,
    TRANSPORT_RESPONSE_HEADERS,
};
use crate::policy::PolicyEvaluator;
use crate::redirect::rewrite_redirect;
use crate::request_log::RequestLogger;
use crate::rules::RuleEngine;
use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use reqwest::Url;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{CacheStatus, ConfigStore, ProxyTarget, RequestLogEntry, RulePhase};
use tracing::{debug, error, warn};

/// Orchestrator tuning; the upstream timeout bounds every origin fetch.
#[derive(Debug, Clone)]
pub struct ProxyHandlerOptions {
    pub upstream_timeout: Duration,
}

impl Default for ProxyHandlerOptions {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
        }
    }
}

/// End-to-end request handler.
pub struct ProxyHandler {
    config: Arc<dyn ConfigStore>,
    policy: PolicyEvaluator,
    rules: RuleEngine,
    cache: CacheEngine,
    client: reqwest::Client,
    logger: Arc<RequestLogger>,
}

impl ProxyHandler {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        cache: CacheEngine,
        logger: Arc<RequestLogger>,
        options: ProxyHandlerOptions,
    ) -> Result<Self, ProxyError> {
        // Redirects are handled by the pipeline, never followed here.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(options.upstream_timeout)
            .build()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        Ok(Self {
            policy: PolicyEvaluator::new(config.clone()),
            rules: RuleEngine::new(config.clone()),
            config,
            cache,
            client,
            logger,
        })
    }

    /// Handle one decoded inbound request. Infallible at this boundary:
    /// pipeline errors become generic 5xx responses and are still logged.
    pub async fn handle(self: &Arc<Self>, req: ProxyRequest) -> ProxyResponse {
        let started = Instant::now();
        let original_url = req.original_url();

        let target = match self.config.resolve_target(&original_url).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                warn!(url = %original_url, "No active proxy target for URL");
                return error_response(
                    StatusCode::NOT_FOUND,
                    "proxy target not configured or not active for this URL",
                );
            }
            Err(e) => {
                error!(error = %e, url = %original_url, "Target resolution failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "server error while checking proxy configuration",
                );
            }
        };

        let mut entry = RequestLogEntry::new(
            Some(target.url_prefix.clone()),
            original_url.clone(),
            req.method.as_str(),
            header_pairs(&req.headers),
            req.client_ip.clone(),
        );
        if !req.body.is_empty() && req.method != Method::GET && req.method != Method::HEAD {
            entry.request_body = Some(String::from_utf8_lossy(&req.body).into_owned());
        }

        let decision = self
            .policy
            .evaluate(&original_url, Some(target.url_prefix.as_str()))
            .await;

        let result = match decision.action {
            store::PolicyAction::Direct => {
                debug!(url = %original_url, policy = ?decision.matched_policy, "Direct fetch per policy");
                self.direct(&req, &original_url, &mut entry).await
            }
            store::PolicyAction::Proxy => self.proxied(&req, &target, &mut entry).await,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, url = %original_url, "Request pipeline failed");
                let status = e.status();
                entry.error = Some(e.to_string());
                entry.status.get_or_insert(status.as_u16());
                error_response(status, "an unexpected error occurred")
            }
        };

        entry.duration_ms = started.elapsed().as_millis() as u64;
        self.logger.record(entry);
        response
    }

    /// Policy said direct: fetch the literal original URL, response
    /// returned verbatim.
    async fn direct(
        &self,
        req: &ProxyRequest,
        original_url: &str,
        entry: &mut RequestLogEntry,
    ) -> Result<ProxyResponse, ProxyError> {
        entry.cache_status = CacheStatus::Bypass;
        entry.proxied_url = original_url.to_string();

        let url =
            Url::parse(original_url).map_err(|e| ProxyError::OriginUrl(e.to_string()))?;

        let mut headers = req.headers.clone();
        strip_headers(&mut headers, EDGE_HEADERS);
        strip_headers(&mut headers, FORWARDING_HEADERS);
        set_forwarding_headers(
            &mut headers,
            &req.client_ip,
            &req.forwarded_host,
            &req.forwarded_proto,
        );

        let mut response = self
            .fetch(req.method.clone(), url, headers, req.body.clone())
            .await?;
        // The body is buffered and re-framed; the payload itself passes
        // through untouched.
        strip_headers(&mut response.headers, &["content-length", "transfer-encoding"]);
        record_response(entry, &response);
        Ok(response)
    }

    async fn proxied(
        self: &Arc<Self>,
        req: &ProxyRequest,
        target: &ProxyTarget,
        entry: &mut RequestLogEntry,
    ) -> Result<ProxyResponse, ProxyError> {
        let scope = target.url_prefix.as_str();
        let path_and_query = req.path_and_query();
        let key = cache_key(&path_and_query, Some(scope));

        match self.cache.lookup(&key).await {
            CacheLookup::Hit(mut response) => {
                debug!(key = %key, url = %entry.original_url, "Cache hit");
                entry.cache_status = CacheStatus::Hit;
                entry.proxied_url = format!("cache:{}", key);
                tag_cache_status(&mut response.headers, CacheStatus::Hit);
                record_response(entry, &response);
                return Ok(response);
            }
            CacheLookup::Stale(mut response) => {
                debug!(key = %key, url = %entry.original_url, "Serving stale entry, refreshing in background");
                entry.cache_status = CacheStatus::Stale;
                entry.proxied_url = format!("cache:{}", key);
                tag_cache_status(&mut response.headers, CacheStatus::Stale);
                self.spawn_refresh(req, target, path_and_query.clone());
                record_response(entry, &response);
                return Ok(response);
            }
            CacheLookup::Miss => {
                debug!(key = %key, url = %entry.original_url, "Cache miss");
            }
        }
        entry.cache_status = CacheStatus::Miss;

        let origin_url = build_origin_url(scope, &path_and_query)?;
        entry.proxied_url = origin_url.to_string();

        let response = self.fetch_through_rules(req, scope, &origin_url).await?;
        let response = rewrite_redirect(response, &origin_url, req.route.as_ref());

        if let Some(setting) = self.cache.match_setting(&path_and_query, Some(scope)).await {
            if let Err(e) = self
                .cache
                .store(&path_and_query, Some(scope), &req.method, &response, &setting)
                .await
            {
                warn!(error = %e, key = %key, "Failed to cache response");
            }
        }

        let mut response = response;
        tag_cache_status(&mut response.headers, CacheStatus::Miss);
        record_response(entry, &response);
        Ok(response)
    }

    /// Clean and forward the request, then run the response through the
    /// rule engine. Shared with the stale refresh path.
    async fn fetch_through_rules(
        &self,
        req: &ProxyRequest,
        scope: &str,
        origin_url: &Url,
    ) -> Result<ProxyResponse, ProxyError> {
        let mut headers = req.headers.clone();
        strip_headers(&mut headers, EDGE_HEADERS);
        strip_headers(&mut headers, FORWARDING_HEADERS);
        // Body rules need an identity-encoded body to rewrite.
        headers.remove(header::ACCEPT_ENCODING);
        set_forwarding_headers(
            &mut headers,
            &req.client_ip,
            &req.forwarded_host,
            &req.forwarded_proto,
        );
        let headers = self
            .rules
            .apply_header_rules(headers, RulePhase::Request, Some(scope))
            .await;

        let mut response = self
            .fetch(req.method.clone(), origin_url.clone(), headers, req.body.clone())
            .await?;
        strip_headers(&mut response.headers, TRANSPORT_RESPONSE_HEADERS);

        response.headers = self
            .rules
            .apply_header_rules(response.headers, RulePhase::Response, Some(scope))
            .await;
        let response = self.rules.apply_body_rules(response, Some(scope)).await;
        Ok(response)
    }

    async fn fetch(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ProxyResponse, ProxyError> {
        let mut request = self.client.request(method.clone(), url).headers(headers);
        if method != Method::GET && method != Method::HEAD && !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProxyError::UpstreamTimeout
            } else {
                ProxyError::Upstream(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(ProxyError::Upstream)?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    /// Re-fetch and re-store a stale entry off the response path.
    fn spawn_refresh(self: &Arc<Self>, req: &ProxyRequest, target: &ProxyTarget, path_and_query: String) {
        let handler = Arc::clone(self);
        let req = req.clone();
        let target = target.clone();

        tokio::spawn(async move {
            let scope = target.url_prefix.as_str();
            let origin_url = match build_origin_url(scope, &path_and_query) {
                Ok(url) => url,
                Err(e) => {
                    warn!(error = %e, "Stale refresh skipped");
                    return;
                }
            };
            let response = match handler.fetch_through_rules(&req, scope, &origin_url).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, url = %origin_url, "Stale refresh fetch failed");
                    return;
                }
            };
            let Some(setting) = handler.cache.match_setting(&path_and_query, Some(scope)).await
            else {
                return;
            };
            if let Err(e) = handler
                .cache
                .store(&path_and_query, Some(scope), &req.method, &response, &setting)
                .await
            {
                warn!(error = %e, url = %origin_url, "Stale refresh store failed");
            } else {
                debug!(url = %origin_url, "Stale entry refreshed");
            }
        });
    }

    /// Access to the cache engine for administrative invalidation.
    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }
}

/// Join the target prefix with the origin-relative path and query.
fn build_origin_url(prefix: &str, path_and_query: &str) -> Result<Url, ProxyError> {
    let base = if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    };
    let relative = path_and_query.strip_prefix('/').unwrap_or(path_and_query);

    let base = Url::parse(&base).map_err(|e| ProxyError::OriginUrl(format!("{}: {}", prefix, e)))?;
    base.join(relative)
        .map_err(|e| ProxyError::OriginUrl(format!("{}: {}", path_and_query, e)))
}

fn tag_cache_status(headers: &mut HeaderMap, status: CacheStatus) {
    headers.insert(
        HeaderName::from_static(CACHE_STATUS_HEADER),
        HeaderValue::from_static(status.as_str()),
    );
}

fn record_response(entry: &mut RequestLogEntry, response: &ProxyResponse) {
    entry.status = Some(response.status.as_u16());
    entry.response_headers = Some(header_pairs(&response.headers));

    if response.body.is_empty() {
        return;
    }
    let text_like = response
        .content_type()
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.contains("text")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("javascript")
        })
        .unwrap_or(false);
    entry.response_body = Some(if text_like {
        String::from_utf8_lossy(&response.body).into_owned()
    } else {
        "[binary or non-text body]".to_string()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{
        AsyncPolicy, CacheSetting, MemoryLogSink, MemoryStore, PolicyAction, ProxyTarget,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal single-response origin: answers every connection with the
    /// given raw HTTP response.
    async fn spawn_origin(raw_response: &'static str) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut data = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) => return,
                            Ok(n) => {
                                data.extend_from_slice(&buf[..n]);
                                if data.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let _ = socket.write_all(raw_response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        addr
    }

    struct Harness {
        handler: Arc<ProxyHandler>,
        store: Arc<MemoryStore>,
        sink: Arc<MemoryLogSink>,
    }

    fn harness(store: MemoryStore) -> Harness {
        let store = Arc::new(store);
        let sink = Arc::new(MemoryLogSink::new());
        let logger = Arc::new(RequestLogger::new(sink.clone(), 64));
        let cache = CacheEngine::new(store.clone(), store.clone(), None, 100 * 1024);
        let handler = Arc::new(
            ProxyHandler::new(
                store.clone(),
                cache,
                logger,
                ProxyHandlerOptions {
                    upstream_timeout: Duration::from_secs(5),
                },
            )
            .unwrap(),
        );
        Harness {
            handler,
            store,
            sink,
        }
    }

    fn target(prefix: &str) -> ProxyTarget {
        ProxyTarget {
            id: prefix.to_string(),
            url_prefix: prefix.to_string(),
            active: true,
            js_injection_enabled: false,
            notes: None,
        }
    }

    fn request_for(addr: std::net::SocketAddr, path: &str) -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            protocol: "http".to_string(),
            host: addr.to_string(),
            path: path.to_string(),
            query: None,
            client_ip: "203.0.113.9".to_string(),
            forwarded_host: "proxy.example.net".to_string(),
            forwarded_proto: "http".to_string(),
            route: Some(crate::http::RouteBase {
                prefix: "/proxy".to_string(),
            }),
        }
    }

    const PLAIN_OK: &str =
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    #[tokio::test]
    async fn test_miss_forwards_to_origin_and_tags_status() {
        let addr = spawn_origin(PLAIN_OK).await;
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        let h = harness(store);

        // With no cache setting configured every GET is a forwarded miss
        for _ in 0..2 {
            let response = h.handler.handle(request_for(addr, "/hello")).await;
            assert_eq!(response.status, StatusCode::OK);
            assert_eq!(&response.body[..], b"hello");
            assert_eq!(
                response.headers.get(CACHE_STATUS_HEADER).unwrap(),
                "MISS"
            );
        }
        assert_eq!(h.store.cached_entry_count(), 0);
    }

    #[tokio::test]
    async fn test_cached_roundtrip_hit() {
        let addr = spawn_origin(PLAIN_OK).await;
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        store.insert_cache_setting(CacheSetting {
            id: "all".to_string(),
            name: "all".to_string(),
            active: true,
            url_pattern: ".*".to_string(),
            duration_seconds: 60,
            stale_while_revalidate_seconds: None,
            target_scope: None,
            priority: 0,
        });
        let h = harness(store);

        let first = h.handler.handle(request_for(addr, "/hello")).await;
        assert_eq!(first.headers.get(CACHE_STATUS_HEADER).unwrap(), "MISS");
        assert_eq!(h.store.cached_entry_count(), 1);

        let second = h.handler.handle(request_for(addr, "/hello")).await;
        assert_eq!(second.headers.get(CACHE_STATUS_HEADER).unwrap(), "HIT");
        assert_eq!(second.body, first.body);
        assert_eq!(second.status, first.status);
    }

    #[tokio::test]
    async fn test_direct_policy_bypasses_proxying() {
        let addr = spawn_origin(PLAIN_OK).await;
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        store.insert_policy(AsyncPolicy {
            id: "d".to_string(),
            name: "all-direct".to_string(),
            active: true,
            url_pattern: ".*".to_string(),
            action: PolicyAction::Direct,
            target_scope: None,
            priority: 0,
        });
        let h = harness(store);

        let response = h.handler.handle(request_for(addr, "/hello")).await;
        assert_eq!(response.status, StatusCode::OK);
        // Direct responses pass through verbatim, without the cache tag
        assert!(response.headers.get(CACHE_STATUS_HEADER).is_none());

        h.handler.logger.shutdown();
        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].cache_status, CacheStatus::Bypass);
        assert_eq!(entries[0].proxied_url, entries[0].original_url);
    }

    #[tokio::test]
    async fn test_unknown_target_is_404() {
        let h = harness(MemoryStore::new());
        let addr: std::net::SocketAddr = "127.0.0.1:9".parse().unwrap();

        let response = h.handler.handle(request_for(addr, "/x")).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_502_and_logged() {
        // Nothing listens on this address
        let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        let h = harness(store);

        let response = h.handler.handle(request_for(addr, "/x")).await;
        assert_eq!(response.status, StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.content_type().as_deref(),
            Some("application/json")
        );

        h.handler.logger.shutdown();
        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].error.is_some());
        assert_eq!(entries[0].status, Some(502));
        assert_eq!(entries[0].cache_status, CacheStatus::Miss);
    }

    #[tokio::test]
    async fn test_redirect_is_reencoded_end_to_end() {
        const REDIRECT: &str = "HTTP/1.1 302 Found\r\nLocation: /new\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
        let addr = spawn_origin(REDIRECT).await;
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        let h = harness(store);

        let response = h.handler.handle(request_for(addr, "/old")).await;
        assert_eq!(response.status, StatusCode::FOUND);
        let location = response.headers.get(header::LOCATION).unwrap().to_str().unwrap();
        assert_eq!(location, format!("/proxy/http/{}/new", addr));
    }

    #[tokio::test]
    async fn test_logged_entries_for_proxied_requests() {
        let addr = spawn_origin(PLAIN_OK).await;
        let store = MemoryStore::new();
        store.insert_target(target(&format!("http://{}/", addr)));
        let h = harness(store);

        h.handler.handle(request_for(addr, "/hello")).await;
        h.handler.logger.shutdown();

        let entries = h.sink.entries();
        assert_eq!(entries.len(), 1);
        let entry = &entries[0];
        assert_eq!(entry.cache_status, CacheStatus::Miss);
        assert_eq!(entry.status, Some(200));
        assert_eq!(entry.method, "GET");
        assert!(entry.proxied_url.starts_with("http://"));
        assert_eq!(entry.response_body.as_deref(), Some("hello"));
        assert_eq!(entry.client_ip, "203.0.113.9");
    }

    #[test]
    fn test_build_origin_url_joins_prefix_and_path() {
        let url = build_origin_url("https://api.example.com", "/v1/users?page=2").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users?page=2");

        let url = build_origin_url("https://api.example.com/", "/v1/users").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/v1/users");
    }
}
