//! Pingora ingress for the proxy URL scheme
//!
//! Decodes `/proxy/{protocol}/{host}/{path...}`, buffers the request body
//! and hands the request to the orchestrator; every request is answered
//! in the request filter, nothing proxies through Pingora upstreams.

use crate::http::{error_response, ProxyRequest, ProxyResponse, RouteBase};
use crate::proxy::ProxyHandler;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use pingora::prelude::*;
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Per-request context
pub struct IngressCtx {
    pub request_start: Instant,
}

/// HTTP front door for gproxy.
#[derive(Clone)]
pub struct GproxyIngress {
    handler: Arc<ProxyHandler>,
    route_prefix: String,
}

impl GproxyIngress {
    pub fn new(handler: Arc<ProxyHandler>, route_prefix: impl Into<String>) -> Self {
        Self {
            handler,
            route_prefix: route_prefix.into(),
        }
    }

    fn client_ip(&self, session: &Session) -> String {
        session
            .client_addr()
            .map(|a| {
                let s = a.to_string();
                s.split(':').next().unwrap_or(&s).to_string()
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn send_response(
        &self,
        session: &mut Session,
        response: ProxyResponse,
    ) -> Result<bool> {
        let mut header = ResponseHeader::build(response.status, None)?;
        for (name, value) in response.headers.iter() {
            if let Ok(value) = value.to_str() {
                header.append_header(name.as_str().to_string(), value.to_string())?;
            }
        }
        header.insert_header("Content-Length", response.body.len().to_string())?;
        header.insert_header("Server", "gproxy")?;

        session
            .write_response_header(Box::new(header), response.body.is_empty())
            .await?;
        if !response.body.is_empty() {
            session
                .write_response_body(Some(response.body), true)
                .await?;
        }
        Ok(true)
    }
}

/// Split a proxy-scheme path into `(protocol, host, origin path)`.
pub fn parse_proxy_path<'a>(prefix: &str, path: &'a str) -> Option<(&'a str, &'a str, String)> {
    let rest = path.strip_prefix(prefix)?;
    let rest = rest.strip_prefix('/')?;

    let (protocol, rest) = rest.split_once('/')?;
    if protocol.is_empty() {
        return None;
    }
    let (host, origin_path) = match rest.split_once('/') {
        Some((host, tail)) => (host, format!("/{}", tail)),
        None => (rest, "/".to_string()),
    };
    if host.is_empty() {
        return None;
    }
    Some((protocol, host, origin_path))
}

#[async_trait]
impl ProxyHttp for GproxyIngress {
    type CTX = IngressCtx;

    fn new_ctx(&self) -> Self::CTX {
        IngressCtx {
            request_start: Instant::now(),
        }
    }

    async fn request_filter(&self, session: &mut Session, _ctx: &mut Self::CTX) -> Result<bool> {
        let path = session.req_header().uri.path().to_string();

        if path == "/health" || path == "/healthz" {
            let body = r#"{"status":"healthy"}"#;
            let mut header = ResponseHeader::build(StatusCode::OK, None)?;
            header.insert_header("Content-Type", "application/json")?;
            header.insert_header("Content-Length", body.len().to_string())?;
            header.insert_header("Server", "gproxy")?;

            session.write_response_header(Box::new(header), false).await?;
            session
                .write_response_body(Some(body.into()), true)
                .await?;
            return Ok(true);
        }

        let Some((protocol, host, origin_path)) = parse_proxy_path(&self.route_prefix, &path)
        else {
            let response = error_response(
                StatusCode::BAD_REQUEST,
                "invalid proxy request format: expected /proxy/{protocol}/{host}/{path}",
            );
            return self.send_response(session, response).await;
        };

        let method = session.req_header().method.clone();
        let headers = session.req_header().headers.clone();
        let query = session.req_header().uri.query().map(|q| q.to_string());
        let client_ip = self.client_ip(session);
        let forwarded_host = headers
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut body = Vec::new();
        if method != Method::GET && method != Method::HEAD {
            while let Some(chunk) = session.read_request_body().await? {
                body.extend_from_slice(&chunk);
            }
        }

        let request = ProxyRequest {
            method,
            headers,
            body: Bytes::from(body),
            protocol: protocol.to_string(),
            host: host.to_string(),
            path: origin_path,
            query,
            client_ip,
            forwarded_host,
            // TLS termination is out of scope, listeners are plain TCP
            forwarded_proto: "http".to_string(),
            route: Some(RouteBase {
                prefix: self.route_prefix.clone(),
            }),
        };

        let response = self.handler.handle(request).await;
        self.send_response(session, response).await
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        // Unreachable: every request terminates in request_filter.
        Err(pingora_core::Error::new(
            pingora_core::ErrorType::ConnectProxyFailure,
        ))
    }

    async fn logging(
        &self,
        session: &mut Session,
        _e: Option<&pingora_core::Error>,
        ctx: &mut Self::CTX,
    ) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);
        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let duration_ms = ctx.request_start.elapsed().as_millis() as u64;

        info!(method = %method, path = %path, status = %status, duration_ms = %duration_ms, "Request completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_path() {
        let (protocol, host, path) =
            parse_proxy_path("/proxy", "/proxy/https/api.example.com/v1/users").unwrap();
        assert_eq!(protocol, "https");
        assert_eq!(host, "api.example.com");
        assert_eq!(path, "/v1/users");
    }

    #[test]
    fn test_parse_proxy_path_bare_host() {
        let (protocol, host, path) =
            parse_proxy_path("/proxy", "/proxy/http/example.com").unwrap();
        assert_eq!(protocol, "http");
        assert_eq!(host, "example.com");
        assert_eq!(path, "/");
    }

    #[test]
    fn test_parse_proxy_path_with_port() {
        let (_, host, path) =
            parse_proxy_path("/proxy", "/proxy/http/127.0.0.1:8081/deep/path/x").unwrap();
        assert_eq!(host, "127.0.0.1:8081");
        assert_eq!(path, "/deep/path/x");
    }

    #[test]
    fn test_parse_proxy_path_rejects_malformed() {
        assert!(parse_proxy_path("/proxy", "/other/https/h/p").is_none());
        assert!(parse_proxy_path("/proxy", "/proxy").is_none());
        assert!(parse_proxy_path("/proxy", "/proxy/https").is_none());
        assert!(parse_proxy_path("/proxy", "/proxy//host/p").is_none());
        assert!(parse_proxy_path("/proxy", "/proxy/https//p").is_none());
    }
}
