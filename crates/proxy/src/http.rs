//! HTTP value types threaded through the proxy pipeline
//!
//! The pipeline never mutates a shared response: each stage takes a
//! `ProxyResponse` by value and returns a new one.

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};

/// Response header carrying the cache disposition of a proxied response.
pub const CACHE_STATUS_HEADER: &str = "x-gproxy-cache-status";

/// Edge-internal headers never forwarded to an origin.
pub const EDGE_HEADERS: &[&str] = &[
    "cf-connecting-ip",
    "cf-ipcountry",
    "cf-ray",
    "cf-visitor",
    "cf-worker",
];

/// Inbound headers replaced by the proxy's own routing context.
/// Host and Content-Length are re-derived by the outbound transport.
pub const FORWARDING_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-real-ip",
];

/// Origin response headers invalidated by buffering and body rewriting.
pub const TRANSPORT_RESPONSE_HEADERS: &[&str] =
    &["content-encoding", "content-length", "transfer-encoding"];

/// Where the inbound request entered the proxy URL scheme; needed to
/// re-encode redirects so the client's next hop stays inside the proxy.
#[derive(Debug, Clone)]
pub struct RouteBase {
    /// Path prefix of the proxy scheme, e.g. `/proxy`.
    pub prefix: String,
}

/// A decoded inbound request.
///
/// `protocol`, `host`, `path` and `query` come from the routing layer
/// parsing `/proxy/{protocol}/{host}/{path...}`.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub protocol: String,
    pub host: String,
    /// Origin-relative path, always starting with `/`.
    pub path: String,
    /// Query string without the leading `?`.
    pub query: Option<String>,
    pub client_ip: String,
    /// Host the client used to reach the proxy.
    pub forwarded_host: String,
    /// Scheme the client used to reach the proxy.
    pub forwarded_proto: String,
    pub route: Option<RouteBase>,
}

impl ProxyRequest {
    /// The URL the client intended to access, reconstructed from the
    /// decoded routing parameters.
    pub fn original_url(&self) -> String {
        format!(
            "{}://{}{}",
            self.protocol,
            self.host,
            self.path_and_query()
        )
    }

    /// Origin-relative path plus query, the input to target joining and
    /// cache keying.
    pub fn path_and_query(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }
}

/// An origin (or cached, or synthesized) response on its way to the client.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
    }

    /// Replace the body with rewritten text, invalidating Content-Length.
    pub fn with_text_body(mut self, body: String) -> Self {
        self.headers.remove(header::CONTENT_LENGTH);
        self.body = Bytes::from(body);
        self
    }
}

/// Generic JSON error response; the message never carries internal detail.
pub fn error_response(status: StatusCode, message: &str) -> ProxyResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = ProxyResponse::new(status);
    response
        .headers
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response.body = Bytes::from(body);
    response
}

/// Delete every value of each named header.
pub fn strip_headers(headers: &mut HeaderMap, names: &[&str]) {
    for name in names {
        while headers.remove(*name).is_some() {}
    }
}

/// Express the original client context towards the origin.
pub fn set_forwarding_headers(headers: &mut HeaderMap, client_ip: &str, host: &str, proto: &str) {
    let mut set = |name: &'static str, value: &str| {
        if let Ok(value) = HeaderValue::try_from(value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    set("x-forwarded-for", client_ip);
    set("x-forwarded-host", host);
    set("x-forwarded-proto", proto);
}

/// Serialize headers for storage and logging. Non-UTF-8 values are
/// replaced lossily.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Rebuild a header map from stored pairs, skipping anything unparseable.
pub fn headers_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) else {
            continue;
        };
        headers.append(name, value);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ProxyRequest {
        ProxyRequest {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            protocol: "https".to_string(),
            host: "api.example.com".to_string(),
            path: "/v1/users".to_string(),
            query: Some("page=2".to_string()),
            client_ip: "203.0.113.9".to_string(),
            forwarded_host: "proxy.example.net".to_string(),
            forwarded_proto: "http".to_string(),
            route: None,
        }
    }

    #[test]
    fn test_original_url() {
        assert_eq!(
            request().original_url(),
            "https://api.example.com/v1/users?page=2"
        );

        let mut req = request();
        req.query = None;
        assert_eq!(req.original_url(), "https://api.example.com/v1/users");
    }

    #[test]
    fn test_strip_headers_removes_all_values() {
        let mut headers = HeaderMap::new();
        headers.append("cf-ray", HeaderValue::from_static("a"));
        headers.append("cf-ray", HeaderValue::from_static("b"));
        headers.append("accept", HeaderValue::from_static("*/*"));

        strip_headers(&mut headers, EDGE_HEADERS);

        assert!(headers.get("cf-ray").is_none());
        assert!(headers.get("accept").is_some());
    }

    #[test]
    fn test_header_pairs_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let rebuilt = headers_from_pairs(&header_pairs(&headers));
        let values: Vec<_> = rebuilt.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_error_response_is_generic_json() {
        let response = error_response(StatusCode::INTERNAL_SERVER_ERROR, "an unexpected error occurred");
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.content_type().as_deref(),
            Some("application/json")
        );
        assert_eq!(
            &response.body[..],
            br#"{"error":"an unexpected error occurred"}"#
        );
    }
}
