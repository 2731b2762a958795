//! gproxy-proxy: request pipeline for gproxy
//!
//! The core of the edge proxy: policy evaluation, the header/body rule
//! engine, the tiered response cache, redirect re-encoding, asynchronous
//! request logging, and the orchestrator tying them together behind a
//! Pingora ingress.

pub mod cache;
pub mod error;
pub mod http;
pub mod ingress;
pub mod policy;
pub mod proxy;
pub mod redirect;
pub mod request_log;
pub mod rules;

pub use cache::{cache_key, is_cacheable, CacheEngine, CacheLookup};
pub use error::ProxyError;
pub use self::http::{
    error_response, header_pairs, headers_from_pairs, ProxyRequest, ProxyResponse, RouteBase,
    CACHE_STATUS_HEADER,
};
pub use ingress::{parse_proxy_path, GproxyIngress};
pub use policy::{PolicyDecision, PolicyEvaluator};
pub use proxy::{ProxyHandler, ProxyHandlerOptions};
pub use redirect::rewrite_redirect;
pub use request_log::{JsonLogSink, RequestLogger, TracingLogSink, MAX_BODY_LOG_LENGTH};
pub use rules::RuleEngine;
