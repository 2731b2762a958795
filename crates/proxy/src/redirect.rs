//! Redirect re-encoding into the proxy URL scheme
//!
//! An origin redirect would send the client straight to the origin on its
//! next hop; re-encoding the Location keeps it inside the proxy.

use crate::http::{ProxyResponse, RouteBase};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use reqwest::Url;
use tracing::{debug, warn};

const REDIRECT_STATUSES: &[u16] = &[301, 302, 303, 307, 308];

pub fn is_redirect(status: http::StatusCode) -> bool {
    REDIRECT_STATUSES.contains(&status.as_u16())
}

/// Rewrite a redirect's Location into `{prefix}/{protocol}/{host}{path}`.
///
/// The Location is resolved against the origin URL first, so relative
/// redirects work. When the route context is missing or the header cannot
/// be parsed, the redirect passes through unmodified rather than failing.
pub fn rewrite_redirect(
    response: ProxyResponse,
    origin_url: &Url,
    route: Option<&RouteBase>,
) -> ProxyResponse {
    if !is_redirect(response.status) {
        return response;
    }
    let Some(location) = response
        .headers
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
    else {
        return response;
    };

    let resolved = match origin_url.join(&location) {
        Ok(url) => url,
        Err(e) => {
            warn!(location = %location, error = %e, "Invalid Location header from origin, passing redirect through");
            return response;
        }
    };

    let Some(route) = route else {
        warn!(location = %location, "Missing routing context, passing redirect through");
        return response;
    };
    let Some(host) = resolved.host_str() else {
        warn!(location = %location, "Location has no host, passing redirect through");
        return response;
    };

    let host = match resolved.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let query = resolved
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let rewritten = format!(
        "{}/{}/{}{}{}",
        route.prefix,
        resolved.scheme(),
        host,
        resolved.path(),
        query
    );

    let Ok(value) = HeaderValue::try_from(rewritten.as_str()) else {
        warn!(location = %rewritten, "Rewritten Location not a valid header value, passing redirect through");
        return response;
    };

    debug!(from = %location, to = %rewritten, "Rewriting redirect into proxy scheme");
    let mut response = response;
    response.headers.insert(header::LOCATION, value);
    response.headers.remove(header::CONTENT_LENGTH);
    response.body = Bytes::new();
    response
}
