//! Error types for the gproxy pipeline

use http::StatusCode;
use store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid origin URL: {0}")]
    OriginUrl(String),

    #[error("Upstream request failed: {0}")]
    Upstream(reqwest::Error),

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl ProxyError {
    /// Client-visible status for a pipeline failure. Only the class leaks,
    /// never the message.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::Config(_) | ProxyError::OriginUrl(_) | ProxyError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
