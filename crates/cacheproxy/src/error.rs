use crate::codec::{DecodeError, EncodeError};
use cacheproxy_store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Failures of the cache repository. None of these reach the client.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache entry not found")]
    NotFound,

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("cache task failed: {0}")]
    Task(String),
}

impl From<StoreError> for CacheError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => CacheError::NotFound,
            other => CacheError::Store(other),
        }
    }
}

/// Failures while relaying a request to the origin.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("failed to rewrite request for origin: {0}")]
    Director(#[from] axum::http::uri::InvalidUriParts),

    #[error("origin unreachable: {0}")]
    Unreachable(#[from] hyper_util::client::legacy::Error),

    #[error("origin did not answer within {0:?}")]
    Timeout(Duration),

    #[error("failed to read origin response body: {0}")]
    Body(#[source] axum::BoxError),
}

/// Startup and serving failures of the proxy front-end.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid target url {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("unsupported target scheme {0:?}, only http and https origins are supported")]
    UnsupportedScheme(String),

    #[error("failed to set up the origin TLS client: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),

    #[error("connections still open after {0:?} drain window")]
    DrainTimeout(Duration),
}
