//! Error types for the embedding proxy.

use crate::fetch::FetchError;
use crate::proxy::{error_page_response, invalid_request_response};
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors surfaced by the proxy endpoint and server lifecycle.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Missing or malformed `url` parameter. Rendered as 400 + JSON.
    #[error("{0}")]
    InvalidRequest(String),

    /// Anything that went wrong talking to the upstream.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Rewrite failed: {0}")]
    Transform(String),

    #[error("Proxy bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::InvalidRequest(message) => invalid_request_response(&message),
            // Everything else must still render inside the iframe.
            other => error_page_response(&other.to_string()),
        }
    }
}
