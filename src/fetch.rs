//! Outbound fetching of proxied resources.

use axum::body::Body;
use axum::http::{header, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use url::Url;

/// Fixed budget for a single upstream fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8";
const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Any upstream failure. The message is shown to the user verbatim.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} timed out after {} seconds", .after.as_secs_f32())]
    Timeout { url: String, after: Duration },

    #[error("{0}")]
    Upstream(String),
}

impl FetchError {
    /// Maps a client error, keeping timeouts distinct so the message names
    /// the configured limit.
    fn from_reqwest(err: reqwest::Error, url: &Url, after: Duration) -> Self {
        if err.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
                after,
            }
        } else {
            err.into()
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Upstream(describe_error(&err))
    }
}

/// Error message with the innermost cause appended (DNS, TLS, refused...).
pub fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let message = err.to_string();
    let mut root = None;
    let mut next = err.source();
    while let Some(cause) = next {
        root = Some(cause);
        next = cause.source();
    }
    match root.map(|cause| cause.to_string()) {
        Some(cause) if !message.contains(&cause) => format!("{}: {}", message, cause),
        _ => message,
    }
}

/// How the body of a response is handled, decided from its content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    JavaScript,
    Binary,
}

impl ContentKind {
    /// Classifies a raw `Content-Type` value, parameters included.
    pub fn classify(content_type: &str) -> Self {
        let ct = content_type.to_ascii_lowercase();
        if ct.contains("text/html") || ct.contains("application/xhtml") {
            ContentKind::Html
        } else if ct.contains("text/css") {
            ContentKind::Css
        } else if ct.contains("javascript") {
            ContentKind::JavaScript
        } else {
            ContentKind::Binary
        }
    }
}

/// A response whose headers arrived within the deadline.
///
/// The body is not read yet; callers pick text or streaming based on
/// [`FetchResult::kind`].
#[derive(Debug)]
pub struct FetchResult {
    pub status: StatusCode,
    pub content_type: String,
    pub kind: ContentKind,
    /// URL after redirects. Rewriting stays anchored to the requested URL.
    pub final_url: Url,
    response: reqwest::Response,
    deadline: Instant,
    timeout: Duration,
    requested: Url,
}

impl FetchResult {
    /// Reads the whole body as text, still bounded by the fetch deadline.
    pub async fn text(self) -> Result<String, FetchError> {
        let FetchResult {
            response,
            deadline,
            timeout,
            requested,
            ..
        } = self;
        match timeout_at(deadline, response.text()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(e)) => Err(FetchError::from_reqwest(e, &requested, timeout)),
            Err(_) => Err(FetchError::Timeout {
                url: requested.to_string(),
                after: timeout,
            }),
        }
    }

    /// Hands the body over as a stream without buffering it.
    ///
    /// The request timeout keeps running while the body streams. On expiry
    /// the stream ends with an error and the upstream connection is dropped.
    pub fn into_body(self) -> Body {
        Body::from_stream(self.response.bytes_stream())
    }
}

/// Shared outbound client. Holds no per-request state.
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// GETs `url` with browser-like headers.
    ///
    /// The whole exchange, body included, is bounded by the fetcher's
    /// timeout. Dropping the in-flight future on expiry tears down the
    /// connection.
    pub async fn fetch(&self, url: &Url) -> Result<FetchResult, FetchError> {
        let deadline = Instant::now() + self.timeout;
        let request = self
            .client
            .get(url.clone())
            .header(header::USER_AGENT, BROWSER_USER_AGENT)
            .header(header::ACCEPT, BROWSER_ACCEPT)
            .header(header::ACCEPT_LANGUAGE, BROWSER_ACCEPT_LANGUAGE)
            .header(header::ACCEPT_ENCODING, "identity")
            .timeout(self.timeout)
            .send();

        let response = match timeout_at(deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let err = FetchError::from_reqwest(e, url, self.timeout);
                warn!("Fetch failed for '{}': {}", url, err);
                return Err(err);
            }
            Err(_) => {
                warn!("Fetch timed out for '{}' after {:?}", url, self.timeout);
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    after: self.timeout,
                });
            }
        };

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let kind = ContentKind::classify(&content_type);
        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);

        debug!(
            "Upstream {} for '{}' (final: {}, content-type: '{}', kind: {:?})",
            status,
            url,
            response.url(),
            content_type,
            kind
        );

        Ok(FetchResult {
            status,
            content_type,
            kind,
            final_url: response.url().clone(),
            response,
            deadline,
            timeout: self.timeout,
            requested: url.clone(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_html_with_charset() {
        assert_eq!(ContentKind::classify("text/html; charset=utf-8"), ContentKind::Html);
        assert_eq!(ContentKind::classify("TEXT/HTML"), ContentKind::Html);
        assert_eq!(ContentKind::classify("application/xhtml+xml"), ContentKind::Html);
    }

    #[test]
    fn test_classify_css_and_js() {
        assert_eq!(ContentKind::classify("text/css;charset=UTF-8"), ContentKind::Css);
        assert_eq!(ContentKind::classify("application/javascript"), ContentKind::JavaScript);
        assert_eq!(ContentKind::classify("text/javascript; charset=utf-8"), ContentKind::JavaScript);
        assert_eq!(ContentKind::classify("application/x-javascript"), ContentKind::JavaScript);
    }

    #[test]
    fn test_classify_defaults_to_binary() {
        assert_eq!(ContentKind::classify(""), ContentKind::Binary);
        assert_eq!(ContentKind::classify("image/png"), ContentKind::Binary);
        assert_eq!(ContentKind::classify("font/woff2"), ContentKind::Binary);
    }

    #[test]
    fn test_timeout_message_names_url() {
        let err = FetchError::Timeout {
            url: "https://example.com/".to_string(),
            after: Duration::from_secs(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("https://example.com/"));
        assert!(msg.contains("timed out after 10 seconds"));
    }

    #[derive(Error, Debug)]
    #[error("error sending request")]
    struct Outer(#[source] Middle);

    #[derive(Error, Debug)]
    #[error("tcp connect error")]
    struct Middle(#[source] std::io::Error);

    #[test]
    fn test_describe_error_appends_root_cause() {
        let err = Outer(Middle(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "Connection refused (os error 111)",
        )));
        assert_eq!(
            describe_error(&err),
            "error sending request: Connection refused (os error 111)"
        );
    }

    #[test]
    fn test_describe_error_without_source() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(describe_error(&err), "boom");
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_fetch_error() {
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();
        let url = Url::parse("http://nonexistent.invalid/").unwrap();
        assert!(fetcher.fetch(&url).await.is_err());
    }
}
