//! HTTP surface of the embedding proxy: `GET <endpoint>?url=...`.

use crate::config::ProxyConfig;
use crate::css::transform_css;
use crate::error::{ProxyError, Result};
use crate::fetch::{ContentKind, FetchResult, Fetcher};
use crate::html::transform_html;
use crate::resolve::RewriteContext;
use axum::{
    body::Body,
    extract::{Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use url::Url;

const CACHE_CONTROL_RESOURCES: &str = "public, max-age=3600";

/// Shared, immutable state handed to every request.
#[derive(Clone)]
pub struct ProxyState {
    fetcher: Fetcher,
    endpoint: Arc<str>,
}

impl ProxyState {
    pub fn new(fetcher: Fetcher, endpoint: impl Into<Arc<str>>) -> Self {
        Self {
            fetcher,
            endpoint: endpoint.into(),
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let fetcher = Fetcher::new(config.fetch_timeout())?;
        Ok(Self::new(fetcher, config.normalized_endpoint()))
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Deserialize)]
pub struct ProxyParams {
    url: Option<String>,
}

async fn log_requests(req: Request, next: Next) -> Response {
    debug!("Proxy request: {} {}", req.method(), req.uri());
    next.run(req).await
}

/// Builds the proxy router.
pub fn router(state: ProxyState) -> Router {
    let endpoint = state.endpoint().to_string();
    Router::new()
        .route(&endpoint, get(proxy_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
}

/// Handle to a running proxy server.
///
/// Dropping the handle also stops the server.
pub struct ProxyHandle {
    /// Address the server is listening on
    pub addr: SocketAddr,
    endpoint: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ProxyHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Base URL of the proxy endpoint, e.g. `http://127.0.0.1:PORT/proxy`.
    pub fn endpoint_url(&self) -> String {
        format!("http://{}{}", self.addr, self.endpoint)
    }

    /// Path the endpoint is mounted on, e.g. `/proxy`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Signal the server to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Waits for the server task to finish after [`ProxyHandle::shutdown`].
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!("Proxy server task ended abnormally: {}", e);
        }
    }
}

/// Binds the listener and spawns the server.
pub async fn start_proxy_server(config: ProxyConfig) -> Result<ProxyHandle> {
    let port = match config.port {
        0 => portpicker::pick_unused_port().ok_or_else(|| ProxyError::Bind {
            addr: config.bind_addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no free port"),
        })?,
        port => port,
    };
    let bind = SocketAddr::new(config.bind_addr, port);
    let listener = TcpListener::bind(bind).await.map_err(|source| ProxyError::Bind {
        addr: bind.to_string(),
        source,
    })?;
    let addr = listener.local_addr().map_err(|source| ProxyError::Bind {
        addr: bind.to_string(),
        source,
    })?;

    let state = ProxyState::from_config(&config)?;
    let endpoint = state.endpoint().to_string();
    let app = router(state);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("Proxy server stopped with error: {}", e);
        }
    });

    info!("Embedding proxy listening on http://{}{}", addr, endpoint);
    Ok(ProxyHandle {
        addr,
        endpoint,
        shutdown_tx,
        task,
    })
}

/// Validates the `url` query parameter.
pub fn parse_target(raw: Option<&str>) -> Result<Url> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest("Missing url parameter".to_string()))?;
    let url = Url::parse(raw)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid url parameter: {}", e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::InvalidRequest(format!(
            "Unsupported URL scheme: {}",
            other
        ))),
    }
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    Query(params): Query<ProxyParams>,
) -> Result<Response> {
    let target = parse_target(params.url.as_deref())?;
    render(&state, target).await
}

async fn render(state: &ProxyState, target: Url) -> Result<Response> {
    let fetched = state.fetcher.fetch(&target).await?;
    if fetched.final_url != target {
        debug!("'{}' redirected to '{}'", target, fetched.final_url);
    }
    let ctx = RewriteContext::new(target, state.endpoint());
    let status = fetched.status;

    match fetched.kind {
        ContentKind::Html => {
            let html = fetched.text().await?;
            Ok(html_response(status, transform_html(&html, &ctx)))
        }
        ContentKind::Css => {
            let css = fetched.text().await?;
            let body = transform_css(&css, ctx.base_url.as_str(), &ctx);
            Ok(resource_response(status, "text/css; charset=utf-8", Body::from(body)))
        }
        ContentKind::JavaScript | ContentKind::Binary => Ok(passthrough_response(fetched)),
    }
}

fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers
}

fn html_response(status: StatusCode, body: String) -> Response {
    let mut headers = cors_headers();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("ALLOWALL"));
    (status, headers, body).into_response()
}

fn resource_response(status: StatusCode, content_type: &str, body: Body) -> Response {
    let mut headers = cors_headers();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(CACHE_CONTROL_RESOURCES),
    );
    (status, headers, body).into_response()
}

/// Streams a script or binary body back byte-for-byte.
fn passthrough_response(fetched: FetchResult) -> Response {
    let status = fetched.status;
    let content_type = if fetched.content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        fetched.content_type.clone()
    };
    resource_response(status, &content_type, fetched.into_body())
}

pub(crate) fn invalid_request_response(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        cors_headers(),
        Json(json!({ "error": message })),
    )
        .into_response()
}

/// Escapes text for use inside HTML element content.
fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Self-contained page shown in the iframe when a page cannot be proxied.
pub fn error_page(message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Page could not be loaded</title>
<style>
  body {{ margin: 0; min-height: 100vh; display: flex; align-items: center; justify-content: center; background: #fafafa; color: #18181b; font-family: -apple-system, BlinkMacSystemFont, "Segoe UI", sans-serif; }}
  .card {{ max-width: 480px; padding: 24px 28px; border: 1px solid #e4e4e7; border-radius: 8px; background: #fff; }}
  h1 {{ margin: 0 0 8px; font-size: 16px; }}
  p {{ margin: 0; font-size: 13px; color: #52525b; word-break: break-word; }}
</style>
</head>
<body>
<div class="card">
  <h1>Failed to load page</h1>
  <p>{}</p>
</div>
<script>try {{ window.parent.postMessage({{ type: "agency-loaded" }}, "*"); }} catch (e) {{}}</script>
</body>
</html>
"#,
        escape_html(message)
    )
}

/// 200 response carrying [`error_page`], so the frame renders it.
pub(crate) fn error_page_response(message: &str) -> Response {
    warn!("Serving error page: {}", message);
    html_response(StatusCode::OK, error_page(message))
}
