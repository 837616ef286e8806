//! Embedding reverse proxy.
//!
//! Fetches a third-party page on behalf of the browser and rewrites it so
//! it can be framed inside the product's own origin:
//!
//! - [`resolve`] turns references found in markup into proxy URLs.
//! - [`fetch`] performs the bounded upstream GET and classifies the body.
//! - [`html`] and [`css`] rewrite documents and stylesheets.
//! - [`inject`] carries the interaction script that talks to the parent
//!   frame over `postMessage`.
//! - [`proxy`] is the HTTP entry point, passthrough, and error page.

pub mod config;
pub mod css;
pub mod error;
pub mod fetch;
pub mod html;
pub mod inject;
pub mod proxy;
pub mod resolve;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use proxy::{router, start_proxy_server, ProxyHandle, ProxyState};
pub use resolve::RewriteContext;
