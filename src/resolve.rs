//! Reference resolution: turns a URL found in markup into a proxy-wrapped
//! absolute URL anchored to the page (or stylesheet) it came from.

use tracing::debug;
use url::Url;

/// Schemes and prefixes that never go through the proxy.
const PASSTHROUGH_PREFIXES: &[&str] = &["data:", "blob:", "javascript:", "mailto:", "tel:", "about:"];

/// Read-only per-request state shared by every rewrite pass.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    /// The originally requested page URL. Redirects do not move it.
    pub base_url: Url,
    /// Path of the proxy endpoint, e.g. `/proxy`.
    pub proxy_endpoint: String,
}

impl RewriteContext {
    pub fn new(base_url: Url, proxy_endpoint: impl Into<String>) -> Self {
        Self {
            base_url,
            proxy_endpoint: proxy_endpoint.into(),
        }
    }

    /// `/proxy?url=` style prefix every wrapped URL starts with.
    pub fn proxy_prefix(&self) -> String {
        format!("{}?url=", self.proxy_endpoint)
    }

    /// Wraps an absolute URL into a proxy URL.
    pub fn wrap(&self, absolute: &str) -> String {
        format!("{}{}", self.proxy_prefix(), urlencoding::encode(absolute))
    }

    /// Resolves `reference` against the page URL.
    pub fn resolve(&self, reference: &str) -> String {
        resolve_against(&self.base_url, reference, self)
    }
}

/// True for references that are self-contained or not network-addressable.
pub fn is_passthrough(reference: &str) -> bool {
    let trimmed = reference.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return true;
    }
    let lower = trimmed.to_ascii_lowercase();
    PASSTHROUGH_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Directory component of a URL: everything up to and including the last `/`.
fn directory_of(base: &Url) -> String {
    let s = base.as_str();
    // Query and fragment may contain slashes of their own.
    let end = s.find(['?', '#']).unwrap_or(s.len());
    let without_query = &s[..end];
    match without_query.rfind('/') {
        Some(idx) if idx >= base.origin().ascii_serialization().len() => {
            without_query[..=idx].to_string()
        }
        _ => format!("{}/", base.origin().ascii_serialization()),
    }
}

/// Resolves `reference` against `base`, wrapping the result with the
/// context's proxy prefix.
///
/// Non-rewritable references and anything that does not end up as a
/// parseable absolute URL come back unchanged.
pub fn resolve_against(base: &Url, reference: &str, ctx: &RewriteContext) -> String {
    if is_passthrough(reference) {
        return reference.to_string();
    }

    let trimmed = reference.trim();
    if trimmed.starts_with(&ctx.proxy_prefix()) {
        return reference.to_string();
    }

    let absolute = if let Some(rest) = trimmed.strip_prefix("//") {
        format!("https://{}", rest)
    } else if trimmed.starts_with('/') {
        format!("{}{}", base.origin().ascii_serialization(), trimmed)
    } else if !trimmed.to_ascii_lowercase().starts_with("http") {
        format!("{}{}", directory_of(base), trimmed)
    } else {
        trimmed.to_string()
    };

    match Url::parse(&absolute) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => ctx.wrap(&absolute),
        _ => {
            debug!("Leaving unresolvable reference '{}' (base: {})", reference, base);
            reference.to_string()
        }
    }
}
