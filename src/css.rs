//! Stylesheet rewriting: `url(...)` and `@import "..."` references.

use crate::resolve::{resolve_against, RewriteContext};
use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::warn;
use url::Url;

static CSS_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^'"\)\s]*))\s*\)"#)
        .expect("css url() pattern is valid")
});

static CSS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("css @import pattern is valid")
});

/// Rewrites every `url()` in `css` against `base`.
///
/// Quoting style is preserved. `data:` and `blob:` values are left alone.
pub fn rewrite_css_urls(css: &str, base: &Url, ctx: &RewriteContext) -> String {
    let with_urls = CSS_URL_RE.replace_all(css, |caps: &Captures| {
        let (quote, value) = quoted_value(caps);
        format!("url({q}{}{q})", resolve_against(base, value, ctx), q = quote)
    });

    CSS_IMPORT_RE
        .replace_all(&with_urls, |caps: &Captures| {
            let (quote, value) = quoted_value(caps);
            format!("@import {q}{}{q}", resolve_against(base, value, ctx), q = quote)
        })
        .into_owned()
}

fn quoted_value<'c>(caps: &'c Captures) -> (&'static str, &'c str) {
    if let Some(m) = caps.get(1) {
        ("\"", m.as_str())
    } else if let Some(m) = caps.get(2) {
        ("'", m.as_str())
    } else {
        ("", caps.get(3).map_or("", |m| m.as_str()))
    }
}

/// Rewrites a stylesheet fetched from `stylesheet_url`.
///
/// Relative references resolve against the stylesheet's own directory,
/// not the page that linked it. An unparsable `stylesheet_url` leaves the
/// body untouched.
pub fn transform_css(css: &str, stylesheet_url: &str, ctx: &RewriteContext) -> String {
    match Url::parse(stylesheet_url) {
        Ok(base) => rewrite_css_urls(css, &base, ctx),
        Err(e) => {
            warn!("Not rewriting stylesheet '{}': {}", stylesheet_url, e);
            css.to_string()
        }
    }
}
