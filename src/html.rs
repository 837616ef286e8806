//! Document rewriting for framed pages.
//!
//! The page is streamed through `lol_html` once: restrictive meta tags are
//! dropped, URL-bearing attributes and inline styles are routed through
//! the proxy. The service-worker and script-injection passes are textual.
//! Each pass fails open and hands its input through on error.

use crate::css::rewrite_css_urls;
use crate::error::ProxyError;
use crate::inject::inject_interaction_script;
use crate::resolve::RewriteContext;
use html_escape::decode_html_entities;
use lol_html::html_content::ContentType;
use lol_html::{element, text, HtmlRewriter, Settings};
use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Stand-in for `navigator.serviceWorker.register`; callers get a promise
/// that never settles and no worker is installed.
const SERVICE_WORKER_NOOP: &str = "(function(){return new Promise(function(){})})";

static SERVICE_WORKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"navigator\s*\.\s*serviceWorker\s*\.\s*register\b")
        .expect("service worker pattern is valid")
});

/// `http-equiv` values whose meta tags are removed.
const BLOCKED_HTTP_EQUIV: &[&str] = &["content-security-policy", "x-frame-options"];

/// Attributes holding a single URL.
const URL_ATTRIBUTES: &[&str] = &["src", "href", "action"];

/// Full document pipeline.
pub fn transform_html(html: &str, ctx: &RewriteContext) -> String {
    let html = neutralize_service_workers(html);
    let html = match rewrite_document(&html, ctx) {
        Ok(rewritten) => rewritten,
        Err(e) => {
            warn!("HTML rewrite failed for '{}', passing markup through: {}", ctx.base_url, e);
            html
        }
    };
    inject_interaction_script(&html)
}

/// Replaces literal service worker registration calls with a no-op.
pub fn neutralize_service_workers(html: &str) -> String {
    SERVICE_WORKER_RE
        .replace_all(html, SERVICE_WORKER_NOOP)
        .into_owned()
}

/// Rewrites each candidate of a `srcset` list, keeping descriptors verbatim.
pub fn rewrite_srcset(srcset: &str, ctx: &RewriteContext) -> String {
    srcset
        .split(',')
        .filter_map(|candidate| {
            let mut tokens = candidate.split_whitespace();
            let url = tokens.next()?;
            let mut rewritten = ctx.resolve(url);
            for descriptor in tokens {
                rewritten.push(' ');
                rewritten.push_str(descriptor);
            }
            Some(rewritten)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn is_blocked_meta(http_equiv: &str) -> bool {
    let value = http_equiv.trim();
    BLOCKED_HTTP_EQUIV
        .iter()
        .any(|blocked| value.eq_ignore_ascii_case(blocked))
}

fn rewrite_document(html: &str, ctx: &RewriteContext) -> Result<String, ProxyError> {
    let mut output = Vec::with_capacity(html.len());
    let mut style_buffer = String::new();

    let mut handlers = vec![
        element!("meta[http-equiv]", |el| {
            if let Some(http_equiv) = el.get_attribute("http-equiv") {
                if is_blocked_meta(&http_equiv) {
                    debug!("Removing <meta http-equiv=\"{}\">", http_equiv);
                    el.remove();
                }
            }
            Ok(())
        }),
        // Rewritten stylesheets would never match their subresource hashes.
        element!("link[integrity], script[integrity]", |el| {
            el.remove_attribute("integrity");
            Ok(())
        }),
        element!("*[srcset]", |el| {
            if let Some(srcset) = el.get_attribute("srcset") {
                let srcset = decode_html_entities(&srcset);
                let rewritten = rewrite_srcset(&srcset, ctx);
                if rewritten != srcset {
                    el.set_attribute("srcset", &rewritten)?;
                }
            }
            Ok(())
        }),
        element!("*[style]", |el| {
            if let Some(style) = el.get_attribute("style") {
                let style = decode_html_entities(&style);
                let rewritten = rewrite_css_urls(&style, &ctx.base_url, ctx);
                if rewritten != style {
                    el.set_attribute("style", &rewritten)?;
                }
            }
            Ok(())
        }),
        text!("style", move |chunk| {
            // Chunks can split a url(); rewrite once the node is complete.
            style_buffer.push_str(chunk.as_str());
            if chunk.last_in_text_node() {
                let css = rewrite_css_urls(&style_buffer, &ctx.base_url, ctx);
                chunk.replace(&css, ContentType::Html);
                style_buffer.clear();
            } else {
                chunk.remove();
            }
            Ok(())
        }),
    ];

    for &attr in URL_ATTRIBUTES {
        let selector = format!("*[{}]", attr);
        handlers.push(element!(selector, move |el| {
            if let Some(raw) = el.get_attribute(attr) {
                // Attribute text is still entity-encoded (`&amp;` in queries).
                let value = decode_html_entities(&raw);
                let rewritten = ctx.resolve(&value);
                if rewritten != value {
                    debug!("Rewriting {} '{}' -> '{}'", attr, value, rewritten);
                    el.set_attribute(attr, &rewritten)?;
                }
            }
            Ok(())
        }));
    }

    let mut rewriter = HtmlRewriter::new(
        Settings {
            element_content_handlers: handlers,
            ..Settings::default()
        },
        |c: &[u8]| output.extend_from_slice(c),
    );

    rewriter
        .write(html.as_bytes())
        .map_err(|e| ProxyError::Transform(e.to_string()))?;
    rewriter
        .end()
        .map_err(|e| ProxyError::Transform(e.to_string()))?;

    String::from_utf8(output).map_err(|e| ProxyError::Transform(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use url::Url;

    fn ctx() -> RewriteContext {
        RewriteContext::new(Url::parse("https://example.com/blog/post").unwrap(), "/proxy")
    }

    #[test]
    fn test_removes_frame_and_csp_meta() {
        let html = r#"<head><meta http-equiv="X-Frame-Options" content="DENY"><meta http-equiv="Content-Security-Policy" content="default-src 'self'"><meta http-equiv="refresh" content="30"><meta charset="utf-8"></head>"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(!out.to_ascii_lowercase().contains("x-frame-options"));
        assert!(!out.to_ascii_lowercase().contains("content-security-policy"));
        assert!(out.contains(r#"<meta http-equiv="refresh" content="30">"#));
        assert!(out.contains(r#"<meta charset="utf-8">"#));
    }

    #[test]
    fn test_neutralizes_service_worker_registration() {
        let html = "<script>if ('serviceWorker' in navigator) { navigator.serviceWorker.register('/sw.js'); }</script>";
        let out = neutralize_service_workers(html);
        assert!(!out.contains("serviceWorker.register"));
        assert!(out.contains("(function(){return new Promise(function(){})})('/sw.js')"));
    }

    #[test]
    fn test_rewrites_url_attributes() {
        let html = r#"<img src="a.png"><link rel="stylesheet" href="/site.css"><form action="https://example.com/search"></form>"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(out.contains(r#"src="/proxy?url=https%3A%2F%2Fexample.com%2Fblog%2Fa.png""#));
        assert!(out.contains(r#"href="/proxy?url=https%3A%2F%2Fexample.com%2Fsite.css""#));
        assert!(out.contains(r#"action="/proxy?url=https%3A%2F%2Fexample.com%2Fsearch""#));
    }

    #[test]
    fn test_leaves_non_network_links() {
        let html = r##"<a href="#top">t</a><a href="mailto:a@b.c">m</a><a href="tel:123">p</a><a href="javascript:void(0)">j</a><img src="data:image/png;base64,AA">"##;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert_eq!(out, html);
    }

    #[test]
    fn test_srcset_keeps_descriptors() {
        let out = rewrite_srcset("a.png 1x, b.png 2x", &ctx());
        assert_eq!(
            out,
            "/proxy?url=https%3A%2F%2Fexample.com%2Fblog%2Fa.png 1x, /proxy?url=https%3A%2F%2Fexample.com%2Fblog%2Fb.png 2x"
        );
    }

    #[test]
    fn test_srcset_width_descriptors_in_document() {
        let html = r#"<img srcset="/s.jpg 480w,/l.jpg 1080w" src="/l.jpg">"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(out.contains(
            r#"srcset="/proxy?url=https%3A%2F%2Fexample.com%2Fs.jpg 480w, /proxy?url=https%3A%2F%2Fexample.com%2Fl.jpg 1080w""#
        ));
    }

    #[test]
    fn test_inline_style_and_style_block() {
        let html = r#"<style>.hero{background:url('img/hero.jpg')} .x{background:url(data:image/gif;base64,R0)}</style><div style="background-image: url(/bg.png)"></div>"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(out.contains("url('/proxy?url=https%3A%2F%2Fexample.com%2Fblog%2Fimg%2Fhero.jpg')"));
        assert!(out.contains("url(data:image/gif;base64,R0)"));
        assert!(out.contains("url(/proxy?url=https%3A%2F%2Fexample.com%2Fbg.png)"));
    }

    #[test]
    fn test_decodes_entities_in_url_attributes() {
        let html = r#"<a href="/s?a=1&amp;b=2">s</a><img src="/i?w=1&amp;h=2" srcset="/i?w=2&amp;h=4 2x">"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(out.contains(r#"href="/proxy?url=https%3A%2F%2Fexample.com%2Fs%3Fa%3D1%26b%3D2""#));
        assert!(out.contains(r#"src="/proxy?url=https%3A%2F%2Fexample.com%2Fi%3Fw%3D1%26h%3D2""#));
        assert!(out.contains(r#"srcset="/proxy?url=https%3A%2F%2Fexample.com%2Fi%3Fw%3D2%26h%3D4 2x""#));
        assert!(!out.contains("%26amp%3B"));
    }

    #[test]
    fn test_decodes_quoted_style_url() {
        let html = r#"<div style="background:url(&quot;bg.png&quot;)"></div>"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(out.contains("url(&quot;/proxy?url=https%3A%2F%2Fexample.com%2Fblog%2Fbg.png&quot;)"));
        assert!(!out.contains("%26quot%3B"));
    }

    #[test]
    fn test_untouched_attributes_keep_their_encoding() {
        let html = r##"<a href="#x&amp;y">a</a><div style="color:red;content:'a&amp;b'"></div>"##;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert_eq!(out, html);
    }

    #[test]
    fn test_strips_integrity() {
        let html = r#"<link rel="stylesheet" href="https://cdn.x.org/a.css" integrity="sha384-abc">"#;
        let out = rewrite_document(html, &ctx()).unwrap();
        assert!(!out.contains("integrity"));
    }

    #[test]
    fn test_no_base_element_is_added() {
        let out = transform_html("<html><head></head><body></body></html>", &ctx());
        assert!(!out.contains("<base"));
    }

    #[test]
    fn test_transform_is_stable_on_second_pass() {
        let html = r#"<img src="a.png" srcset="a.png 1x"><a href="/next">n</a>"#;
        let once = rewrite_document(html, &ctx()).unwrap();
        let twice = rewrite_document(&once, &ctx()).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_no_direct_third_party_references_remain() {
        let html = r#"<html><head><link rel="icon" href="//cdn.example.org/i.ico"><script src="https://cdn.example.org/app.js"></script></head><body><img src="https://cdn.example.org/p.png"><a href="https://other.example.net/">o</a></body></html>"#;
        let out = transform_html(html, &ctx());
        assert!(!out.contains(r#"="https://"#));
        assert!(!out.contains(r#"="//"#));
        assert!(out.contains("<script data-agency-injected>"));
    }
}
