use regex::Regex;
use std::sync::LazyLock;

/// The interaction layer injected into every proxied page. It speaks the
/// `agency-*` postMessage protocol with the embedding frame.
const INTERACTION_JS: &str = include_str!("assets/interaction.js");

static INTERACTION_SCRIPT: LazyLock<String> =
    LazyLock::new(|| format!("<script data-agency-injected>\n{}</script>", INTERACTION_JS));

static BODY_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("(?i)</body\\s*>").expect("body close pattern is valid"));

/// The `<script>` element as injected.
pub fn interaction_script() -> &'static str {
    &INTERACTION_SCRIPT
}

/// Inserts the interaction script before the last `</body>`, or appends it
/// when the document has none.
pub fn inject_interaction_script(html: &str) -> String {
    let script = interaction_script();
    let mut out = String::with_capacity(html.len() + script.len());
    match BODY_CLOSE_RE.find_iter(html).last() {
        Some(m) => {
            out.push_str(&html[..m.start()]);
            out.push_str(script);
            out.push_str(&html[m.start()..]);
        }
        None => {
            out.push_str(html);
            out.push_str(script);
        }
    }
    out
}
