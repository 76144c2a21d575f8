//! Markup stripping for titles, abstracts and names
//!
//! Source text arrives with inline HTML (`<i>`, `<sub>`, stray `<p>`) and
//! HTML/DBLP character entities. [`plain_text`] returns only the visible text.

use scraper::{Html, Node};

/// Visible text of an HTML fragment
///
/// Content of `<script>` and `<style>` elements is dropped and entities are
/// decoded. Input without markup or entities is returned unchanged.
pub fn plain_text(raw: &str) -> String {
    if !raw.contains(['<', '&']) {
        return raw.to_string();
    }

    let fragment = Html::parse_fragment(raw);
    let mut out = String::with_capacity(raw.len());

    for node in fragment.tree.root().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| match ancestor.value() {
            Node::Element(element) => matches!(element.name(), "script" | "style"),
            _ => false,
        });
        if !hidden {
            out.push_str(text);
        }
    }

    out
}

/// Titles in several corpora end with a period that is not part of the title
pub fn strip_trailing_period(title: &str) -> &str {
    title.trim_end_matches('.')
}
