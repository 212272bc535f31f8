//! HTML sanitization for entry content and summaries.
//!
//! Deny-by-default: only the tags and attributes explicitly allowlisted
//! below survive. Scripts, iframes, embeds, forms, and `javascript:`/`data:`
//! URIs are always stripped, not merely escaped. External links are forced
//! to `target="_blank" rel="noopener noreferrer"` so a malicious feed can't
//! use `window.opener` to manipulate the planet page that linked to it.

use std::collections::HashSet;

use ammonia::Builder;

fn builder() -> Builder<'static> {
    let mut b = Builder::new();

    b.tags(HashSet::from([
        "h1", "h2", "h3", "h4", "h5", "h6", "p", "br", "hr", "ul", "ol", "li", "blockquote", "a",
        "img", "code", "pre", "em", "strong", "b", "i", "u", "s", "del", "ins", "sub", "sup",
        "table", "thead", "tbody", "tr", "th", "td", "span", "div",
    ]));

    b.tag_attributes(std::collections::HashMap::from([
        ("a", HashSet::from(["href", "title"])),
        ("img", HashSet::from(["src", "alt", "title", "width", "height"])),
        ("td", HashSet::from(["colspan", "rowspan"])),
        ("th", HashSet::from(["colspan", "rowspan"])),
    ]));

    b.url_schemes(HashSet::from(["http", "https", "mailto"]));
    b.link_rel(Some("noopener noreferrer"));
    b.generic_attributes(HashSet::new());

    b
}

/// Sanitizes an HTML fragment per the allowlist above. External `<a>` tags
/// are rewritten to open in a new tab; disallowed tags/attributes and
/// `javascript:`/`data:` URIs are removed entirely.
pub fn sanitize_html(input: &str) -> String {
    let mut b = builder();
    b.add_tag_attribute_values("a", "target", ["_blank"]);
    b.clean(input).to_string()
}

/// Strips all markup, keeping only text content. Used for fields the spec
/// treats as HTML-bearing but that should render as plain text — feed and
/// entry titles, which Atom permits to carry `type="html"` but which this
/// aggregator always displays unstyled.
pub fn sanitize_text_only(input: &str) -> String {
    let mut b = Builder::new();
    b.tags(HashSet::new());
    b.clean(input).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_script_tags() {
        let out = sanitize_html("<p>hello</p><script>alert(1)</script>");
        assert!(!out.contains("script"));
        assert!(out.contains("hello"));
    }

    #[test]
    fn strips_javascript_uri() {
        let out = sanitize_html(r#"<a href="javascript:alert(1)">click</a>"#);
        assert!(!out.contains("javascript:"));
    }

    #[test]
    fn strips_data_uri_in_href() {
        let out = sanitize_html(r#"<a href="data:text/html,<script>alert(1)</script>">x</a>"#);
        assert!(!out.contains("data:"));
    }

    #[test]
    fn strips_on_event_handlers() {
        let out = sanitize_html(r#"<img src="https://example.com/a.png" onerror="alert(1)">"#);
        assert!(!out.contains("onerror"));
    }

    #[test]
    fn forces_target_blank_on_links() {
        let out = sanitize_html(r#"<a href="https://example.com">link</a>"#);
        assert!(out.contains("target=\"_blank\""));
        assert!(out.contains("rel="));
        assert!(out.contains("noopener"));
    }

    #[test]
    fn allows_safe_image() {
        let out = sanitize_html(r#"<img src="https://example.com/a.png" alt="x">"#);
        assert!(out.contains("<img"));
        assert!(out.contains("https://example.com/a.png"));
    }

    #[test]
    fn preserves_plain_text() {
        let out = sanitize_html("just some text");
        assert_eq!(out, "just some text");
    }

    #[test]
    fn empty_input_sanitizes_to_empty() {
        assert_eq!(sanitize_html(""), "");
    }

    #[test]
    fn strips_iframe_and_object() {
        let out = sanitize_html(r#"<iframe src="https://evil.example"></iframe><object data="x"></object>"#);
        assert!(!out.contains("iframe"));
        assert!(!out.contains("object"));
    }

    #[test]
    fn text_only_strips_markup_but_keeps_content() {
        let out = sanitize_text_only("<b>Breaking</b>: <script>alert(1)</script>news");
        assert_eq!(out, "Breaking: news");
    }

    #[test]
    fn text_only_preserves_plain_text() {
        assert_eq!(sanitize_text_only("just a title"), "just a title");
    }

    #[test]
    fn strips_form_tags() {
        let out = sanitize_html(r#"<form action="https://evil.example"><input type="text"></form>"#);
        assert!(!out.contains("<form"));
        assert!(!out.contains("<input"));
    }
}
