//! Stage 5: shell wrapper.
//!
//! A fragment is wrapped in a fixed minimal document with charset, viewport
//! and the head snippet. A complete document passes through untouched except
//! for the head snippet, inserted once right after the opening `<head>` tag.

use crate::pipeline::dom::{starts_with_ignore_case, ParsedDocument};
use crate::styles::SHELL_MARKER;

/// Wrap `html` for the rasterizer.
///
/// `complete` says whether `html` is already a whole document.
pub fn wrap(html: &str, complete: bool, snippet: &str, viewport_width: u32) -> String {
    if complete {
        inject_head_snippet(html, snippet)
    } else {
        format!(
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width={viewport_width}, initial-scale=1\">\
{snippet}</head><body>{html}</body></html>"
        )
    }
}

/// Insert `snippet` right after the opening `<head …>` tag, unless the
/// document head already holds the shell's style block.
///
/// Without a `<head>` the snippet goes after the opening `<html …>` tag, and
/// without either it is prepended.
pub fn inject_head_snippet(html: &str, snippet: &str) -> String {
    if has_shell_snippet(html) {
        return html.to_string();
    }
    let at = open_tag_end(html, "head")
        .or_else(|| open_tag_end(html, "html"))
        .unwrap_or(0);
    let mut out = String::with_capacity(html.len() + snippet.len());
    out.push_str(&html[..at]);
    out.push_str(snippet);
    out.push_str(&html[at..]);
    out
}

/// Whether the parsed `<head>` of `html` holds a `<style>` carrying the
/// shell marker. Text that merely looks like the marker (inside an attribute
/// value or the body) does not count.
pub fn has_shell_snippet(html: &str) -> bool {
    if !html.contains(SHELL_MARKER) {
        return false;
    }
    ParsedDocument::parse_as(html, true)
        .root()
        .select_first(&format!("head > style[{SHELL_MARKER}]"))
        .is_ok()
}

/// Byte offset just past the first `<tag …>` opening tag (case-insensitive).
fn open_tag_end(html: &str, tag: &str) -> Option<usize> {
    let needle = format!("<{tag}");
    let mut from = 0;
    while let Some(rel) = html[from..].find('<') {
        let start = from + rel;
        let rest = &html[start..];
        if starts_with_ignore_case(rest, &needle) {
            let after = rest[needle.len()..].chars().next();
            if matches!(after, Some(c) if c == '>' || c == '/' || c.is_ascii_whitespace()) {
                return rest.find('>').map(|close| start + close + 1);
            }
        }
        from = start + 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const SNIPPET: &str = "<style data-mailscribe-shell>x{}</style>";

    #[test]
    fn fragment_gets_fixed_shell() {
        let out = wrap("<p>Hi</p>", false, SNIPPET, 1200);
        assert_eq!(
            out,
            "<!DOCTYPE html><html><head><meta charset=\"utf-8\">\
<meta name=\"viewport\" content=\"width=1200, initial-scale=1\">\
<style data-mailscribe-shell>x{}</style></head><body><p>Hi</p></body></html>"
        );
    }

    #[test]
    fn complete_document_only_gains_snippet() {
        let doc = "<!DOCTYPE html><html><HEAD lang=\"en\"><title>t</title></HEAD><body><header>h</header><p>x</p></body></html>";
        let out = wrap(doc, true, SNIPPET, 1200);
        assert_eq!(out.replacen(SNIPPET, "", 1), doc);
        assert!(out.contains("<HEAD lang=\"en\"><style data-mailscribe-shell>"));
    }

    #[test]
    fn header_is_not_head() {
        let doc = "<html><header>h</header></html>";
        let out = inject_head_snippet(doc, SNIPPET);
        assert!(out.starts_with("<html><style data-mailscribe-shell>"), "got: {out}");
    }

    #[test]
    fn injection_happens_once() {
        let doc = "<!DOCTYPE html><html><head></head><body></body></html>";
        let once = inject_head_snippet(doc, SNIPPET);
        let twice = inject_head_snippet(&once, SNIPPET);
        assert_eq!(once, twice);
        assert_eq!(twice.matches(SNIPPET).count(), 1);
    }

    #[test]
    fn marker_text_outside_head_does_not_block_injection() {
        for doc in [
            r#"<!DOCTYPE html><html><head></head><body><p title="<style data-mailscribe-shell>">x</p></body></html>"#,
            "<!DOCTYPE html><html><head><title>&lt;style data-mailscribe-shell&gt;</title></head><body></body></html>",
            "<!DOCTYPE html><html><head></head><body><style data-mailscribe-shell>x{}</style></body></html>",
        ] {
            assert!(!has_shell_snippet(doc), "{doc}");
            let out = wrap(doc, true, SNIPPET, 1200);
            assert!(out.contains(&format!("<head>{SNIPPET}")), "got: {out}");
        }
    }

    #[test]
    fn headless_input_gets_snippet_prepended() {
        assert_eq!(inject_head_snippet("<p>x</p>", SNIPPET), format!("{SNIPPET}<p>x</p>"));
    }
}
