//! Stage 1: parse raw email HTML into a mutable tree and serialise it back.
//!
//! html5ever (through kuchiki) follows the browser parsing algorithm, so any
//! byte string yields *some* tree: unclosed tags, stray end tags and
//! misnested tables are repaired the way a browser would repair them. There
//! is no parse error to propagate.
//!
//! A fragment and a complete document are serialised differently. The parser
//! always builds `<html><head><body>`, and moves a leading `<style>` of a
//! fragment into `<head>`; serialising head children followed by body
//! children gives back a fragment with its style blocks in source order.

use crate::error::SanitizeError;
use kuchiki::traits::TendrilSink;
use kuchiki::NodeRef;
use tracing::warn;

/// A parsed email body. Not `Send`: keep it inside one synchronous stage.
pub struct ParsedDocument {
    root: NodeRef,
    complete: bool,
}

impl ParsedDocument {
    /// Parse `html`, detecting whether it is a complete document.
    pub fn parse(html: &str) -> Self {
        Self::parse_as(html, is_complete_document(html))
    }

    /// Parse `html`, forcing the fragment/document decision.
    pub fn parse_as(html: &str, complete: bool) -> Self {
        Self {
            root: kuchiki::parse_html().one(html),
            complete,
        }
    }

    pub fn root(&self) -> &NodeRef {
        &self.root
    }

    /// Whether the input was a complete document (`<!DOCTYPE` / `<html`).
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// All element nodes in pre-order (document order).
    pub fn elements(&self) -> Vec<NodeRef> {
        self.root
            .descendants()
            .filter(|n| n.as_element().is_some())
            .collect()
    }

    /// Detach every element nested deeper than `max_depth`.
    ///
    /// Iterative, so pathological nesting cannot overflow the stack here.
    /// Returns the number of subtrees removed.
    pub fn prune_depth(&self, max_depth: usize) -> usize {
        let mut doomed = Vec::new();
        let mut stack = vec![(self.root.clone(), 0usize)];
        while let Some((node, depth)) = stack.pop() {
            for child in node.children() {
                if child.as_element().is_none() {
                    continue;
                }
                if depth + 1 > max_depth {
                    doomed.push(child);
                } else {
                    stack.push((child, depth + 1));
                }
            }
        }
        for node in &doomed {
            node.detach();
        }
        if !doomed.is_empty() {
            warn!(
                pruned = doomed.len(),
                max_depth, "Pruned subtrees nested beyond the depth limit"
            );
        }
        doomed.len()
    }

    /// Serialise the tree: the whole document when the input was complete,
    /// otherwise head children followed by body children.
    pub fn serialize(&self) -> Result<String, SanitizeError> {
        let mut buf = Vec::new();
        if self.complete {
            self.root
                .serialize(&mut buf)
                .map_err(|e| SanitizeError::Serialize(e.to_string()))?;
        } else {
            for section in ["head", "body"] {
                let Ok(container) = self.root.select_first(section) else {
                    continue;
                };
                for child in container.as_node().children() {
                    child
                        .serialize(&mut buf)
                        .map_err(|e| SanitizeError::Serialize(e.to_string()))?;
                }
            }
        }
        String::from_utf8(buf).map_err(|e| SanitizeError::Serialize(e.to_string()))
    }
}

/// Whether `html` is already a complete document: it starts with
/// `<!DOCTYPE` or `<html` (case-insensitive) after leading whitespace and BOM.
pub fn is_complete_document(html: &str) -> bool {
    let trimmed = html.trim_start_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    starts_with_ignore_case(trimmed, "<!doctype") || starts_with_ignore_case(trimmed, "<html")
}

pub(crate) fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Lowercase local name of an element node.
pub fn tag_name(node: &NodeRef) -> Option<String> {
    node.as_element().map(|e| {
        let local: &str = &e.name.local;
        local.to_ascii_lowercase()
    })
}

/// Value of attribute `name` on an element node.
pub fn attr(node: &NodeRef, name: &str) -> Option<String> {
    node.as_element()
        .and_then(|e| e.attributes.borrow().get(name).map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_complete_documents() {
        assert!(is_complete_document("  <!DOCTYPE html><p>x"));
        assert!(is_complete_document("\u{feff}<HTML><body>"));
        assert!(is_complete_document("\n<!doctype html>"));
        assert!(!is_complete_document("<div>hi</div>"));
        assert!(!is_complete_document(""));
    }

    #[test]
    fn fragment_round_trip_keeps_style_in_place() {
        let doc = ParsedDocument::parse("<style>p{color:red}</style><p>Hi</p>");
        assert!(!doc.is_complete());
        assert_eq!(doc.serialize().unwrap(), "<style>p{color:red}</style><p>Hi</p>");
    }

    #[test]
    fn malformed_markup_still_parses() {
        let doc = ParsedDocument::parse("<table><tr><td>a<td>b</table></div></span><p>");
        let html = doc.serialize().unwrap();
        assert!(html.contains("<td>a</td><td>b</td>"), "got: {html}");
    }

    #[test]
    fn complete_document_serialises_whole_tree() {
        let doc = ParsedDocument::parse("<!DOCTYPE html><html><head></head><body><p>x</p></body></html>");
        assert!(doc.is_complete());
        let html = doc.serialize().unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"), "got: {html}");
        assert!(html.contains("<body><p>x</p></body>"));
    }

    #[test]
    fn prune_depth_cuts_deep_nesting() {
        let deep = format!("{}x{}", "<div>".repeat(50), "</div>".repeat(50));
        let doc = ParsedDocument::parse(&deep);
        // html(1) > body(2) > div(3..)
        let pruned = doc.prune_depth(10);
        assert_eq!(pruned, 1);
        let max = doc
            .elements()
            .iter()
            .map(|n| n.ancestors().count())
            .max()
            .unwrap();
        assert!(max <= 10, "depth {max}");
    }

    #[test]
    fn prune_depth_noop_for_shallow_trees() {
        let doc = ParsedDocument::parse("<div><p>a</p></div>");
        assert_eq!(doc.prune_depth(256), 0);
    }

    #[test]
    fn attr_and_tag_helpers() {
        let doc = ParsedDocument::parse(r#"<IMG SRC="a.png">"#);
        let img = doc.root().select_first("img").unwrap();
        assert_eq!(tag_name(img.as_node()).as_deref(), Some("img"));
        assert_eq!(attr(img.as_node(), "src").as_deref(), Some("a.png"));
    }
}
