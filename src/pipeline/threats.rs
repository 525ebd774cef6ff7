//! Stage 2: threat stripper.
//!
//! Removes every construct that can execute code, navigate, or pull live
//! content into the render: forbidden element subtrees, event handler
//! attributes, script-bearing URLs, offending style blocks, comments.
//! Nothing here reports errors: hostile input is routine input.
//!
//! The walk is pre-order and never descends into a removed subtree, so the
//! result depends only on the input tree and the policy. Running it twice
//! removes nothing the second time.

use crate::config::SanitizationPolicy;
use crate::error::SanitizeError;
use crate::pipeline::css;
use crate::pipeline::dom::{self, ParsedDocument};
use crate::pipeline::layout::{self, LayoutReport};
use kuchiki::{ElementData, NodeData, NodeRef};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

/// Reserved attribute prefix used internally by the pipeline; never accepted
/// from input.
pub const RESERVED_ATTRIBUTE_PREFIX: &str = "data-mailscribe-";

/// Event handler attribute names (`onclick`, `OnLoad`, `onmouseover`, …).
static EVENT_HANDLER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^on[a-z]+").expect("valid regex"));

/// Attributes whose value is fetched or navigated to.
const URL_ATTRIBUTES: &[&str] = &[
    "href",
    "src",
    "action",
    "formaction",
    "background",
    "poster",
    "lowsrc",
    "dynsrc",
    "cite",
    "longdesc",
    "usemap",
    "xlink:href",
    "data",
    "codebase",
];

/// Attributes removed under every policy. `srcset` would let the renderer
/// bypass image resolution.
const ALWAYS_REMOVED_ATTRIBUTES: &[&str] = &["srcset", "imagesrcset", "ping", "nonce"];

/// Roots of foreign (non-HTML) content, where the parser's rules differ.
const FOREIGN_ROOTS: &[&str] = &["svg", "math"];

/// SVG elements that can rewrite attributes (including `href`) at render time.
const SCRIPTABLE_SVG_TAGS: &[&str] = &[
    "animate",
    "animatemotion",
    "animatetransform",
    "set",
    "handler",
    "listener",
];

/// URL schemes that may appear in a kept attribute.
const SAFE_SCHEMES: &[&str] = &["http", "https", "mailto", "tel", "cid", "data"];

/// Counters reported by [`strip`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StripReport {
    pub removed_elements: usize,
    pub removed_attributes: usize,
    pub removed_style_blocks: usize,
}

/// Strip threats from `doc` in place according to `policy`.
pub fn strip(doc: &ParsedDocument, policy: &SanitizationPolicy) -> StripReport {
    let mut report = StripReport::default();
    let mut stack: Vec<(NodeRef, bool)> =
        doc.root().children().rev().map(|n| (n, false)).collect();

    while let Some((node, mut foreign)) = stack.pop() {
        match node.data() {
            NodeData::Comment(_) | NodeData::ProcessingInstruction(_) => {
                node.detach();
                continue;
            }
            NodeData::Element(element) => {
                let tag = {
                    let local: &str = &element.name.local;
                    local.to_ascii_lowercase()
                };
                if let Some(reason) = removal_reason(&node, element, &tag, policy) {
                    debug!(tag = %tag, ?reason, "Removed element");
                    match reason {
                        Removal::OffendingStyle => report.removed_style_blocks += 1,
                        _ => report.removed_elements += 1,
                    }
                    node.detach();
                    continue;
                }
                foreign = foreign || FOREIGN_ROOTS.contains(&tag.as_str());
                report.removed_attributes += clean_attributes(element, &tag, foreign, policy);
            }
            _ => {}
        }
        stack.extend(node.children().rev().map(|child| (child, foreign)));
    }

    report
}

/// Strip, normalise and re-parse until a serialise/parse cycle changes
/// nothing.
///
/// The rasterizer re-parses the serialised output. Inside `<svg>` and
/// `<math>` that re-parse can build a different tree (a `<p>` leaves the
/// foreign subtree and a following `<style>` turns back into raw text), so
/// a tree that is clean in memory can still serialise to live markup.
/// Each round re-parses the previous output and strips it again. When the
/// rounds run out, foreign subtrees are dropped entirely.
pub fn settle(
    doc: ParsedDocument,
    policy: &SanitizationPolicy,
    max_rounds: usize,
) -> Result<Settled, SanitizeError> {
    let mut settled = Settled {
        strip: strip(&doc, policy),
        layout: layout::normalize(&doc, policy),
        rounds: 0,
        doc,
    };

    let mut html = settled.doc.serialize()?;
    while settled.rounds < max_rounds {
        let reparsed = ParsedDocument::parse_as(&html, settled.doc.is_complete());
        settled.strip += strip(&reparsed, policy);
        settled.layout.removed_declarations +=
            layout::normalize(&reparsed, policy).removed_declarations;
        let again = reparsed.serialize()?;
        settled.doc = reparsed;
        if again == html {
            return Ok(settled);
        }
        settled.rounds += 1;
        html = again;
    }

    warn!(
        rounds = settled.rounds,
        "Markup kept changing across re-parses; dropping svg and math subtrees"
    );
    let reparsed = ParsedDocument::parse_as(&html, settled.doc.is_complete());
    let is_foreign_root =
        |n: &NodeRef| dom::tag_name(n).is_some_and(|t| FOREIGN_ROOTS.contains(&t.as_str()));
    let outermost: Vec<NodeRef> = reparsed
        .elements()
        .into_iter()
        .filter(|n| is_foreign_root(n) && !n.ancestors().any(|a| is_foreign_root(&a)))
        .collect();
    settled.strip.removed_elements += outermost.len();
    for node in outermost {
        node.detach();
    }
    settled.strip += strip(&reparsed, policy);
    settled.layout.removed_declarations +=
        layout::normalize(&reparsed, policy).removed_declarations;
    settled.doc = reparsed;
    Ok(settled)
}

/// Result of [`settle`].
pub struct Settled {
    /// The final tree, stable under serialise then parse.
    pub doc: ParsedDocument,
    pub strip: StripReport,
    pub layout: LayoutReport,
    /// Re-parse rounds that still changed the markup.
    pub rounds: usize,
}

impl std::ops::AddAssign for StripReport {
    fn add_assign(&mut self, other: Self) {
        self.removed_elements += other.removed_elements;
        self.removed_attributes += other.removed_attributes;
        self.removed_style_blocks += other.removed_style_blocks;
    }
}

/// Why an element subtree is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    ForbiddenTag,
    ScriptableSvg,
    OffendingStyle,
    NonStylesheetLink,
    MetaRefresh,
}

/// Why `node` must be removed entirely, or `None` to keep it.
fn removal_reason(
    node: &NodeRef,
    element: &ElementData,
    tag: &str,
    policy: &SanitizationPolicy,
) -> Option<Removal> {
    if policy.forbids_tag(tag) {
        return Some(Removal::ForbiddenTag);
    }
    if SCRIPTABLE_SVG_TAGS.contains(&tag) {
        return Some(Removal::ScriptableSvg);
    }
    match tag {
        "style" => (node.children().any(|c| c.as_text().is_none())
            || is_offending_style_block(&node.text_contents()))
        .then_some(Removal::OffendingStyle),
        "link" => {
            let attrs = element.attributes.borrow();
            let keep = policy.keep_stylesheet_links
                && attrs.get("rel").is_some_and(|rel| {
                    rel.split_ascii_whitespace()
                        .any(|t| t.eq_ignore_ascii_case("stylesheet"))
                })
                && attrs.get("href").is_some_and(is_http_url);
            (!keep).then_some(Removal::NonStylesheetLink)
        }
        "meta" => element
            .attributes
            .borrow()
            .get("http-equiv")
            .filter(|v| v.trim().eq_ignore_ascii_case("refresh"))
            .map(|_| Removal::MetaRefresh),
        _ => None,
    }
}

/// A style block is dropped when it contains an offending construct, or
/// any `<`, which has no business in CSS and can smuggle markup past a
/// re-parse.
pub fn is_offending_style_block(text: &str) -> bool {
    text.contains('<') || css::is_offending(text)
}

/// Remove disallowed attributes from one element. Returns how many were
/// removed.
///
/// Inside foreign content an attribute value holding `<` is dropped too: the
/// serialiser leaves it unescaped and a re-parse can read it as markup.
fn clean_attributes(
    element: &ElementData,
    tag: &str,
    foreign: bool,
    policy: &SanitizationPolicy,
) -> usize {
    let mut attrs = element.attributes.borrow_mut();
    let before = attrs.map.len();
    attrs.map.retain(|name, attr| {
        let local: &str = &name.local;
        let keep = !(foreign && attr.value.contains('<'))
            && keep_attribute(tag, local, &attr.value, policy);
        if !keep {
            debug!(tag, attribute = local, "Removed attribute");
        }
        keep
    });
    before - attrs.map.len()
}

/// Whether attribute `name="value"` on `tag` survives `policy`.
pub fn keep_attribute(tag: &str, name: &str, value: &str, policy: &SanitizationPolicy) -> bool {
    let name = name.trim().to_ascii_lowercase();
    if EVENT_HANDLER.is_match(&name) {
        return false;
    }
    if name.starts_with(RESERVED_ATTRIBUTE_PREFIX) || ALWAYS_REMOVED_ATTRIBUTES.contains(&name.as_str()) {
        return false;
    }
    if !policy.allows_attribute(tag, &name) {
        return false;
    }
    if URL_ATTRIBUTES.contains(&name.as_str()) && !is_safe_url(value) {
        return false;
    }
    if tag == "meta" && name == "content" && is_offending_meta_content(value) {
        return false;
    }
    true
}

fn is_offending_meta_content(value: &str) -> bool {
    let compact = compact_url(value);
    compact.contains("javascript:") || compact.contains("vbscript:")
}

/// Attribute value with ASCII whitespace and control characters removed,
/// lowercased. Browsers ignore those characters inside a scheme.
fn compact_url(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_ascii_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Whether a URL attribute value is safe to keep.
///
/// Relative references are safe. Absolute ones must use a scheme from
/// [`SAFE_SCHEMES`]; `data:` is limited to raster image media types.
pub fn is_safe_url(value: &str) -> bool {
    let compact = compact_url(value);
    match scheme(&compact) {
        None => true,
        Some("data") => {
            compact.starts_with("data:image/") && !compact.starts_with("data:image/svg")
        }
        Some(s) => SAFE_SCHEMES.contains(&s),
    }
}

fn is_http_url(value: &str) -> bool {
    let compact = compact_url(value);
    compact.starts_with("http://") || compact.starts_with("https://") || compact.starts_with("//")
}

/// Scheme of an absolute URL, or `None` for a relative reference.
fn scheme(url: &str) -> Option<&str> {
    let colon = url.find(':')?;
    if url[..colon].contains(['/', '?', '#']) {
        return None;
    }
    let candidate = &url[..colon];
    let mut chars = candidate.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    // Not a well-formed scheme: reported as an unknown one.
    if valid {
        Some(candidate)
    } else {
        Some("")
    }
}

/// Whether any element in the tree still carries an event handler or a
/// script URL. Used to check the safety invariant in tests.
pub fn has_residual_threats(doc: &ParsedDocument) -> bool {
    doc.elements().iter().any(|node| {
        let Some(tag) = dom::tag_name(node) else {
            return false;
        };
        if tag == "script" {
            return true;
        }
        let Some(element) = node.as_element() else {
            return false;
        };
        let attrs = element.attributes.borrow();
        attrs.map.iter().any(|(name, attr)| {
            let local: &str = &name.local;
            EVENT_HANDLER.is_match(local.trim())
                || compact_url(&attr.value).contains("javascript:")
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyName;

    fn run(html: &str, policy: PolicyName) -> (String, StripReport) {
        let doc = ParsedDocument::parse(html);
        let report = strip(&doc, &SanitizationPolicy::preset(policy));
        (doc.serialize().unwrap(), report)
    }

    #[test]
    fn removes_scripts_and_handlers() {
        let (html, report) = run(
            r#"<div OnClick="x()" onmouseover="y()"><script>evil()</script><p>ok</p></div>"#,
            PolicyName::Balanced,
        );
        assert_eq!(html, "<div><p>ok</p></div>");
        assert_eq!(report.removed_elements, 1);
        assert_eq!(report.removed_attributes, 2);
    }

    #[test]
    fn removes_script_urls_with_obfuscation() {
        let (html, _) = run(
            "<a href=\" jav\tascript:alert(1)\">a</a><a href=\"JaVaScRiPt:x\">b</a><a href=\"https://ok.test\">c</a>",
            PolicyName::Balanced,
        );
        assert!(!html.to_ascii_lowercase().contains("javascript"), "got: {html}");
        assert!(html.contains("https://ok.test"));
    }

    #[test]
    fn rejects_html_data_uris_keeps_image_ones() {
        assert!(!is_safe_url("data:text/html;base64,PHNjcmlwdD4="));
        assert!(!is_safe_url("data:image/svg+xml,<svg onload=x>"));
        assert!(is_safe_url("data:image/png;base64,iVBORw0KGgo="));
        assert!(is_safe_url("images/logo.png"));
        assert!(is_safe_url("/a:b"));
        assert!(is_safe_url("cid:logo@mail"));
        assert!(!is_safe_url("file:///etc/passwd"));
        assert!(!is_safe_url("vbscript:msgbox"));
    }

    #[test]
    fn aggressive_drops_style_and_unlisted_attributes() {
        let (html, _) = run(
            r#"<style>p{}</style><p style="color:red" class="x" title="t" data-id="1">Hi</p><img src="a.png" width="5" style="border:0">"#,
            PolicyName::Aggressive,
        );
        assert!(html.contains(r#"title="t""#), "got: {html}");
        assert!(html.contains(r#"data-id="1""#));
        assert!(!html.contains("style"));
        assert!(!html.contains("class"));
        assert!(html.contains(r#"<img src="a.png" width="5">"#));
    }

    #[test]
    fn balanced_drops_only_offending_style_blocks() {
        let (html, report) = run(
            "<style>p{color:red}</style><style>@im\\70 ort url(x.css);</style><p>x</p>",
            PolicyName::Balanced,
        );
        assert_eq!(html, "<style>p{color:red}</style><p>x</p>");
        assert_eq!(report.removed_style_blocks, 1);
    }

    #[test]
    fn links_and_meta_refresh() {
        let (html, _) = run(
            r#"<link rel="stylesheet" href="https://x.test/a.css"><link rel="preload" href="https://x.test/f"><meta http-equiv="Refresh" content="0;url=https://evil.test"><meta name="x" content="y"><p>x</p>"#,
            PolicyName::Balanced,
        );
        assert!(html.contains("a.css"));
        assert!(!html.contains("preload"));
        assert!(!html.contains("Refresh"));
        assert!(html.contains(r#"name="x""#));
    }

    #[test]
    fn comments_and_noscript_removed() {
        let (html, _) = run(
            "<!-- <img src=x onerror=alert(1)> --><noscript><img src=x onerror=alert(1)></noscript><p>x</p>",
            PolicyName::LayoutPreserving,
        );
        assert_eq!(html, "<p>x</p>");
    }

    #[test]
    fn svg_animation_removed() {
        let (html, _) = run(
            r#"<svg><a><animate attributeName="href" values="javascript:alert(1)"/><text>x</text></a></svg>"#,
            PolicyName::Balanced,
        );
        assert!(!html.contains("animate"), "got: {html}");
    }

    #[test]
    fn reserved_prefix_and_srcset_removed() {
        let (html, _) = run(
            r#"<img src="a.png" srcset="https://x.test/b.png 2x" data-mailscribe-pending="0">"#,
            PolicyName::Balanced,
        );
        assert_eq!(html, r#"<img src="a.png">"#);
    }

    #[test]
    fn foreign_style_with_element_children_removed() {
        let (html, report) = run(
            r#"<svg><style><a id="</style><img src=1 onerror=alert(1)>">x</a></style></svg><p>ok</p>"#,
            PolicyName::Balanced,
        );
        assert_eq!(report.removed_style_blocks, 1);
        assert!(!html.contains("onerror"), "got: {html}");
        assert!(html.contains("<p>ok</p>"));
    }

    #[test]
    fn markup_in_foreign_attribute_removed() {
        let (html, _) = run(
            r#"<svg><a title="<img src=x onerror=alert(1)>">t</a></svg><p title="a<b">x</p>"#,
            PolicyName::Balanced,
        );
        assert!(!html.contains("onerror"), "got: {html}");
        assert!(html.contains(r#"<p title="a<b">"#), "HTML content keeps its attribute: {html}");
    }

    #[test]
    fn settled_output_survives_a_reparse() {
        let policy = SanitizationPolicy::preset(PolicyName::LayoutPreserving);
        for input in [
            r#"<svg></p><style><a id="</style><img src=1 onerror=alert(1)>">"#,
            r#"<form><math><mtext></form><form><mglyph><style></math><img src onerror=alert(1)>"#,
        ] {
            let settled = settle(ParsedDocument::parse(input), &policy, 3).unwrap();
            let html = settled.doc.serialize().unwrap();
            let reparsed = ParsedDocument::parse_as(&html, false);
            assert!(!has_residual_threats(&reparsed), "{input} -> {html}");
        }
    }

    #[test]
    fn settle_without_rounds_drops_foreign_content() {
        let policy = SanitizationPolicy::preset(PolicyName::Balanced);
        let settled = settle(ParsedDocument::parse("<svg><rect/></svg><p>x</p>"), &policy, 0).unwrap();
        assert_eq!(settled.doc.serialize().unwrap(), "<p>x</p>");
        assert_eq!(settled.strip.removed_elements, 1);
    }

    #[test]
    fn strip_is_idempotent() {
        let policy = SanitizationPolicy::preset(PolicyName::Balanced);
        let doc = ParsedDocument::parse(
            r#"<div onload="x"><a href="javascript:y">z</a><iframe src="https://x"></iframe><style>a{}</style></div>"#,
        );
        strip(&doc, &policy);
        let once = doc.serialize().unwrap();
        let second = strip(&doc, &policy);
        assert_eq!(second, StripReport::default());
        assert_eq!(doc.serialize().unwrap(), once);
        assert!(!has_residual_threats(&doc));
    }
}
