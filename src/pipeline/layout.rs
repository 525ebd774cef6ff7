//! Stage 3: layout normalizer.
//!
//! Static capture breaks on content that moves or escapes normal flow:
//! `position: fixed|absolute|sticky` pins boxes over the body, and
//! `transform`, `animation` and `transition` render mid-flight frames. Those
//! declarations are removed from inline `style` attributes and from the
//! rule bodies of retained `<style>` blocks. Everything else (width, height,
//! margin, padding, text-align, background-color, border, table layout)
//! carries visual structure and is left alone.
//!
//! Text with nothing to remove stays byte-identical, which makes the stage
//! idempotent.

use crate::config::SanitizationPolicy;
use crate::pipeline::buttons::{self, ButtonCandidate};
use crate::pipeline::css;
use crate::pipeline::dom::{self, ParsedDocument};
use kuchiki::NodeRef;
use tracing::debug;

/// Counters reported by [`normalize`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutReport {
    pub removed_declarations: usize,
    pub enhanced_buttons: usize,
}

/// Normalise every inline style and style block in `doc`.
pub fn normalize(doc: &ParsedDocument, policy: &SanitizationPolicy) -> LayoutReport {
    let mut report = LayoutReport::default();

    for node in doc.elements() {
        report.removed_declarations += normalize_inline_style(&node, policy);
        if dom::tag_name(&node).as_deref() == Some("style") {
            report.removed_declarations += normalize_style_block(&node, policy);
        }
    }

    if policy.button_heuristic {
        report.enhanced_buttons = enhance_buttons(doc);
    }

    report
}

/// Whether one declaration survives `policy`.
pub fn keep_declaration(decl: &str, policy: &SanitizationPolicy) -> bool {
    if css::is_offending(decl) {
        return false;
    }
    let scanned = css::scan_form(decl);
    let Some((property, value)) = scanned.split_once(':') else {
        return true;
    };
    let property = css::unprefixed(property);
    if policy
        .forbidden_css_properties
        .iter()
        .any(|p| property.starts_with(p))
    {
        return false;
    }
    if property == "position" {
        let value = css::unprefixed(value.trim_end_matches("!important"));
        return !policy.forbidden_positions.contains(&value);
    }
    true
}

/// Filter a declaration list. `None` when nothing changes.
pub fn normalize_declarations(
    text: &str,
    policy: &SanitizationPolicy,
) -> Option<(String, usize)> {
    css::filter_declarations(text, |decl| keep_declaration(decl, policy))
}

fn normalize_inline_style(node: &NodeRef, policy: &SanitizationPolicy) -> usize {
    let Some(element) = node.as_element() else {
        return 0;
    };
    let mut attrs = element.attributes.borrow_mut();
    let Some(style) = attrs.get("style") else {
        return 0;
    };
    if style.trim().is_empty() {
        attrs.remove("style");
        return 0;
    }
    let Some((rewritten, removed)) = normalize_declarations(style, policy) else {
        return 0;
    };
    if rewritten.is_empty() {
        attrs.remove("style");
    } else {
        attrs.insert("style", rewritten);
    }
    removed
}

fn normalize_style_block(node: &NodeRef, policy: &SanitizationPolicy) -> usize {
    let sheet = node.text_contents();
    let mut removed = 0;
    let rewritten = css::rewrite_rule_bodies(&sheet, |body| {
        normalize_declarations(body, policy).map(|(text, n)| {
            removed += n;
            text
        })
    });
    if let Some(sheet) = rewritten {
        for child in node.children().collect::<Vec<_>>() {
            child.detach();
        }
        node.append(NodeRef::new_text(sheet));
        debug!(removed, "Rewrote style block");
    }
    removed
}

/// Tag anchors and `role="button"` elements classified as buttons.
fn enhance_buttons(doc: &ParsedDocument) -> usize {
    let mut enhanced = 0;
    for node in doc.elements() {
        let Some(element) = node.as_element() else {
            continue;
        };
        let is_anchor = dom::tag_name(&node).as_deref() == Some("a");
        let text = node.text_contents();
        let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

        let mut attrs = element.attributes.borrow_mut();
        let role = attrs.get("role");
        if !is_anchor && !role.is_some_and(|r| r.trim().eq_ignore_ascii_case("button")) {
            continue;
        }
        let candidate = ButtonCandidate {
            href: attrs.get("href"),
            class: attrs.get("class"),
            role,
            style: attrs.get("style"),
            text: &text,
        };
        if !buttons::is_button(&candidate) {
            continue;
        }
        if let Some(class) = buttons::with_enhanced_class(candidate.class) {
            debug!(text = %text, "Classified element as button");
            attrs.insert("class", class);
            enhanced += 1;
        }
    }
    enhanced
}
