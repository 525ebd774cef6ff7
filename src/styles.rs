//! Fixed CSS and HTML snippets injected into every rendered document.
//!
//! Centralising them here keeps the shell deterministic: the same policy and
//! config always produce the same bytes, and tests can inspect the snippets
//! directly.

use crate::config::{PolicyName, SanitizationPolicy};
use crate::pipeline::buttons::ENHANCED_BUTTON_CLASS;
use crate::pipeline::images::PLACEHOLDER_CLASS;

/// Attribute marking elements injected by the shell. Also the guard
/// against injecting twice.
pub const SHELL_MARKER: &str = "data-mailscribe-shell";

/// Font family declared by the `@font-face` fallback.
pub const FONT_FAMILY: &str = "MailscribeSans";

/// Rules every policy gets: no motion, nothing pinned out of flow.
const CATCH_ALL_CSS: &str = "*,*::before,*::after{position:static !important;\
animation:none !important;transition:none !important;caret-color:transparent}";

const ENHANCED_BUTTON_CSS: &str = "{display:inline-block !important;padding:10px 18px;\
border-radius:4px;text-decoration:none !important;font-weight:600;line-height:1.2}";

/// `@font-face` declaration: local sources first, then the web font.
pub fn font_face_css(font_url: Option<&str>) -> String {
    let mut sources = vec![
        r#"local("Roboto")"#.to_string(),
        r#"local("Arial")"#.to_string(),
    ];
    if let Some(url) = font_url {
        sources.push(format!(r#"url("{}") format("woff2")"#, css_string(url)));
    }
    format!(
        r#"@font-face{{font-family:"{FONT_FAMILY}";src:{};font-display:block}}"#,
        sources.join(",")
    )
}

/// Base stylesheet for `policy`.
pub fn base_stylesheet(policy: &SanitizationPolicy) -> String {
    let mut css = format!(
        r#"body{{font-family:"{FONT_FAMILY}",Arial,Helvetica,sans-serif;-webkit-font-smoothing:antialiased}}"#
    );
    css.push_str(&format!(".{PLACEHOLDER_CLASS}{{max-width:100%}}"));
    if policy.name == PolicyName::Aggressive {
        css.push_str("img{max-width:100%;height:auto}");
    }
    if policy.button_heuristic {
        css.push('.');
        css.push_str(ENHANCED_BUTTON_CLASS);
        css.push_str(ENHANCED_BUTTON_CSS);
    }
    css.push_str(CATCH_ALL_CSS);
    css
}

/// The snippet inserted right after `<head>`: optional font preload, then
/// one marked style block.
pub fn head_snippet(policy: &SanitizationPolicy, font_url: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(url) = font_url {
        out.push_str(&format!(
            r#"<link rel="preload" as="font" type="font/woff2" crossorigin href="{}" {SHELL_MARKER}>"#,
            html_escape::encode_double_quoted_attribute(url)
        ));
    }
    out.push_str(&format!(
        "<style {SHELL_MARKER}>{}{}</style>",
        font_face_css(font_url),
        base_stylesheet(policy)
    ));
    out
}

/// Escape a value for a double-quoted CSS string inside a `<style>` block.
fn css_string(value: &str) -> String {
    value
        .chars()
        .filter(|c| !c.is_control() && *c != '<' && *c != '>')
        .flat_map(|c| match c {
            '"' | '\\' => vec!['\\', c],
            _ => vec![c],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_FONT_PRELOAD_URL;

    #[test]
    fn font_face_lists_local_sources_first() {
        let css = font_face_css(Some(DEFAULT_FONT_PRELOAD_URL));
        let local = css.find("local(").unwrap();
        let remote = css.find("url(").unwrap();
        assert!(local < remote);
        assert!(css.contains(FONT_FAMILY));
    }

    #[test]
    fn font_face_without_url_keeps_fallback() {
        let css = font_face_css(None);
        assert!(css.contains(r#"local("Arial")"#));
        assert!(!css.contains("url("));
    }

    #[test]
    fn button_css_only_for_layout_preserving() {
        let lp = base_stylesheet(&SanitizationPolicy::preset(PolicyName::LayoutPreserving));
        let b = base_stylesheet(&SanitizationPolicy::preset(PolicyName::Balanced));
        assert!(lp.contains(".enhanced-button{"));
        assert!(!b.contains("enhanced-button"));
        assert!(b.contains("position:static !important"));
    }

    #[test]
    fn snippet_is_marked_and_deterministic() {
        let p = SanitizationPolicy::preset(PolicyName::Balanced);
        let a = head_snippet(&p, Some(DEFAULT_FONT_PRELOAD_URL));
        assert_eq!(a, head_snippet(&p, Some(DEFAULT_FONT_PRELOAD_URL)));
        assert!(a.starts_with(r#"<link rel="preload""#));
        assert!(a.contains(&format!("<style {SHELL_MARKER}>")));
        assert!(!head_snippet(&p, None).contains("<link"));
    }

    #[test]
    fn css_string_cannot_break_out() {
        assert_eq!(css_string(r#"a"b\c</style>"#), r#"a\"b\\c/style"#);
    }
}
