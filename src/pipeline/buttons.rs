//! Call-to-action button heuristic (layout-preserving policy only).
//!
//! Email CTAs are usually plain anchors styled to look like buttons, and
//! their styling is often in a stylesheet the render loses. This classifier
//! spots them so the shell stylesheet can restore a button look through the
//! [`ENHANCED_BUTTON_CLASS`] class. Classification never changes structure
//! or `href`.
//!
//! It is a best-effort scorer with known false positives (a prose link that
//! starts with "View") and false negatives (image-only buttons). The weights
//! and threshold below are tunable constants, not derived values.

use crate::pipeline::css;
use once_cell::sync::Lazy;
use regex::Regex;

/// Class appended to elements classified as buttons.
pub const ENHANCED_BUTTON_CLASS: &str = "enhanced-button";

/// Inline style with a background plus padding or rounded corners.
pub const STYLE_WEIGHT: u32 = 1;
/// Class name containing `button`, `btn` or `cta`.
pub const CLASS_WEIGHT: u32 = 1;
/// Explicit `role="button"`.
pub const ROLE_WEIGHT: u32 = 1;
/// Text containing an action verb.
pub const VERB_WEIGHT: u32 = 1;
/// Minimum score for a button.
pub const THRESHOLD: u32 = 1;
/// Longer text is prose, not a button label.
pub const MAX_LABEL_CHARS: usize = 30;

/// Text naming a contact channel marks a navigation link, not a button.
pub const CONTACT_WORDS: &[&str] = &["phone", "email", "contact"];

/// Curated action verbs and phrases matched on word boundaries.
pub const ACTION_VERBS: &[&str] = &[
    "view", "download", "manage", "find", "book", "reserve", "cancel", "confirm", "add", "get",
    "start", "continue", "shop", "buy", "purchase", "order", "subscribe", "join", "sign up",
    "log in", "register", "learn more", "track",
];

static ACTION_VERB: Lazy<Regex> = Lazy::new(|| {
    let alternatives: Vec<String> = ACTION_VERBS
        .iter()
        .map(|v| regex::escape(v).replace(' ', r"\s+"))
        .collect();
    Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|"))).expect("valid regex")
});

/// What the scorer looks at for one anchor or `role="button"` element.
#[derive(Debug, Clone, Copy, Default)]
pub struct ButtonCandidate<'a> {
    pub href: Option<&'a str>,
    pub class: Option<&'a str>,
    pub role: Option<&'a str>,
    pub style: Option<&'a str>,
    /// Visible text, whitespace-collapsed.
    pub text: &'a str,
}

/// Which signals fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonSignals {
    pub style: bool,
    pub class: bool,
    pub role: bool,
    pub verb: bool,
}

impl ButtonSignals {
    pub fn score(&self) -> u32 {
        [
            (self.style, STYLE_WEIGHT),
            (self.class, CLASS_WEIGHT),
            (self.role, ROLE_WEIGHT),
            (self.verb, VERB_WEIGHT),
        ]
        .iter()
        .filter(|(fired, _)| *fired)
        .map(|(_, weight)| weight)
        .sum()
    }
}

/// Evaluate the signals for `candidate`, or `None` when an exclusion rule
/// applies (mail/phone link, text with `@` or a [`CONTACT_WORDS`] entry,
/// empty or overlong text).
pub fn signals(candidate: &ButtonCandidate<'_>) -> Option<ButtonSignals> {
    let text = candidate.text.trim();
    if text.is_empty() || text.contains('@') || text.chars().count() > MAX_LABEL_CHARS {
        return None;
    }
    let lower = text.to_lowercase();
    if CONTACT_WORDS.iter().any(|w| lower.contains(w)) {
        return None;
    }
    if let Some(href) = candidate.href {
        let href = href.trim().to_ascii_lowercase();
        if href.starts_with("mailto:") || href.starts_with("tel:") {
            return None;
        }
    }

    Some(ButtonSignals {
        style: candidate.style.is_some_and(has_button_style),
        class: candidate.class.is_some_and(|class| {
            class.split_ascii_whitespace().any(|token| {
                let token = token.to_ascii_lowercase();
                token.contains("button") || token.contains("btn") || token.contains("cta")
            })
        }),
        role: candidate
            .role
            .is_some_and(|r| r.trim().eq_ignore_ascii_case("button")),
        verb: ACTION_VERB.is_match(text),
    })
}

/// Total score of `candidate`, or `None` when excluded.
pub fn score(candidate: &ButtonCandidate<'_>) -> Option<u32> {
    signals(candidate).map(|s| s.score())
}

/// Whether `candidate` is classified as a button.
pub fn is_button(candidate: &ButtonCandidate<'_>) -> bool {
    score(candidate).is_some_and(|s| s >= THRESHOLD)
}

fn has_button_style(style: &str) -> bool {
    let mut background = false;
    let mut shape = false;
    for decl in css::split_declarations(style) {
        let Some((prop, value)) = css::parse_declaration(decl) else {
            continue;
        };
        let value = value.to_ascii_lowercase();
        match prop.as_str() {
            "background" | "background-color"
                if !value.is_empty() && value != "none" && value != "transparent" =>
            {
                background = true
            }
            p if p.starts_with("padding") || p.ends_with("border-radius") => shape = true,
            _ => {}
        }
    }
    background && shape
}

/// Append [`ENHANCED_BUTTON_CLASS`] to a class list once.
pub fn with_enhanced_class(class: Option<&str>) -> Option<String> {
    match class {
        Some(existing)
            if existing
                .split_ascii_whitespace()
                .any(|t| t == ENHANCED_BUTTON_CLASS) =>
        {
            None
        }
        Some(existing) if !existing.trim().is_empty() => {
            Some(format!("{} {ENHANCED_BUTTON_CLASS}", existing.trim()))
        }
        _ => Some(ENHANCED_BUTTON_CLASS.to_string()),
    }
}
