//! Small CSS text utilities shared by the threat stripper and the layout
//! normalizer.
//!
//! There is no CSS parser here on purpose: email CSS is routinely broken,
//! and everything the pipeline needs is declaration-level. Splitting respects
//! quotes and parentheses so `url(a;b)` and `content: ";"` stay intact.

/// Constructs that make a declaration or a style block unsafe.
///
/// Matched against [`scan_form`] text (lowercase, comments and whitespace
/// removed, escapes decoded).
pub const OFFENDING_CONSTRUCTS: &[&str] = &[
    "@import",
    "javascript:",
    "vbscript:",
    "expression(",
    "behavior:",
    "-moz-binding",
];

/// Split a declaration list on `;` outside quotes and parentheses.
///
/// Segments are returned verbatim (untrimmed, empty ones included).
pub fn split_declarations(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' => match quote {
                Some(q) if q == c => quote = None,
                None => quote = Some(c),
                _ => {}
            },
            '(' if quote.is_none() => depth += 1,
            ')' if quote.is_none() => depth = depth.saturating_sub(1),
            ';' if quote.is_none() && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Split one declaration into lowercase property name and trimmed value.
///
/// Returns `None` when there is no `:`.
pub fn parse_declaration(decl: &str) -> Option<(String, &str)> {
    let (prop, value) = decl.split_once(':')?;
    Some((prop.trim().to_ascii_lowercase(), value.trim()))
}

/// Remove `/* … */` comments. An unterminated comment runs to the end.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("/*") {
        out.push_str(&rest[..open]);
        match rest[open + 2..].find("*/") {
            Some(close) => rest = &rest[open + 2 + close + 2..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}

/// Decode CSS escapes: `\6a` style hex escapes (up to six digits, one
/// optional trailing whitespace), `\` + newline continuations, and `\x`
/// literal escapes.
pub fn decode_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(&next) = chars.peek() else {
            break;
        };
        if next.is_ascii_hexdigit() {
            let mut hex = String::new();
            while hex.len() < 6 {
                match chars.peek() {
                    Some(h) if h.is_ascii_hexdigit() => {
                        hex.push(*h);
                        chars.next();
                    }
                    _ => break,
                }
            }
            if matches!(chars.peek(), Some(w) if w.is_whitespace()) {
                chars.next();
            }
            let decoded = u32::from_str_radix(&hex, 16)
                .ok()
                .filter(|&v| v != 0)
                .and_then(char::from_u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            out.push(decoded);
        } else if next == '\n' || next == '\r' || next == '\x0c' {
            chars.next();
        } else {
            out.push(next);
            chars.next();
        }
    }
    out
}

/// Canonical text used for threat scanning: comments removed, escapes
/// decoded, whitespace and control characters dropped, lowercased.
pub fn scan_form(text: &str) -> String {
    decode_escapes(&strip_comments(text))
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Whether `text` contains any [`OFFENDING_CONSTRUCTS`] entry.
pub fn is_offending(text: &str) -> bool {
    let scanned = scan_form(text);
    OFFENDING_CONSTRUCTS.iter().any(|c| scanned.contains(c))
}

/// Property name with any vendor prefix removed.
pub fn unprefixed(property: &str) -> &str {
    for prefix in ["-webkit-", "-moz-", "-ms-", "-o-"] {
        if let Some(rest) = property.strip_prefix(prefix) {
            return rest;
        }
    }
    property
}

/// Filter a declaration list, keeping declarations for which `keep` returns
/// true.
///
/// Returns `None` when nothing was removed, so callers can leave the source
/// text byte-identical. Otherwise returns the surviving declarations joined
/// with `"; "` and the number removed.
pub fn filter_declarations<F>(text: &str, mut keep: F) -> Option<(String, usize)>
where
    F: FnMut(&str) -> bool,
{
    let mut kept = Vec::new();
    let mut removed = 0;
    for decl in split_declarations(text) {
        let decl = decl.trim();
        if decl.is_empty() {
            continue;
        }
        if keep(decl) {
            kept.push(decl);
        } else {
            removed += 1;
        }
    }
    (removed > 0).then(|| (kept.join("; "), removed))
}

/// Rewrite every rule body of a stylesheet with `rewrite`, leaving
/// selectors and at-rule preludes untouched.
///
/// A rule body is the text between a `{` and the next `}` when no other `{`
/// intervenes. `rewrite` returns `None` to leave a body as is.
pub fn rewrite_rule_bodies<F>(sheet: &str, mut rewrite: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(sheet.len());
    let mut changed = false;
    let mut cursor = 0;

    while let Some(open_rel) = sheet[cursor..].find('{') {
        let open = cursor + open_rel;
        out.push_str(&sheet[cursor..=open]);
        let body_start = open + 1;
        let next_brace = sheet[body_start..].find(['{', '}']).map(|i| body_start + i);
        match next_brace {
            Some(close) if sheet.as_bytes()[close] == b'}' => {
                let body = &sheet[body_start..close];
                match rewrite(body) {
                    Some(new_body) => {
                        out.push_str(&new_body);
                        changed = true;
                    }
                    None => out.push_str(body),
                }
                out.push('}');
                cursor = close + 1;
            }
            Some(nested) => {
                // Nested block (@media, @supports): the text up to the inner
                // `{` is a selector, handled on the next iteration.
                out.push_str(&sheet[body_start..nested]);
                cursor = nested;
            }
            None => {
                cursor = body_start;
                break;
            }
        }
    }
    out.push_str(&sheet[cursor..]);
    changed.then_some(out)
}
