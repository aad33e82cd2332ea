//! Text sanitation, safe template formatting, and markdown header helpers.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static CTRL: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\x00-\x08\x0B\x0C\x0E-\x1F]").unwrap());
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_-]+").unwrap());
static HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}(#+)\s+(.+?)\s*$").unwrap());
static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\w+\b").unwrap());

/// Strip control characters and normalize line endings to `\n`.
pub fn sanitize_text(s: &str) -> String {
    let cleaned = CTRL.replace_all(s, "");
    cleaned.replace("\r\n", "\n").replace('\r', "\n")
}

/// Template substitution: `{name}` placeholders are replaced from `kwargs`;
/// unknown placeholders are preserved literally so templates containing
/// JSON braces don't fail to format.
pub fn fmt(template: &str, kwargs: &HashMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match kwargs.get(key) {
                Some(v) => v.clone(),
                None => format!("{{{key}}}"),
            }
        })
        .into_owned()
}

/// Slugify into lowercase `[a-z0-9_-]`; falls back to `fallback` if empty.
pub fn slug(s: &str, fallback: &str) -> String {
    let lowered = s.to_lowercase();
    let replaced = NON_SLUG.replace_all(&lowered, "-");
    let trimmed = replaced.trim_matches(|c| c == '-' || c == '_').to_string();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed
    }
}

/// Check whether `text` contains a markdown heading (H1-H6) matching `wanted`
/// case-insensitively; if not, suggest inserting one at level 2.
pub fn ensure_header(text: &str, wanted: &str) -> (bool, Option<(u8, String)>) {
    let wanted_lower = wanted.to_lowercase();
    for caps in HEADER.captures_iter(text) {
        let title = caps[2].trim().to_lowercase();
        if title == wanted_lower {
            return (true, None);
        }
    }
    (false, Some((2, wanted.to_string())))
}

/// Approximate word count (whitespace-delimited `\w+` runs).
pub fn word_count(text: &str) -> usize {
    WORD.find_iter(text).count()
}
