// Content screening for untrusted text
use std::fmt;
use url::Url;

const DANGEROUS_SCHEMES: &[&str] = &["javascript", "vbscript", "data", "file"];

/// Something suspicious found in a piece of third-party text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentFinding {
    /// HTML elements, comments or entities
    Markup,
    /// A `javascript:`/`data:`-style URI
    DangerousScheme,
    /// C0/C1 control characters other than common whitespace
    ControlCharacter,
    /// Unicode bidirectional overrides that can disguise text
    BidiOverride,
}

impl ContentFinding {
    pub fn describe(&self) -> &'static str {
        match self {
            ContentFinding::Markup => "contains HTML markup",
            ContentFinding::DangerousScheme => "contains a script-capable URI",
            ContentFinding::ControlCharacter => "contains control characters",
            ContentFinding::BidiOverride => "contains bidirectional override characters",
        }
    }
}

impl fmt::Display for ContentFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Remove every HTML element, keeping text content (entity-escaped)
pub fn strip_markup(text: &str) -> String {
    ammonia::Builder::empty().clean(text).to_string()
}

// Mirrors how the HTML serializer escapes text nodes, so plain text
// round-trips through `strip_markup` unchanged.
fn escape_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('&', "&amp;")
        .replace('\u{a0}', "&nbsp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// True when the HTML parser finds elements, comments or entities in `text`
pub fn contains_markup(text: &str) -> bool {
    if !text.contains(['<', '&']) {
        return false;
    }
    strip_markup(text) != escape_text(text)
}

fn has_dangerous_scheme(text: &str) -> bool {
    let candidate = text.trim();
    if !candidate.contains(':') {
        return false;
    }
    Url::parse(candidate)
        .map(|url| DANGEROUS_SCHEMES.contains(&url.scheme()))
        .unwrap_or(false)
}

fn is_bidi_override(c: char) -> bool {
    matches!(c, '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}')
}

/// Screen a string, returning each distinct finding once
pub fn screen_text(text: &str) -> Vec<ContentFinding> {
    let mut findings = Vec::new();

    if contains_markup(text) {
        findings.push(ContentFinding::Markup);
    }
    if has_dangerous_scheme(text) {
        findings.push(ContentFinding::DangerousScheme);
    }
    if text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
    {
        findings.push(ContentFinding::ControlCharacter);
    }
    if text.chars().any(is_bidi_override) {
        findings.push(ContentFinding::BidiOverride);
    }

    findings
}

/// Truncate text to a maximum number of characters
pub fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let kept: String = text.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
