//! Response cleanup applied to every oracle reply before structured parsing.
//!
//! Vision models asked for JSON reliably produce *almost* JSON. Two repairs
//! cover nearly every failure seen in practice:
//!
//! 1. The payload arrives wrapped in ```` ```json ```` fences or preceded by a
//!    sentence of prose. [`extract_json_payload`] cuts the reply down to the
//!    outermost `{…}` / `[…]` span.
//! 2. Multi-line answers (working steps, long labels) are emitted with raw line
//!    breaks inside string literals, which strict parsers reject.
//!    [`sanitize_json_strings`] rewrites those line breaks to an inline
//!    separator while leaving everything outside string literals untouched.
//!
//! Any other malformation is left alone and surfaces as a parse failure.

use once_cell::sync::Lazy;
use regex::Regex;

/// Inline separator that replaces line breaks inside string values.
pub const DEFAULT_SEPARATOR: &str = " | ";

// ── Payload extraction ───────────────────────────────────────────────────────

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\r?\n(.*?)```").unwrap());

/// Cut an oracle reply down to its JSON payload.
///
/// Prefers the first fenced block when present, then trims to the span from
/// the first `{`/`[` to the last `}`/`]`. Returns the trimmed input unchanged
/// when no bracket is found.
pub fn extract_json_payload(input: &str) -> &str {
    let body = match RE_FENCED_BLOCK.captures(input) {
        Some(caps) => caps.get(1).map_or(input, |m| m.as_str()),
        None => input,
    };

    let start = body.find(['{', '[']);
    let end = body.rfind(['}', ']']);
    match (start, end) {
        (Some(s), Some(e)) if s < e => &body[s..=e],
        _ => body.trim(),
    }
}

// ── String-literal line breaks ───────────────────────────────────────────────

/// Replace literal line breaks inside JSON string literals with `separator`.
///
/// Tracks whether the cursor is inside a string (quote toggling, honouring
/// backslash escapes). `\r\n` counts as one line break. A backslash that
/// directly precedes a raw line break is dropped along with it, since
/// `"\⏎"` is not a valid escape.
pub fn sanitize_json_strings(input: &str, separator: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            continue;
        }

        if escaped {
            escaped = false;
            if c == '\n' || c == '\r' {
                out.pop();
                if c == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(separator);
            } else {
                out.push(c);
            }
            continue;
        }

        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                in_string = false;
                out.push(c);
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push_str(separator);
            }
            '\n' => out.push_str(separator),
            _ => out.push(c),
        }
    }

    out
}

/// Replace every line break in already-decoded text with `separator`.
///
/// Applied to answer values after parsing, where escaped `\n` sequences have
/// become real line breaks.
pub fn flatten_lines(text: &str, separator: &str) -> String {
    let parts: Vec<&str> = text
        .split(['\n', '\r'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();
    parts.join(separator)
}
