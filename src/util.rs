//! Shared utility functions

/// Default byte budget for sanitized log fields.
pub const SANITIZE_MAX_LEN: usize = 200;

/// Scrub a string for log emission.
///
/// Removes control bytes (`0x00..=0x1f` and `0x7f`) so request-derived data
/// cannot inject CR/LF into the log stream, and stops once `max_bytes` of
/// output have accumulated. Truncation happens per character, so the result
/// always ends on a UTF-8 boundary.
///
/// # Examples
///
/// ```
/// use sidekey::util::sanitize_with;
///
/// assert_eq!(sanitize_with("line\r\nbreak", 200), "linebreak");
/// assert_eq!(sanitize_with("hello world", 5), "hello");
/// ```
pub fn sanitize_with(s: &str, max_bytes: usize) -> String {
    let mut out = String::with_capacity(s.len().min(max_bytes));
    for c in s.chars() {
        if is_control_byte(c) {
            continue;
        }
        if out.len() + c.len_utf8() > max_bytes {
            break;
        }
        out.push(c);
    }
    out
}

/// `sanitize_with` at the default 200-byte budget.
pub fn sanitize(s: &str) -> String {
    sanitize_with(s, SANITIZE_MAX_LEN)
}

fn is_control_byte(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{1f}' | '\u{7f}')
}
