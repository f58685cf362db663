use std::borrow::Cow;

/// Replacement for `,` inside free-text fields.
///
/// Pages are comma-delimited; the full-width comma keeps titles readable
/// while never colliding with the field delimiter.
pub const COMMA_SUBSTITUTE: char = '，';

/// Normalizes a free-text field (title, author) for storage.
///
/// - `,` becomes [`COMMA_SUBSTITUTE`]
/// - control characters, including tabs and line breaks, become spaces
/// - runs of whitespace collapse to a single space
/// - leading and trailing whitespace is trimmed
///
/// Returns `Cow::Borrowed` when the input is already clean (no allocation).
///
/// # Examples
///
/// ```
/// use feed_archive::util::sanitize_text;
///
/// assert_eq!(sanitize_text("Hello, world"), "Hello， world");
/// assert_eq!(sanitize_text("line one\nline two"), "line one line two");
/// assert_eq!(sanitize_text("  padded  "), "padded");
/// ```
pub fn sanitize_text(s: &str) -> Cow<'_, str> {
    let trimmed = s.trim();

    // Fast path: nothing to substitute or collapse
    let mut prev_space = false;
    let needs_rewrite = trimmed.chars().any(|c| {
        let dirty = c == ',' || c.is_control() || (c.is_whitespace() && (c != ' ' || prev_space));
        prev_space = c.is_whitespace();
        dirty
    });

    if !needs_rewrite {
        return Cow::Borrowed(trimmed);
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_space = false;
    for c in trimmed.chars() {
        if c.is_control() || c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(if c == ',' { COMMA_SUBSTITUTE } else { c });
    }

    Cow::Owned(out)
}
