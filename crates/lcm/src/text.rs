//! Text helpers shared by the store, the escalation ladder and the tools.

/// Cheap token estimate: characters divided by four, rounded up.
///
/// Used everywhere thresholds are checked; not required to match any
/// particular tokenizer.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

/// Largest index `<= max_bytes` that falls on a char boundary.
fn floor_boundary(text: &str, max_bytes: usize) -> usize {
    if max_bytes >= text.len() {
        return text.len();
    }
    let mut idx = max_bytes;
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest index `>= min_bytes` that falls on a char boundary.
fn ceil_boundary(text: &str, min_bytes: usize) -> usize {
    if min_bytes >= text.len() {
        return text.len();
    }
    let mut idx = min_bytes;
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// First `max_bytes` of `text` without splitting a character.
pub fn head(text: &str, max_bytes: usize) -> &str {
    &text[..floor_boundary(text, max_bytes)]
}

/// Last `max_bytes` of `text` without splitting a character.
pub fn tail(text: &str, max_bytes: usize) -> &str {
    if max_bytes >= text.len() {
        return text;
    }
    &text[ceil_boundary(text, text.len() - max_bytes)..]
}

/// Short display preview with an ellipsis marker.
pub fn preview(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        text.to_string()
    } else {
        format!("{}...", head(text, max_bytes))
    }
}
