use serde_json::Value;

/// Truncate `text` to at most `max_bytes`, cutting on a char boundary and
/// appending a marker with the original and kept sizes.
pub fn truncate_output(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut boundary = max_bytes;
    while !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!(
        "{}\n[truncated: {} bytes -> {} bytes]",
        &text[..boundary],
        text.len(),
        boundary
    )
}

/// Serialize a value for a prompt, truncated past `ceiling` bytes.
pub fn render_value(value: &Value, ceiling: usize) -> String {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    truncate_output(&text, ceiling)
}
