//! Shared utility helpers.

/// Truncate a string to `max` bytes, appending `…` if trimmed.
///
/// Backs off to the nearest char boundary so multi-byte text never
/// splits mid-codepoint.
pub fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

/// Render a JSON value as a single-line display string.
///
/// Strings are returned bare (no surrounding quotes); everything else
/// is compact-serialised.
pub fn json_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_short_string_unchanged() {
        assert_eq!(truncate_str("hello", 10), "hello");
    }

    #[test]
    fn truncate_long_string_appends_ellipsis() {
        let out = truncate_str("abcdefgh", 4);
        assert_eq!(out, "abcd…");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_str("héllo wörld", 2);
        assert!(out.ends_with('…'));
        assert!(out.len() <= 2 + '…'.len_utf8());
    }

    #[test]
    fn json_display_unwraps_strings() {
        assert_eq!(json_to_display(&serde_json::json!("plain")), "plain");
        assert_eq!(json_to_display(&serde_json::json!({"a": 1})), "{\"a\":1}");
    }
}
