//! Small helpers shared across the proxy.

/// Return the greatest valid UTF-8 char boundary at or below `index`.
///
/// Mirrors `str::floor_char_boundary` while remaining compatible with
/// stable toolchains where that API is not available. Every cut the
/// streaming layer makes into the answer buffer goes through this.
pub fn floor_utf8_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }

    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Truncate a string to at most `max_chars` characters, appending "..."
/// if anything was cut. Safe on multi-byte UTF-8 input; used to keep
/// upstream error bodies readable in logs.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", s[..idx].trim_end()),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_boundary_ascii() {
        assert_eq!(floor_utf8_char_boundary("hello", 0), 0);
        assert_eq!(floor_utf8_char_boundary("hello", 3), 3);
        assert_eq!(floor_utf8_char_boundary("hello", 99), 5);
    }

    #[test]
    fn floor_boundary_multibyte() {
        let s = "aé你🦀";
        assert_eq!(floor_utf8_char_boundary(s, 1), 1);
        // Index 2 is inside "é" (2-byte char), floor moves back to 1.
        assert_eq!(floor_utf8_char_boundary(s, 2), 1);
        // Index 5 is inside "你" (3-byte char), floor moves back to 3.
        assert_eq!(floor_utf8_char_boundary(s, 5), 3);
    }

    #[test]
    fn truncate_ascii() {
        assert_eq!(truncate_with_ellipsis("hello", 10), "hello");
        assert_eq!(truncate_with_ellipsis("hello world", 5), "hello...");
    }

    #[test]
    fn truncate_cjk_is_boundary_safe() {
        let s = "这是一段用于日志截断的中文文本";
        let out = truncate_with_ellipsis(s, 6);
        assert!(out.ends_with("..."));
        assert!(out.is_char_boundary(out.len() - 3));
    }
}
