use std::time::Duration;

/// Truncate a string to `max` characters, appending `...` when shortened.
/// Counts characters, not bytes, so multi-byte UTF-8 never panics.
pub fn truncate(s: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }

    let char_count = s.chars().count();
    if char_count <= max {
        return s.to_string();
    }

    if max <= 3 {
        return s.chars().take(max).collect();
    }

    let truncated: String = s.chars().take(max - 3).collect();
    format!("{}...", truncated)
}

/// Format an elapsed duration the way it appears in response footers:
/// seconds with four decimal places.
pub fn format_elapsed(elapsed: Duration) -> String {
    format!("{:.4}", elapsed.as_secs_f64())
}
