//! Text canonicalization and chunk joining for streamed replies.
//!
//! Canonical form drives every merge decision: all line-break variants
//! collapse to one space and runs of spaces/tabs collapse to one space.

/// Collapse line breaks and horizontal whitespace runs to single spaces.
///
/// Leading/trailing whitespace is kept (as a single space) so chunk
/// boundaries survive; use [`canonical`] for comparisons.
pub fn normalize_chunk(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.chars() {
        match ch {
            '\r' | '\n' | ' ' | '\t' => pending_space = true,
            _ => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                out.push(ch);
            }
        }
    }
    if pending_space {
        out.push(' ');
    }
    out
}

/// Normalized and trimmed, for equality/prefix checks
pub fn canonical(text: &str) -> String {
    normalize_chunk(text).trim().to_string()
}

/// Concatenate two chunks, inserting one space only between two ASCII
/// alphanumerics so tokens do not collide
pub fn join_chunk(before: &str, chunk: &str) -> String {
    if before.is_empty() {
        return chunk.to_string();
    }
    if chunk.is_empty() {
        return before.to_string();
    }

    let last = before.chars().last().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
    let first = chunk.chars().next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);

    if last && first {
        format!("{} {}", before, chunk)
    } else {
        format!("{}{}", before, chunk)
    }
}

/// Merge a streamed chunk into the text received so far.
///
/// Cumulative chunks (the backend resending everything so far) replace the
/// previous text; repeats are no-ops; anything else is appended.
pub fn merge_text(previous: &str, chunk: &str) -> String {
    let prev = normalize_chunk(previous);
    let next = normalize_chunk(chunk);

    if prev.is_empty() {
        return next;
    }
    if next.is_empty() || next == prev {
        return prev;
    }
    if next.starts_with(&prev) {
        return next;
    }
    join_chunk(&prev, &next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_line_breaks() {
        assert_eq!(normalize_chunk("a\r\nb\rc\n\n\nd"), "a b c d");
        assert_eq!(normalize_chunk("a \t  b"), "a b");
        assert_eq!(normalize_chunk(" \n"), " ");
        assert_eq!(canonical("  hi \n there "), "hi there");
    }

    #[test]
    fn test_join_spacing() {
        assert_eq!(join_chunk("Hello", "world"), "Hello world");
        assert_eq!(join_chunk("Hello,", "world"), "Hello,world");
        assert_eq!(join_chunk("Hello", "!"), "Hello!");
        assert_eq!(join_chunk("你好", "世界"), "你好世界");
        assert_eq!(join_chunk("", "x"), "x");
        assert_eq!(join_chunk("x", ""), "x");
    }

    #[test]
    fn test_merge_cumulative_chunks() {
        let mut text = String::new();
        for chunk in ["Hello", "Hello, wor", "Hello, world"] {
            text = merge_text(&text, chunk);
        }
        assert_eq!(text, "Hello, world");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge_text("", "same text");
        let twice = merge_text(&once, "same text");
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_delta_chunks() {
        let text = merge_text("The answer", "is 42");
        assert_eq!(text, "The answer is 42");

        let text = merge_text("第一句。", "第二句。");
        assert_eq!(text, "第一句。第二句。");
    }

    #[test]
    fn test_merge_empty_chunk_keeps_previous() {
        assert_eq!(merge_text("kept\ntext", ""), "kept text");
    }
}
