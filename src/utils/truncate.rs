//! Truncation Utilities
//!
//! Character-bounded truncation for oracle fields and terminal output.
//! Cuts never split a UTF-8 character.

const ELLIPSIS: char = '…';

/// Cut `content` to at most `max_chars` characters, ending with an ellipsis
/// when something was dropped. Surrounding whitespace is trimmed first.
pub fn truncate_chars(content: &str, max_chars: usize) -> String {
    let content = content.trim();
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }

    let mut out: String = content.chars().take(max_chars - 1).collect();
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    out.push(ELLIPSIS);
    out
}
