//! Terminal rendering for the CLI. Presentation only; never touches session state.

use std::fmt::Write as _;

use crate::messages::Citation;

/// Excerpts are cut to this many characters when shown.
pub const EXCERPT_LIMIT: usize = 200;

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Numbered source list: title, URL, then the truncated excerpt.
pub fn citations_block(citations: &[Citation]) -> String {
    let mut out = String::new();
    if citations.is_empty() {
        return out;
    }
    let _ = writeln!(out, "Sources:");
    for (i, c) in citations.iter().enumerate() {
        let _ = writeln!(out, "  [{}] {} <{}>", i + 1, c.title, c.url);
        let excerpt = truncate_excerpt(c.content.trim(), EXCERPT_LIMIT);
        if !excerpt.is_empty() {
            let _ = writeln!(out, "      {}", excerpt.replace('\n', " "));
        }
    }
    out
}

/// The part of `current` not yet printed.
///
/// Returns `None` when `current` no longer extends what was printed, which
/// happens when a new query reset the answer.
pub fn unprinted_suffix<'a>(current: &'a str, printed: &str) -> Option<&'a str> {
    current.strip_prefix(printed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(truncate_excerpt("abc", 200), "abc");
        assert_eq!(truncate_excerpt("", 3), "");
        assert_eq!(truncate_excerpt("abc", 3), "abc");
    }

    #[test]
    fn cuts_on_char_boundary() {
        assert_eq!(truncate_excerpt("abcdef", 3), "abc...");
        assert_eq!(truncate_excerpt("héllo wörld", 7), "héllo w...");
    }

    #[test]
    fn citations_are_numbered_in_order() {
        let citations = vec![
            Citation {
                title: "Rust".into(),
                url: "https://rust-lang.org".into(),
                content: "x".repeat(300),
            },
            Citation {
                title: "Tokio".into(),
                url: "https://tokio.rs".into(),
                content: String::new(),
            },
        ];
        let block = citations_block(&citations);
        let lines: Vec<_> = block.lines().collect();
        assert_eq!(lines[0], "Sources:");
        assert_eq!(lines[1], "  [1] Rust <https://rust-lang.org>");
        assert_eq!(lines[2].trim().len(), 203);
        assert_eq!(lines[3], "  [2] Tokio <https://tokio.rs>");
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn suffix_tracks_growth() {
        assert_eq!(unprinted_suffix("Hi there", "Hi"), Some(" there"));
        assert_eq!(unprinted_suffix("Hi", "Hi"), Some(""));
        assert_eq!(unprinted_suffix("", "Hi"), None);
        assert_eq!(unprinted_suffix("Goodbye", "Hi"), None);
    }
}
