//! Text helpers for outbound reply segments and log lines

use std::borrow::Cow;
use regex::Regex;
use lazy_static::lazy_static;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"[ \t]+").unwrap();
    static ref PARAGRAPH_REGEX: Regex = Regex::new(r"\n\s*\n+").unwrap();
    static ref SENTENCE_END_REGEX: Regex = Regex::new(r"[.!?。！？…]+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of spaces/tabs and trim. Newlines are kept.
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        if WHITESPACE_REGEX.is_match(text) || text.trim().len() != text.len() {
            Cow::Owned(WHITESPACE_REGEX.replace_all(text, " ").trim().to_string())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// Split generated text into the chunks sent as separate outbound messages.
    ///
    /// Blank lines always separate segments. Inside a paragraph, sentences are
    /// packed greedily until `max_segment_chars` would be exceeded. At most
    /// `max_segments` are returned; the remainder is folded into the last one.
    pub fn split_reply_segments(text: &str, max_segment_chars: usize, max_segments: usize) -> Vec<String> {
        let normalized = Self::normalize_whitespace(text);
        if normalized.is_empty() {
            return Vec::new();
        }

        let mut segments = Vec::new();
        for paragraph in PARAGRAPH_REGEX.split(&normalized) {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if paragraph.chars().count() <= max_segment_chars {
                segments.push(paragraph.to_string());
                continue;
            }

            let mut current = String::new();
            for sentence in Self::sentences(paragraph) {
                let fits = current.chars().count() + sentence.chars().count() <= max_segment_chars;
                if !current.is_empty() && !fits {
                    segments.push(current.trim().to_string());
                    current.clear();
                }
                current.push_str(sentence);
            }
            if !current.trim().is_empty() {
                segments.push(current.trim().to_string());
            }
        }

        let max_segments = max_segments.max(1);
        if segments.len() > max_segments {
            let tail = segments.split_off(max_segments - 1).join(" ");
            segments.push(tail);
        }
        segments
    }

    /// Sentences with their terminating punctuation attached.
    fn sentences(paragraph: &str) -> Vec<&str> {
        let mut out = Vec::new();
        let mut start = 0;
        for m in SENTENCE_END_REGEX.find_iter(paragraph) {
            out.push(&paragraph[start..m.end()]);
            start = m.end();
        }
        if start < paragraph.len() {
            out.push(&paragraph[start..]);
        }
        out
    }

    /// Truncate text to max chars with ellipsis if needed
    pub fn truncate_with_ellipsis(text: &str, max_len: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_len {
            Cow::Borrowed(text)
        } else if max_len <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_len - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_reply_is_one_segment() {
        let segments = TextUtils::split_reply_segments("  hello   there  ", 100, 3);
        assert_eq!(segments, vec!["hello there"]);
    }

    #[test]
    fn test_blank_lines_split() {
        let segments = TextUtils::split_reply_segments("first\n\nsecond", 100, 3);
        assert_eq!(segments, vec!["first", "second"]);
    }

    #[test]
    fn test_long_paragraph_split_by_sentence() {
        let text = "One two three. Four five six! Seven eight nine?";
        let segments = TextUtils::split_reply_segments(text, 20, 5);
        assert_eq!(segments, vec!["One two three.", "Four five six!", "Seven eight nine?"]);
    }

    #[test]
    fn test_segment_count_capped() {
        let segments = TextUtils::split_reply_segments("a\n\nb\n\nc\n\nd", 100, 2);
        assert_eq!(segments, vec!["a", "b c d"]);
    }

    #[test]
    fn test_empty_text_has_no_segments() {
        assert!(TextUtils::split_reply_segments("   ", 100, 3).is_empty());
    }

    #[test]
    fn test_truncate_with_ellipsis() {
        assert_eq!(TextUtils::truncate_with_ellipsis("short", 10), "short");
        assert_eq!(TextUtils::truncate_with_ellipsis("a longer line", 8), "a lon...");
        assert_eq!(TextUtils::truncate_with_ellipsis("abcdef", 2), "...");
    }
}
