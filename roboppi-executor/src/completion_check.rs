//! Completion-check marker scanning (spec.md §4.9). The check worker's
//! observations are scanned last-line-wins for one of three
//! word-boundary, case-insensitive markers; anything else is FAIL.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMarker {
    Complete,
    Incomplete,
    Fail,
}

pub fn scan(observations: &[String]) -> CompletionMarker {
    for line in observations.iter().rev() {
        if let Some(marker) = scan_line(line) {
            return marker;
        }
    }
    CompletionMarker::Fail
}

fn scan_line(line: &str) -> Option<CompletionMarker> {
    let upper = line.to_uppercase();
    if contains_word(&upper, "COMPLETE") {
        Some(CompletionMarker::Complete)
    } else if contains_word(&upper, "INCOMPLETE") {
        Some(CompletionMarker::Incomplete)
    } else if contains_word(&upper, "FAIL") {
        Some(CompletionMarker::Fail)
    } else {
        None
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    let bytes = haystack.as_bytes();
    let word_bytes = word.as_bytes();
    let is_boundary = |b: u8| !b.is_ascii_alphanumeric();

    let mut start = 0;
    while let Some(pos) = haystack[start..].find(word) {
        let idx = start + pos;
        let before_ok = idx == 0 || is_boundary(bytes[idx - 1]);
        let after_idx = idx + word_bytes.len();
        let after_ok = after_idx >= bytes.len() || is_boundary(bytes[after_idx]);
        if before_ok && after_ok {
            return true;
        }
        start = idx + 1;
        if start >= haystack.len() {
            break;
        }
    }
    false
}
