//! Repeat detection for streamed chunks.
//!
//! Every rule here errs on the side of keeping text: a chunk is only rejected
//! when it is clearly a retransmission of something already accumulated.

use std::collections::HashSet;

/// Whitespace-only chunks longer than this are treated as a flood
const BLANK_FLOOD_LEN: usize = 16;
/// Substring-based repeat tests only apply to chunks at least this long
const MIN_REPEAT_CHARS: usize = 20;
/// Lines shorter than this don't count toward the multi-line repeat ratio
const MIN_LINE_CHARS: usize = 8;
const MULTILINE_MIN_LINES: usize = 3;
const MULTILINE_REPEAT_RATIO: f64 = 0.8;

/// Markup that is never discarded, even when a shallow match suggests a repeat
const PROTECTED_MARKERS: &[&str] = &["：", ":", "**", "$", "\\", "="];

const LATEX_TOKENS: &[&str] = &["\\frac", "\\sum", "\\int", "\\sqrt", "\\begin{", "^{", "_{"];

/// Content class of a candidate chunk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentKind {
    Heading,
    Math,
    Code,
    /// Prose carrying label-like punctuation
    Important,
    Regular,
}

pub fn classify(candidate: &str) -> ContentKind {
    let trimmed = candidate.trim_start();
    if trimmed.starts_with('#') {
        ContentKind::Heading
    } else if candidate.contains('$')
        || candidate.contains('\\')
        || LATEX_TOKENS.iter().any(|t| candidate.contains(t))
    {
        ContentKind::Math
    } else if candidate.contains('`') {
        ContentKind::Code
    } else if candidate.contains('：') || candidate.contains(':') || candidate.contains("**") {
        ContentKind::Important
    } else {
        ContentKind::Regular
    }
}

pub fn has_protected_markers(candidate: &str) -> bool {
    PROTECTED_MARKERS.iter().any(|m| candidate.contains(m))
}

/// Decide whether `candidate` repeats content already in `existing`
pub fn should_skip(candidate: &str, existing: &str) -> bool {
    if candidate.is_empty() {
        return true;
    }
    if candidate.trim().is_empty() {
        return candidate.chars().count() > BLANK_FLOOD_LEN;
    }
    if !existing.is_empty() && candidate == existing {
        return true;
    }
    if has_protected_markers(candidate) {
        return false;
    }

    let trimmed = candidate.trim();
    let long_enough = trimmed.chars().count() >= MIN_REPEAT_CHARS;

    let repeated = match classify(candidate) {
        ContentKind::Heading | ContentKind::Math | ContentKind::Code => {
            long_enough && existing.lines().any(|line| line.trim() == trimmed)
        }
        ContentKind::Important => false,
        ContentKind::Regular => long_enough && is_flanked_repeat(candidate, existing),
    };

    repeated || is_multiline_repeat(candidate, existing)
}

/// The candidate occurs in `existing` with non-empty text on both sides
fn is_flanked_repeat(candidate: &str, existing: &str) -> bool {
    existing
        .match_indices(candidate)
        .any(|(start, _)| start > 0 && start + candidate.len() < existing.len())
}

fn is_multiline_repeat(candidate: &str, existing: &str) -> bool {
    let lines: Vec<&str> = candidate
        .lines()
        .map(str::trim)
        .filter(|l| l.chars().count() >= MIN_LINE_CHARS)
        .collect();
    if lines.len() < MULTILINE_MIN_LINES {
        return false;
    }

    let known: HashSet<&str> = existing.lines().map(str::trim).collect();
    let seen = lines.iter().filter(|l| known.contains(*l)).count();
    seen as f64 / lines.len() as f64 >= MULTILINE_REPEAT_RATIO
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_whitespace() {
        assert!(should_skip("", "anything"));
        assert!(!should_skip("\n\n", "para"));
        assert!(should_skip(&" ".repeat(40), "para"));
    }

    #[test]
    fn test_verbatim_repeat_of_everything() {
        assert!(should_skip("Hello world", "Hello world"));
    }

    #[test]
    fn test_short_tokens_never_skipped() {
        let existing = "the cat sat on the mat and the dog";
        assert!(!should_skip(" the", existing));
        assert!(!should_skip("the", existing));
    }

    #[test]
    fn test_flanked_prose_repeat_is_skipped() {
        let sentence = "the quick brown fox jumps over the lazy dog";
        let existing = format!("Intro. {} Then more text.", sentence);
        assert!(should_skip(sentence, &existing));
    }

    #[test]
    fn test_title_followed_by_body_is_kept() {
        // Occurrence at the very start is a title, not an in-place repeat
        let existing = "Understanding ownership in Rust programs";
        assert!(!should_skip("Understanding ownership in Rust", existing));
    }

    #[test]
    fn test_protected_markup_is_kept() {
        let existing = "Result: the answer is $x = 42$ and more text follows here";
        assert!(!should_skip("$x = 42$", existing));
        assert!(!should_skip("Result: the answer is", existing));
    }

    #[test]
    fn test_heading_requires_exact_line() {
        let existing = "## Installation guide for beginners\n\nSteps follow.";
        assert!(should_skip("## Installation guide for beginners", existing));
        assert!(!should_skip("## Installation guide", existing));
    }

    #[test]
    fn test_multiline_retransmission() {
        let existing = "first line of the answer\nsecond line of the answer\nthird line of the answer\n";
        let candidate = "first line of the answer\nsecond line of the answer\nthird line of the answer";
        assert!(should_skip(candidate, &format!("{}tail", existing)));

        let fresh = "first line of the answer\nsomething entirely new\nand another new line";
        assert!(!should_skip(fresh, existing));
    }

    #[test]
    fn test_classification() {
        assert_eq!(classify("# Title"), ContentKind::Heading);
        assert_eq!(classify("x^{2}"), ContentKind::Math);
        assert_eq!(classify("`code`"), ContentKind::Code);
        assert_eq!(classify("Note: careful"), ContentKind::Important);
        assert_eq!(classify("plain words"), ContentKind::Regular);
    }
}
