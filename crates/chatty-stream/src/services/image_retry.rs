//! Classification of image-generation attempts.
//!
//! The image backend sometimes answers with plain text and no image. Such a
//! response is retried, unless the text is a recognizable backend failure
//! or the backend flagged the content, both of which end the request.

use crate::settings::StreamSettings;

/// Output type tag the backend uses for filtered responses
pub const CONTENT_FILTER_TAG: &str = "content_filter";

const FILTER_SIGNATURES: &[&str] = &[
    "content_filter",
    "content filter",
    "safety system",
    "content policy",
    "responsible ai policy",
];

/// Response text that means retrying will not help
const BACKEND_ERROR_SIGNATURES: &[&str] = &[
    // region restriction
    "not available in your region",
    "unsupported_country_region_territory",
    "region is not supported",
    // upstream failure
    "upstream error",
    "upstream connect error",
    "bad gateway",
    "service unavailable",
    // non-JSON payloads from a proxy
    "unexpected token '<'",
    "is not valid json",
    "<!doctype html",
    // quota
    "insufficient_quota",
    "quota exceeded",
    "rate limit exceeded",
];

const IMAGE_KEYWORDS: &[&str] = &[
    "image", "picture", "photo", "draw", "paint", "sketch", "illustrat", "render", "logo",
    "wallpaper", "portrait", "generate", "design", "画", "图",
];

const QUESTION_STARTERS: &[&str] = &[
    "what", "why", "how", "who", "when", "where", "which", "explain", "tell me", "can you tell",
    "is it", "are there", "does", "do you",
];

/// Result of a single image-generation attempt
#[derive(Clone, Debug, PartialEq)]
pub enum AttemptOutcome {
    /// At least one image URL arrived
    Image,
    /// Backend failure recognized from the response text; shown as-is
    BackendError(String),
    /// The backend refused the content
    Filtered,
    /// No image and nothing decisive; eligible for retry
    Empty,
}

impl AttemptOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptOutcome::Empty)
    }
}

/// What an attempt produced, gathered by the controller while streaming
#[derive(Clone, Debug, Default)]
pub struct AttemptReport {
    pub image_urls: Vec<String>,
    pub text: String,
    pub output_type: Option<String>,
    pub errors: Vec<String>,
}

pub fn is_backend_error(text: &str) -> bool {
    let lower = text.to_lowercase();
    BACKEND_ERROR_SIGNATURES.iter().any(|s| lower.contains(s))
}

fn has_filter_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    FILTER_SIGNATURES.iter().any(|s| lower.contains(s))
}

pub fn classify_attempt(report: &AttemptReport) -> AttemptOutcome {
    if report.output_type.as_deref() == Some(CONTENT_FILTER_TAG)
        || report.errors.iter().any(|e| has_filter_signature(e))
    {
        return AttemptOutcome::Filtered;
    }
    if !report.image_urls.is_empty() {
        return AttemptOutcome::Image;
    }
    if let Some(error) = report.errors.iter().find(|e| is_backend_error(e)) {
        return AttemptOutcome::BackendError(error.trim().to_string());
    }
    if is_backend_error(&report.text) {
        return AttemptOutcome::BackendError(report.text.trim().to_string());
    }
    AttemptOutcome::Empty
}

/// A prompt that asks a question without mentioning anything visual
pub fn is_text_only_intent(prompt: &str) -> bool {
    let lower = prompt.trim().to_lowercase();
    if lower.is_empty() || IMAGE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return false;
    }
    lower.ends_with('?')
        || lower.ends_with('？')
        || QUESTION_STARTERS.iter().any(|q| lower.starts_with(q))
}

/// Total attempts allowed for an image request
pub fn max_attempts(prompt: &str, settings: &StreamSettings) -> u32 {
    let attempts = if is_text_only_intent(prompt) {
        settings.image_text_only_max_attempts
    } else {
        settings.image_max_attempts
    };
    attempts.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_wins_over_text() {
        let report = AttemptReport {
            image_urls: vec!["https://cdn/1.png".to_string()],
            text: "Here you go".to_string(),
            ..Default::default()
        };
        assert_eq!(classify_attempt(&report), AttemptOutcome::Image);
    }

    #[test]
    fn test_backend_error_signatures_are_terminal() {
        let report = AttemptReport {
            text: "Upstream error: model overloaded".to_string(),
            ..Default::default()
        };
        let outcome = classify_attempt(&report);
        assert_eq!(
            outcome,
            AttemptOutcome::BackendError("Upstream error: model overloaded".to_string())
        );
        assert!(!outcome.is_retryable());

        let report = AttemptReport {
            errors: vec!["Unexpected token '<', \"<html>\" is not valid JSON".to_string()],
            ..Default::default()
        };
        assert!(matches!(classify_attempt(&report), AttemptOutcome::BackendError(_)));
    }

    #[test]
    fn test_filter_detection() {
        let tagged = AttemptReport {
            output_type: Some(CONTENT_FILTER_TAG.to_string()),
            ..Default::default()
        };
        assert_eq!(classify_attempt(&tagged), AttemptOutcome::Filtered);

        let errored = AttemptReport {
            errors: vec!["Request was rejected by the safety system".to_string()],
            ..Default::default()
        };
        assert_eq!(classify_attempt(&errored), AttemptOutcome::Filtered);
    }

    #[test]
    fn test_plain_text_is_retryable() {
        let report = AttemptReport {
            text: "I will create that for you.".to_string(),
            ..Default::default()
        };
        assert!(classify_attempt(&report).is_retryable());
    }

    #[test]
    fn test_text_only_intent() {
        assert!(is_text_only_intent("What is the capital of France?"));
        assert!(is_text_only_intent("explain borrowing"));
        assert!(!is_text_only_intent("Draw a cat wearing a hat"));
        assert!(!is_text_only_intent("Can you generate a logo?"));
        assert!(!is_text_only_intent("a sunset over mountains"));
    }

    #[test]
    fn test_max_attempts_by_intent() {
        let settings = StreamSettings::default();
        assert_eq!(max_attempts("a red fox in snow", &settings), 3);
        assert_eq!(max_attempts("Why is the sky blue?", &settings), 1);

        let zero = StreamSettings {
            image_max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(max_attempts("a red fox", &zero), 1);
    }
}
