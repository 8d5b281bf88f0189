use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use tracing::debug;

use super::format_repair::strip_trailing_commas;
use super::text_cache::{ContentCacheKey, TextCache};
use crate::settings::{CorrectionIntensity, FormatCorrectionConfig};

/// Chunk length preprocessing will touch per millisecond of budget
const PREPROCESS_CHARS_PER_MS: usize = 200;

const FENCE: &str = "```";

/// Glyphs models emit that render badly; mapped to plain equivalents
const GLYPH_MAP: &[(char, &str)] = &[
    ('\u{00A0}', " "),
    ('\u{3000}', " "),
    ('\u{200B}', ""),
    ('\u{FEFF}', ""),
    ('＄', "$"),
];

static SPACE_BEFORE_PUNCT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\S) +([,;!?])(\s|$)").expect("SPACE_BEFORE_PUNCT_REGEX pattern is valid")
});

static GLUED_FENCE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([^\s`])```").expect("GLUED_FENCE_REGEX pattern is valid")
});

static HEADING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s{0,3}#{1,6})([^#\s])").expect("HEADING_REGEX pattern is valid")
});

static NUMBERED_LIST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\s*\d{1,3}\.)([^\s\d.])").expect("NUMBERED_LIST_REGEX pattern is valid")
});

/// Cheap per-chunk normalization applied before a chunk reaches the
/// demultiplexer and dedup guard.
#[derive(Clone)]
pub struct IncrementalPreprocessor {
    config: FormatCorrectionConfig,
    cache: TextCache,
}

impl IncrementalPreprocessor {
    pub fn new(config: FormatCorrectionConfig, cache: TextCache) -> Self {
        Self { config, cache }
    }

    /// Normalize `chunk` given the text accumulated before it.
    ///
    /// Returns the chunk unchanged when it would leave the message inside an
    /// open code fence, or when it is too large for the per-operation budget.
    pub fn preprocess(&self, chunk: &str, accumulated: &str) -> String {
        let fences_before = accumulated.matches(FENCE).count();
        if (fences_before + chunk.matches(FENCE).count()) % 2 == 1 {
            return chunk.to_string();
        }
        let limit = (self.config.max_processing_time_ms as usize).max(1) * PREPROCESS_CHARS_PER_MS;
        if chunk.len() > limit {
            debug!(len = chunk.len(), limit, "Chunk too large to preprocess");
            return chunk.to_string();
        }

        let in_fence = fences_before % 2 == 1;
        let at_line_start = accumulated.is_empty() || accumulated.ends_with('\n');
        let flags = u8::from(in_fence) | (u8::from(at_line_start) << 1);
        let key = ContentCacheKey::with_flags(chunk, flags);

        if self.config.enable_caching
            && let Some(hit) = self.cache.get(&key)
        {
            return hit;
        }

        let started = Instant::now();
        let processed = self.apply(chunk, in_fence, at_line_start);
        let elapsed_ms = started.elapsed().as_millis();
        if elapsed_ms > self.config.max_processing_time_ms as u128 {
            debug!(elapsed_ms, len = chunk.len(), "Preprocessing exceeded budget");
        }

        if self.config.enable_caching {
            self.cache.insert(key, processed.clone());
        }
        processed
    }

    fn apply(&self, chunk: &str, in_fence: bool, at_line_start: bool) -> String {
        let mut text = normalize_glyphs(chunk);
        let intensity = self.config.correction_intensity;
        if intensity == CorrectionIntensity::Light {
            return text;
        }

        if !in_fence {
            text = SPACE_BEFORE_PUNCT_REGEX
                .replace_all(&text, "$1$2$3")
                .into_owned();
        }
        text = GLUED_FENCE_REGEX.replace_all(&text, "$1\n```").into_owned();
        text = normalize_line_markers(&text, in_fence, at_line_start);

        if intensity == CorrectionIntensity::Aggressive
            && self.config.enable_json_correction
            && !in_fence
        {
            text = strip_trailing_commas(&text);
        }
        text
    }
}

fn normalize_glyphs(chunk: &str) -> String {
    let mut text = chunk.replace("\r\n", "\n");
    for (glyph, replacement) in GLYPH_MAP {
        if text.contains(*glyph) {
            text = text.replace(*glyph, replacement);
        }
    }
    text
}

/// Add the missing space in `##Heading` and `1.Item` at line starts outside fences
fn normalize_line_markers(text: &str, mut in_fence: bool, at_line_start: bool) -> String {
    let mut out = String::with_capacity(text.len() + 4);
    for (idx, line) in text.split('\n').enumerate() {
        if idx > 0 {
            out.push('\n');
        }
        if line.trim_start().starts_with(FENCE) {
            in_fence = !in_fence;
            out.push_str(line);
            continue;
        }
        let line_start = idx > 0 || at_line_start;
        if in_fence || !line_start {
            out.push_str(line);
            continue;
        }
        let fixed = HEADING_REGEX.replace(line, "$1 $2");
        let fixed = NUMBERED_LIST_REGEX.replace(&fixed, "$1 $2");
        out.push_str(&fixed);
    }
    out
}
