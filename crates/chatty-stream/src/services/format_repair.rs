//! Whole-message repair of structurally broken model output.
//!
//! Passes only append closers or strip trailing commas. They are repeated
//! until the text stops changing, so `repair(repair(x)) == repair(x)`.
//! Fenced code blocks and inline code spans are hidden behind placeholders
//! before tag and math balancing.

use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use thiserror::Error;
use tracing::{debug, warn};

use super::text_cache::{ContentCacheKey, TextCache};
use crate::settings::FormatCorrectionConfig;

/// Characters the engine can scan per millisecond of budget
const REPAIR_CHARS_PER_MS: usize = 20_000;
/// Upper bound on pass rounds before the text must have settled
const MAX_REPAIR_ROUNDS: usize = 8;

const FENCE: &str = "```";
const PLACEHOLDER_OPEN: char = '\u{E000}';
const PLACEHOLDER_CLOSE: char = '\u{E001}';

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track",
    "wbr",
];

const KNOWN_HTML_TAGS: &[&str] = &[
    "a", "article", "b", "blockquote", "button", "center", "code", "del", "details", "div", "em",
    "figure", "font", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "i", "ins",
    "kbd", "label", "li", "mark", "nav", "ol", "p", "pre", "s", "section", "small", "span",
    "strong", "sub", "summary", "sup", "table", "tbody", "td", "th", "thead", "tr", "u", "ul",
];

const MATH_FUNCTIONS: &[&str] = &[
    "sin", "cos", "tan", "log", "ln", "exp", "lim", "sum", "int", "frac", "sqrt", "alpha", "beta",
    "theta", "pi",
];

const CODE_LINE_PREFIXES: &[&str] = &[
    "fn ", "pub ", "let ", "const ", "def ", "function ", "import ", "class ", "return ",
    "#include", "use ", "if ", "for ", "while ",
];

static TAG_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<(/?)([A-Za-z][A-Za-z0-9:_-]*)(?:\s[^<>]*)?>").expect("TAG_REGEX pattern is valid")
});

static FENCED_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```.*?```").expect("FENCED_BLOCK_REGEX pattern is valid")
});

static INLINE_CODE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`\n]+`").expect("INLINE_CODE_REGEX pattern is valid"));

static JSON_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(```json[ \t]*\n)(.*?)(```)").expect("JSON_BLOCK_REGEX pattern is valid")
});

static MATH_OPERATOR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\d\s*[-+*/^=<>]\s*\d|[A-Za-z0-9)\]}]\s*=\s*[-A-Za-z0-9(\\]|[A-Za-z0-9)\]}][_^](?:[{\d]|[A-Za-z](?:[^A-Za-z]|$))|\\[A-Za-z]+",
    )
    .expect("MATH_OPERATOR_REGEX pattern is valid")
});

#[derive(Debug, Error, PartialEq)]
pub enum RepairError {
    #[error("repair exceeded its time budget ({elapsed_ms}ms > {budget_ms}ms)")]
    BudgetExceeded { elapsed_ms: u128, budget_ms: u64 },

    #[error("input too large to repair ({len} bytes, limit {limit})")]
    InputTooLarge { len: usize, limit: usize },
}

/// Normalize line endings, collapse runs of blank lines outside code fences,
/// and trim trailing whitespace at the end of the text.
pub fn clean_whitespace(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let mut out: Vec<&str> = Vec::new();
    let mut in_fence = false;
    let mut blank_run = 0;

    for line in normalized.split('\n') {
        if line.trim_start().starts_with(FENCE) {
            in_fence = !in_fence;
            blank_run = 0;
            out.push(line);
            continue;
        }
        if !in_fence && line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push(line);
    }

    out.join("\n").trim_end().to_string()
}

/// Remove commas directly preceding `}` or `]` outside string literals
pub fn strip_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }

    out
}

/// Wrap bare object keys (`{name: 1}`) in double quotes
fn quote_bare_keys(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() + 8);
    let mut in_string = false;
    let mut escaped = false;
    let mut expect_key = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            i += 1;
            continue;
        }

        if expect_key && (ch.is_ascii_alphabetic() || ch == '_') {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let mut j = i;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            if j < chars.len() && chars[j] == ':' {
                out.push('"');
                out.push_str(&ident);
                out.push('"');
            } else {
                out.push_str(&ident);
            }
            expect_key = false;
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                expect_key = false;
            }
            '{' | ',' => expect_key = true,
            c if c.is_whitespace() => {}
            _ => expect_key = false,
        }
        out.push(ch);
        i += 1;
    }

    out
}

/// Result of a stack-based bracket scan
struct BracketScan {
    closers: String,
    open_string: bool,
}

fn scan_brackets(code: &str) -> BracketScan {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in code.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '(' => stack.push(')'),
            '[' => stack.push(']'),
            '{' => stack.push('}'),
            ')' | ']' | '}' => {
                if stack.last() == Some(&ch) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    BracketScan {
        closers: stack.into_iter().rev().collect(),
        open_string: in_string,
    }
}

fn has_unterminated_fence(text: &str) -> bool {
    text.matches(FENCE).count() % 2 == 1
}

fn looks_like_code(text: &str) -> bool {
    // A lone `$$` line is a closer appended by the math pass
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "$$")
        .collect();
    if lines.len() < 2 {
        return false;
    }
    let code_lines = lines
        .iter()
        .filter(|l| {
            l.ends_with(';')
                || l.ends_with('{')
                || l.ends_with('}')
                || CODE_LINE_PREFIXES.iter().any(|p| l.starts_with(p))
        })
        .count();
    code_lines * 2 >= lines.len()
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') {
        return true;
    }
    trimmed.strip_prefix('[').is_some_and(|rest| {
        rest.trim_start()
            .starts_with(|c: char| matches!(c, '{' | '[' | '"' | '-') || c.is_ascii_digit())
    })
}

fn repair_json_document(doc: &str) -> String {
    let mut fixed = quote_bare_keys(doc);
    let scan = scan_brackets(&fixed);
    if scan.open_string {
        fixed.push('"');
        let rescan = scan_brackets(&fixed);
        fixed.push_str(&rescan.closers);
    } else {
        fixed.push_str(&scan.closers);
    }
    strip_trailing_commas(&fixed)
}

/// Replace fenced blocks and inline code spans with indexed placeholders
fn protect_code(text: &str) -> (String, Vec<String>) {
    let mut saved = Vec::new();
    let mut protect = |input: &str, regex: &Regex| -> String {
        regex
            .replace_all(input, |caps: &regex::Captures| {
                saved.push(caps[0].to_string());
                format!("{}{}{}", PLACEHOLDER_OPEN, saved.len() - 1, PLACEHOLDER_CLOSE)
            })
            .into_owned()
    };
    let without_blocks = protect(text, &FENCED_BLOCK_REGEX);
    let protected = protect(&without_blocks, &INLINE_CODE_REGEX);
    (protected, saved)
}

fn restore_code(text: &str, saved: &[String]) -> String {
    let mut out = text.to_string();
    // Inline spans were protected after blocks and can contain block
    // placeholders, so restore in reverse.
    for (idx, original) in saved.iter().enumerate().rev() {
        let marker = format!("{}{}{}", PLACEHOLDER_OPEN, idx, PLACEHOLDER_CLOSE);
        out = out.replacen(&marker, original, 1);
    }
    out
}

fn count_display_delimiters(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'$' && (i == 0 || bytes[i - 1] != b'\\') {
            count += 1;
            i += 2;
        } else {
            i += 1;
        }
    }
    count
}

fn single_dollar_count(line: &str) -> usize {
    line.replace("\\$", "").replace("$$", "").matches('$').count()
}

fn has_math_indicator(line: &str) -> bool {
    MATH_OPERATOR_REGEX.is_match(line)
        || MATH_FUNCTIONS.iter().any(|f| {
            line.match_indices(f).any(|(pos, _)| {
                let before = line[..pos].chars().next_back();
                let after = line[pos + f.len()..].chars().next();
                !before.is_some_and(char::is_alphabetic) && !after.is_some_and(char::is_alphabetic)
            })
        })
}

/// Repairs fenced code, JSON, HTML/XML tags and math delimiters over the whole
/// accumulated text.
#[derive(Clone)]
pub struct FormatRepairEngine {
    config: FormatCorrectionConfig,
    cache: TextCache,
}

impl FormatRepairEngine {
    pub fn new(config: FormatCorrectionConfig, cache: TextCache) -> Self {
        Self { config, cache }
    }

    /// Repair `text`, falling back to the whitespace-cleaned input on failure
    pub fn repair(&self, text: &str) -> String {
        let cleaned = clean_whitespace(text);
        if !self.config.correction_intensity.structural() || Self::is_well_formed(&cleaned) {
            return cleaned;
        }

        let key = ContentCacheKey::new(&cleaned);
        if self.config.enable_caching
            && let Some(hit) = self.cache.get(&key)
        {
            return hit;
        }

        let repaired = match self.try_repair(&cleaned) {
            Ok(repaired) => repaired,
            Err(e) => {
                warn!(error = %e, len = cleaned.len(), "Format repair failed, using cleaned text");
                return cleaned;
            }
        };

        if self.config.enable_caching {
            self.cache.insert(key, repaired.clone());
            // A repaired text maps to itself
            self.cache
                .insert(ContentCacheKey::new(&repaired), repaired.clone());
        }
        repaired
    }

    /// Fast path: text without any structural trigger needs no repair
    fn is_well_formed(text: &str) -> bool {
        !text.contains(['{', '[', '(', '<', '$', '`'])
    }

    fn try_repair(&self, text: &str) -> Result<String, RepairError> {
        let budget_ms = self.config.max_processing_time_ms;
        let limit = (budget_ms as usize).max(1) * REPAIR_CHARS_PER_MS;
        if text.len() > limit {
            return Err(RepairError::InputTooLarge {
                len: text.len(),
                limit,
            });
        }

        let started = Instant::now();
        let check_budget = || -> Result<(), RepairError> {
            let elapsed_ms = started.elapsed().as_millis();
            if elapsed_ms > budget_ms as u128 {
                return Err(RepairError::BudgetExceeded {
                    elapsed_ms,
                    budget_ms,
                });
            }
            Ok(())
        };

        let mut current = text.to_string();
        for round in 1..=MAX_REPAIR_ROUNDS {
            let mut out = current.clone();
            if self.config.enable_programming_syntax_correction {
                out = self.repair_code(&out);
                check_budget()?;
            }
            if self.config.enable_json_correction {
                out = self.repair_json(&out);
                check_budget()?;
            }
            if self.config.enable_xml_html_correction {
                out = self.repair_tags(&out);
                check_budget()?;
            }
            if self.config.enable_math_correction {
                out = self.repair_math(&out);
                check_budget()?;
            }

            let out = clean_whitespace(&out);
            if out == current {
                debug!(before = text.len(), after = out.len(), rounds = round, "Format repair applied");
                return Ok(out);
            }
            current = out;
        }

        warn!(len = text.len(), "Format repair did not settle");
        Ok(current)
    }

    /// Close an unterminated trailing code fence (balancing its brackets first),
    /// or balance brackets of fence-less text that reads as code.
    fn repair_code(&self, text: &str) -> String {
        if has_unterminated_fence(text) {
            let Some(opener) = text.rfind(FENCE) else {
                return text.to_string();
            };
            let body_start = text[opener..]
                .find('\n')
                .map(|n| opener + n + 1)
                .unwrap_or(text.len());
            let mut out = text.to_string();
            let scan = scan_brackets(&text[body_start..]);
            if !scan.open_string {
                out.push_str(&scan.closers);
            }
            out.push('\n');
            out.push_str(FENCE);
            return out;
        }

        if !text.contains(FENCE) && !looks_like_json(text) && looks_like_code(text) {
            let scan = scan_brackets(text);
            if !scan.open_string && !scan.closers.is_empty() {
                return format!("{}{}", text, scan.closers);
            }
        }
        text.to_string()
    }

    fn repair_json(&self, text: &str) -> String {
        if !text.contains(FENCE) && looks_like_json(text) {
            return repair_json_document(text);
        }
        if has_unterminated_fence(text) {
            return text.to_string();
        }
        JSON_BLOCK_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                let body = caps[2].trim_end();
                let fixed = if body.is_empty() {
                    String::new()
                } else {
                    format!("{}\n", repair_json_document(body))
                };
                format!("{}{}{}", &caps[1], fixed, &caps[3])
            })
            .into_owned()
    }

    fn repair_tags(&self, text: &str) -> String {
        if has_unterminated_fence(text) {
            return text.to_string();
        }
        let (protected, saved) = protect_code(text);

        let closed_names: HashSet<&str> = TAG_REGEX
            .captures_iter(&protected)
            .filter(|c| &c[1] == "/")
            .filter_map(|c| c.get(2).map(|m| m.as_str()))
            .collect();

        let mut stack: Vec<String> = Vec::new();
        for caps in TAG_REGEX.captures_iter(&protected) {
            let name = &caps[2];
            let lower = name.to_ascii_lowercase();
            if &caps[1] == "/" {
                if let Some(pos) = stack.iter().rposition(|open| open == name) {
                    stack.truncate(pos);
                }
                continue;
            }
            let self_closing = caps[0].ends_with("/>");
            if self_closing || VOID_ELEMENTS.contains(&lower.as_str()) {
                continue;
            }
            if KNOWN_HTML_TAGS.contains(&lower.as_str()) || closed_names.contains(name) {
                stack.push(name.to_string());
            }
        }

        if stack.is_empty() {
            return text.to_string();
        }
        let mut out = restore_code(&protected, &saved);
        for name in stack.iter().rev() {
            out.push_str("</");
            out.push_str(name);
            out.push('>');
        }
        out
    }

    fn repair_math(&self, text: &str) -> String {
        if has_unterminated_fence(text) || !text.contains('$') {
            return text.to_string();
        }
        let (protected, saved) = protect_code(text);

        let lines: Vec<String> = protected
            .split('\n')
            .map(|line| {
                let unbalanced = single_dollar_count(line) % 2 == 1;
                if unbalanced
                    && !line.ends_with('$')
                    && !line.ends_with('\\')
                    && has_math_indicator(line)
                {
                    format!("{}$", line)
                } else {
                    line.to_string()
                }
            })
            .collect();
        let mut balanced = lines.join("\n");

        if count_display_delimiters(&balanced) % 2 == 1 {
            balanced.push_str("\n$$");
        }
        restore_code(&balanced, &saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> FormatRepairEngine {
        FormatRepairEngine::new(FormatCorrectionConfig::default(), TextCache::new(64))
    }

    fn assert_idempotent(input: &str) {
        let engine = engine();
        let once = engine.repair(input);
        let uncached = FormatRepairEngine::new(
            FormatCorrectionConfig {
                enable_caching: false,
                ..Default::default()
            },
            TextCache::new(1),
        );
        assert_eq!(uncached.repair(&once), once, "not idempotent for {:?}", input);
        assert_eq!(engine.repair(&once), once);
    }

    #[test]
    fn test_clean_text_passes_through() {
        let engine = engine();
        assert_eq!(engine.repair("Hello world.\n\n\n\nBye.  \n"), "Hello world.\n\nBye.");
    }

    #[test]
    fn test_json_keys_and_trailing_commas() {
        let engine = engine();
        assert_eq!(engine.repair("{name: \"x\", tags: [1, 2,],}"), "{\"name\": \"x\", \"tags\": [1, 2]}");
    }

    #[test]
    fn test_json_truncated_document() {
        let engine = engine();
        assert_eq!(engine.repair("{\"a\": {\"b\": [1, 2"), "{\"a\": {\"b\": [1, 2]}}");
        assert_eq!(engine.repair("{\"a\": 1,"), "{\"a\": 1}");
        assert_eq!(engine.repair("{\"msg\": \"hel"), "{\"msg\": \"hel\"}");
    }

    #[test]
    fn test_json_string_values_untouched() {
        let engine = engine();
        let input = "{\"msg\": \"a, b: c,]\"}";
        assert_eq!(engine.repair(input), input);
    }

    #[test]
    fn test_unclosed_html_tags() {
        let engine = engine();
        assert_eq!(
            engine.repair("<div><p>Hello <br> world"),
            "<div><p>Hello <br> world</p></div>"
        );
    }

    #[test]
    fn test_generics_in_code_are_not_tags() {
        let engine = engine();
        let input = "Use `Vec<String>` here:\n\n```rust\nlet v: Vec<String> = Vec::new();\n```";
        assert_eq!(engine.repair(input), input);
    }

    #[test]
    fn test_unterminated_fence_closed_with_brackets() {
        let engine = engine();
        assert_eq!(
            engine.repair("Example:\n```rust\nfn main() {\n    println!(\"hi\""),
            "Example:\n```rust\nfn main() {\n    println!(\"hi\")}\n```"
        );
    }

    #[test]
    fn test_display_math_balanced() {
        let engine = engine();
        assert_eq!(engine.repair("$$\nx^2 + y^2"), "$$\nx^2 + y^2\n$$");
    }

    #[test]
    fn test_inline_math_only_with_indicator() {
        let engine = engine();
        assert_eq!(engine.repair("Energy: $E = mc^2"), "Energy: $E = mc^2$");
        // Currency stays untouched
        assert_eq!(engine.repair("It costs $5 today"), "It costs $5 today");
    }

    #[test]
    fn test_dollar_in_code_span_ignored() {
        let engine = engine();
        let input = "Run `echo $HOME` then x";
        assert_eq!(engine.repair(input), input);
    }

    #[test]
    fn test_light_intensity_only_cleans() {
        let engine = FormatRepairEngine::new(
            FormatCorrectionConfig {
                correction_intensity: crate::settings::CorrectionIntensity::Light,
                ..Default::default()
            },
            TextCache::new(8),
        );
        assert_eq!(engine.repair("<div>open\r\n"), "<div>open");
    }

    #[test]
    fn test_oversized_input_falls_back_to_cleaned() {
        let engine = FormatRepairEngine::new(
            FormatCorrectionConfig {
                max_processing_time_ms: 0,
                ..Default::default()
            },
            TextCache::new(8),
        );
        let big = format!("<div>{}", "a".repeat(REPAIR_CHARS_PER_MS + 1));
        assert_eq!(engine.repair(&big), big);
    }

    #[test]
    fn test_code_like_text_without_fence() {
        let engine = engine();
        assert_eq!(
            engine.repair("fn main() {\n    let x = compute(1, 2;\n"),
            "fn main() {\n    let x = compute(1, 2;)}"
        );
    }

    #[test]
    fn test_repair_is_idempotent() {
        for input in [
            "",
            "plain prose (with a note",
            "{a: 1, b: [1,2,",
            "<section><div>text",
            "Value $x^2 and $$\\int_0^1",
            "```python\ndef f(x):\n    return (x",
            "```json\n{key: 1,}\n```",
            "Mixed <b>bold and `code $x` and $y = 2",
            "price $5 and $",
            "fn a() {\n    b(\"unterminated\n}",
            "[1, 2, {\"k\": \"v\"",
            "<Custom>xml</Custom><Custom>open",
            "fn area(r: f64) -> f64 { $$\\pi r^2",
            "if y {</div>$$",
            "return (z_$$]",
            "```json\nkey: 1,\n\n\n",
        ] {
            assert_idempotent(input);
        }
    }

    #[test]
    fn test_math_closer_does_not_make_text_code() {
        let engine = engine();
        assert_eq!(
            engine.repair("fn area(r: f64) -> f64 { $$\\pi r^2"),
            "fn area(r: f64) -> f64 { $$\\pi r^2\n$$"
        );
    }

    #[test]
    fn test_fragment_combinations_are_idempotent() {
        let fragments = [
            "",
            "fn area(r: f64) -> f64 {",
            " $$",
            "\\pi r^2",
            "\n",
            "\n\n\n",
            "<div>",
            "</div>",
            "(z_",
            "]",
            "```json\n",
            "key: 1,",
            "```",
            "$x = 1",
            "{\"a\": [",
            "return (",
            "if y {",
            " costs $5 per user_id",
            "\"open",
            "`code $y`",
        ];
        let engine = FormatRepairEngine::new(
            FormatCorrectionConfig {
                enable_caching: false,
                ..Default::default()
            },
            TextCache::new(1),
        );
        for a in fragments {
            for b in fragments {
                for c in fragments {
                    let input = format!("{}{}{}", a, b, c);
                    let once = engine.repair(&input);
                    assert_eq!(engine.repair(&once), once, "not idempotent for {:?}", input);
                }
            }
        }
    }

    #[test]
    fn test_identifier_underscore_is_not_math() {
        let engine = engine();
        assert_eq!(engine.repair("$5 per user_id"), "$5 per user_id");
        assert_eq!(engine.repair("Index $x_1 + y"), "Index $x_1 + y$");
    }
}
