use std::collections::HashSet;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::dedup_guard::{self, ContentKind};
use super::format_repair::{FormatRepairEngine, clean_whitespace};
use super::preprocessor::IncrementalPreprocessor;
use super::text_cache::TextCache;
use super::think_tag::{ThinkTagDemultiplexer, ThinkTagState};
use crate::models::{ProcessedResult, StreamEvent};
use crate::settings::{FormatCorrectionConfig, StreamSettings};

/// Shortest head/tail overlap treated as a retransmitted prefix
const MIN_OVERLAP_CHARS: usize = 6;
/// Chunks shorter than this are never fingerprinted
const MIN_LEDGER_CHARS: usize = 24;

#[derive(Debug, Error, PartialEq)]
pub enum AssemblyError {
    #[error("chunk of {len} bytes exceeds the {limit} byte limit")]
    ChunkTooLarge { len: usize, limit: usize },

    #[error("message would grow to {len} bytes, over the {limit} byte limit")]
    MessageTooLarge { len: usize, limit: usize },
}

/// Everything one assembler accumulates for a single request.
/// Only ever touched while holding `MessageProcessor::state`.
#[derive(Debug, Default)]
struct AssemblyState {
    accumulated_text: String,
    accumulated_reasoning: String,
    output_type: Option<String>,
    dedup_ledger: HashSet<String>,
    think: ThinkTagState,
    cancelled: bool,
    reasoning_finished: bool,
}

/// Caches and configuration shared by every assembler of a session.
///
/// Caches are owned here rather than in statics so that separate sessions
/// (and tests) never observe each other's entries.
#[derive(Clone)]
pub struct PipelineContext {
    correction: FormatCorrectionConfig,
    settings: StreamSettings,
    preprocess_cache: TextCache,
    repair_cache: TextCache,
}

impl PipelineContext {
    pub fn new(correction: FormatCorrectionConfig, settings: StreamSettings) -> Self {
        let preprocess_cache = TextCache::new(correction.max_cache_size);
        let repair_cache = TextCache::new(correction.max_cache_size);
        Self {
            correction,
            settings,
            preprocess_cache,
            repair_cache,
        }
    }

    pub fn settings(&self) -> &StreamSettings {
        &self.settings
    }

    pub fn correction(&self) -> &FormatCorrectionConfig {
        &self.correction
    }

    /// Create a fresh assembler for a new outgoing request
    pub fn new_processor(&self) -> MessageProcessor {
        MessageProcessor {
            state: Mutex::new(AssemblyState::default()),
            preprocessor: IncrementalPreprocessor::new(
                self.correction.clone(),
                self.preprocess_cache.clone(),
            ),
            engine: FormatRepairEngine::new(self.correction.clone(), self.repair_cache.clone()),
            progressive: self.correction.enable_progressive_correction,
            max_chunk_bytes: self.settings.max_chunk_bytes,
            max_message_bytes: self.settings.max_message_bytes,
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.preprocess_cache.len() + self.repair_cache.len()
    }
}

/// Incremental content assembler for one streamed message
pub struct MessageProcessor {
    state: Mutex<AssemblyState>,
    preprocessor: IncrementalPreprocessor,
    engine: FormatRepairEngine,
    /// Repair on every update instead of only when rendering the final text
    progressive: bool,
    max_chunk_bytes: usize,
    max_message_bytes: usize,
}

impl MessageProcessor {
    /// Apply one stream event and report what changed.
    ///
    /// Events for the same instance are serialized behind its lock. Failures
    /// are reported as `ProcessedResult::Error` and leave the accumulated
    /// state as it was before the event.
    pub fn process_event(&self, event: &StreamEvent, message_id: &str) -> ProcessedResult {
        let mut state = self.state.lock();
        if state.cancelled {
            return ProcessedResult::Cancelled;
        }

        match self.apply(&mut state, event) {
            Ok(result) => result,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Rejected stream event");
                ProcessedResult::Error(e.to_string())
            }
        }
    }

    fn apply(
        &self,
        state: &mut AssemblyState,
        event: &StreamEvent,
    ) -> Result<ProcessedResult, AssemblyError> {
        match event {
            StreamEvent::ContentFinal(text) => {
                self.check_message_len(text.len())?;
                state.accumulated_text = text.clone();
                state.dedup_ledger.clear();
                Ok(ProcessedResult::ContentUpdated(
                    self.engine.repair(&state.accumulated_text),
                ))
            }
            StreamEvent::ContentDelta(text) => self.apply_content_delta(state, text),
            StreamEvent::ReasoningDelta(text) => {
                if text.is_empty() {
                    return Ok(ProcessedResult::NoChange);
                }
                self.check_chunk_len(text.len())?;
                let chunk = self
                    .preprocessor
                    .preprocess(text, &state.accumulated_reasoning);
                if dedup_guard::should_skip(&chunk, &state.accumulated_reasoning) {
                    return Ok(ProcessedResult::NoChange);
                }
                self.check_message_len(state.accumulated_reasoning.len() + chunk.len())?;
                state.accumulated_reasoning.push_str(&chunk);
                Ok(ProcessedResult::ReasoningUpdated(
                    self.render_progress(&state.accumulated_reasoning),
                ))
            }
            StreamEvent::Error(message) => {
                self.check_chunk_len(message.len())?;
                let trimmed = message.trim();
                if !trimmed.is_empty()
                    && !dedup_guard::should_skip(trimmed, &state.accumulated_text)
                {
                    let mut block = String::new();
                    if !state.accumulated_text.trim().is_empty() {
                        block.push_str("\n\n");
                    }
                    block.push_str(trimmed);
                    block.push_str("\n\n");
                    self.check_message_len(state.accumulated_text.len() + block.len())?;
                    state.accumulated_text.push_str(&block);
                }
                Ok(ProcessedResult::ContentUpdated(clean_whitespace(
                    &state.accumulated_text,
                )))
            }
            StreamEvent::StatusUpdate(stage) => Ok(ProcessedResult::StatusUpdate(stage.clone())),
            StreamEvent::WebSearchResults(results) => {
                Ok(ProcessedResult::WebSearchResults(results.clone()))
            }
            StreamEvent::OutputTypeTag(kind) => {
                state.output_type = Some(kind.clone());
                Ok(ProcessedResult::OutputType(kind.clone()))
            }
            StreamEvent::ImageResult(url) => Ok(ProcessedResult::ImageUrl(url.clone())),
            StreamEvent::ToolCallFinished | StreamEvent::Finish(_) | StreamEvent::StreamEnd => {
                let held = ThinkTagDemultiplexer::flush(&mut state.think);
                if let Some(thinking) = held.thinking {
                    state.accumulated_reasoning.push_str(&thinking);
                }
                if let Some(answer) = held.answer {
                    state.accumulated_text.push_str(&answer);
                }
                state.dedup_ledger.clear();
                state.reasoning_finished = true;
                debug!(
                    text_len = state.accumulated_text.len(),
                    reasoning_len = state.accumulated_reasoning.len(),
                    "Stream reached terminal event"
                );
                Ok(ProcessedResult::ReasoningComplete)
            }
        }
    }

    fn apply_content_delta(
        &self,
        state: &mut AssemblyState,
        text: &str,
    ) -> Result<ProcessedResult, AssemblyError> {
        if text.is_empty() {
            return Ok(ProcessedResult::NoChange);
        }
        self.check_chunk_len(text.len())?;

        let chunk = self.preprocessor.preprocess(text, &state.accumulated_text);
        let fingerprint = ledger_fingerprint(&chunk);
        if let Some(fp) = &fingerprint
            && state.dedup_ledger.contains(fp)
        {
            debug!("Dropped retransmitted chunk");
            return Ok(ProcessedResult::NoChange);
        }

        // Work on a copy of the tag state so a rejected event leaves it untouched
        let mut think = state.think.clone();
        let split = ThinkTagDemultiplexer::process(&chunk, &mut think);

        let thinking = split
            .thinking
            .filter(|t| !dedup_guard::should_skip(t, &state.accumulated_reasoning));
        let answer = split
            .answer
            .and_then(|a| new_answer_suffix(&state.accumulated_text, &a));

        if let Some(t) = &thinking {
            self.check_message_len(state.accumulated_reasoning.len() + t.len())?;
        }
        if let Some(a) = &answer {
            self.check_message_len(state.accumulated_text.len() + a.len())?;
        }

        state.think = think;
        if split.closed {
            state.reasoning_finished = true;
        }
        if let Some(fp) = fingerprint
            && (thinking.is_some() || answer.is_some())
        {
            state.dedup_ledger.insert(fp);
        }

        let reasoning_changed = thinking.is_some();
        if let Some(thinking) = thinking {
            state.accumulated_reasoning.push_str(&thinking);
        }

        match answer {
            Some(answer) => {
                state.accumulated_text.push_str(&answer);
                let text = self.render_progress(&state.accumulated_text);
                if reasoning_changed {
                    return Ok(ProcessedResult::ContentAndReasoningUpdated {
                        text,
                        reasoning: self.render_progress(&state.accumulated_reasoning),
                    });
                }
                Ok(ProcessedResult::ContentUpdated(text))
            }
            None if reasoning_changed => Ok(ProcessedResult::ReasoningUpdated(
                self.render_progress(&state.accumulated_reasoning),
            )),
            None => Ok(ProcessedResult::NoChange),
        }
    }

    fn render_progress(&self, text: &str) -> String {
        if self.progressive {
            self.engine.repair(text)
        } else {
            clean_whitespace(text)
        }
    }

    fn check_chunk_len(&self, len: usize) -> Result<(), AssemblyError> {
        if len > self.max_chunk_bytes {
            return Err(AssemblyError::ChunkTooLarge {
                len,
                limit: self.max_chunk_bytes,
            });
        }
        Ok(())
    }

    fn check_message_len(&self, len: usize) -> Result<(), AssemblyError> {
        if len > self.max_message_bytes {
            return Err(AssemblyError::MessageTooLarge {
                len,
                limit: self.max_message_bytes,
            });
        }
        Ok(())
    }

    /// Raw accumulated answer text
    pub fn get_current_text(&self) -> String {
        self.state.lock().accumulated_text.clone()
    }

    /// Raw accumulated reasoning text
    pub fn get_current_reasoning(&self) -> String {
        self.state.lock().accumulated_reasoning.clone()
    }

    /// Repaired answer text, as it should be displayed
    pub fn render_text(&self) -> String {
        let text = self.get_current_text();
        self.engine.repair(&text)
    }

    /// Repaired reasoning text, as it should be displayed
    pub fn render_reasoning(&self) -> String {
        let reasoning = self.get_current_reasoning();
        self.engine.repair(&reasoning)
    }

    pub fn output_type(&self) -> Option<String> {
        self.state.lock().output_type.clone()
    }

    /// Whether the reasoning segment of this message is finished
    pub fn reasoning_finished(&self) -> bool {
        self.state.lock().reasoning_finished
    }

    /// Stop accepting events. Idempotent.
    pub fn cancel(&self) {
        self.state.lock().cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Return every field to its initial value
    pub fn reset(&self) {
        *self.state.lock() = AssemblyState::default();
    }
}

/// Fingerprint for the retransmission ledger, or `None` for chunks too short
/// or too markup-heavy to be safely recognized as repeats
fn ledger_fingerprint(chunk: &str) -> Option<String> {
    let normalized = chunk.trim();
    if normalized.chars().count() < MIN_LEDGER_CHARS
        || normalized.contains('|')
        || dedup_guard::has_protected_markers(normalized)
        || dedup_guard::classify(normalized) != ContentKind::Regular
    {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

/// Longest suffix of `existing` that equals a prefix of `delta`, in bytes.
/// Only overlaps of at least `MIN_OVERLAP_CHARS` characters that look like a
/// retransmission count.
fn overlap_len(existing: &str, delta: &str) -> usize {
    let max = existing.len().min(delta.len());
    (1..=max)
        .rev()
        .filter(|&n| delta.is_char_boundary(n) && existing.is_char_boundary(existing.len() - n))
        .take_while(|&n| delta[..n].chars().count() >= MIN_OVERLAP_CHARS)
        .find(|&n| existing.ends_with(&delta[..n]) && is_resent_span(existing, delta, n))
        .unwrap_or(0)
}

/// The shared span `delta[..n]` must sit on word boundaries on both sides and
/// hold at least two different words. Digit runs and repeated words fail this
/// and are kept as new text.
fn is_resent_span(existing: &str, delta: &str, n: usize) -> bool {
    let span = &delta[..n];
    let before = &existing[..existing.len() - n];
    if span.starts_with(char::is_alphanumeric) && before.ends_with(char::is_alphanumeric) {
        return false;
    }
    if span.ends_with(char::is_alphanumeric) && delta[n..].starts_with(char::is_alphanumeric) {
        return false;
    }
    let mut words = span.split_whitespace();
    let first = words.next();
    words.any(|word| Some(word) != first)
}

/// The part of `delta` that is new relative to `existing`, if any survives
/// the dedup guard
fn new_answer_suffix(existing: &str, delta: &str) -> Option<String> {
    let fresh = if existing.is_empty() {
        delta
    } else if existing.chars().count() >= MIN_OVERLAP_CHARS && delta.starts_with(existing) {
        // Cumulative delivery: the delta repeats everything so far
        &delta[existing.len()..]
    } else if dedup_guard::has_protected_markers(delta) {
        delta
    } else {
        &delta[overlap_len(existing, delta)..]
    };

    if fresh.is_empty() || dedup_guard::should_skip(fresh, existing) {
        return None;
    }
    Some(fresh.to_string())
}
