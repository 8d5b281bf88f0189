//! Splits `<think>…</think>` reasoning out of an answer stream.
//!
//! Tags may straddle chunk boundaries: a chunk ending in a prefix of the tag
//! we are waiting for (e.g. `"<thi"`) holds that prefix back until the next
//! chunk decides it. Only one reasoning segment per message is recognized;
//! once the closing tag has been seen, everything else is answer text.

const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// Demultiplexer state, owned by the assembler's `AssemblyState`
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThinkTagState {
    /// Reasoning text seen since the opening tag. Non-empty only while inside.
    pub think_buffer: String,
    pub inside_think_tag: bool,
    /// The closing tag has been seen; the reasoning segment is finished
    pub found_think_tag: bool,
    /// Trailing text that may be the start of the tag being waited for
    pub pending_tag: String,
}

/// Output of one demultiplexing step
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ThinkSplit {
    pub thinking: Option<String>,
    pub answer: Option<String>,
    /// The closing tag was found during this step
    pub closed: bool,
}

impl ThinkSplit {
    fn push_thinking(&mut self, text: &str) {
        if !text.is_empty() {
            self.thinking.get_or_insert_with(String::new).push_str(text);
        }
    }

    fn push_answer(&mut self, text: &str) {
        if !text.is_empty() {
            self.answer.get_or_insert_with(String::new).push_str(text);
        }
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_tag_suffix(text: &str, tag: &str) -> usize {
    let max = (tag.len() - 1).min(text.len());
    (1..=max)
        .rev()
        .find(|&n| text.is_char_boundary(text.len() - n) && tag.starts_with(&text[text.len() - n..]))
        .unwrap_or(0)
}

pub struct ThinkTagDemultiplexer;

impl ThinkTagDemultiplexer {
    /// Feed one chunk, updating `state`
    pub fn process(chunk: &str, state: &mut ThinkTagState) -> ThinkSplit {
        let mut split = ThinkSplit::default();
        let mut combined = std::mem::take(&mut state.pending_tag);
        combined.push_str(chunk);

        if state.found_think_tag {
            split.push_answer(&combined);
            return split;
        }

        let mut rest = combined.as_str();
        if !state.inside_think_tag {
            match rest.find(OPEN_TAG) {
                Some(pos) => {
                    split.push_answer(&rest[..pos]);
                    rest = &rest[pos + OPEN_TAG.len()..];
                    state.inside_think_tag = true;
                }
                None => {
                    let hold = partial_tag_suffix(rest, OPEN_TAG);
                    split.push_answer(&rest[..rest.len() - hold]);
                    state.pending_tag = rest[rest.len() - hold..].to_string();
                    return split;
                }
            }
        }

        match rest.find(CLOSE_TAG) {
            Some(pos) => {
                split.push_thinking(&rest[..pos]);
                split.push_answer(&rest[pos + CLOSE_TAG.len()..]);
                state.think_buffer.clear();
                state.inside_think_tag = false;
                state.found_think_tag = true;
                split.closed = true;
            }
            None => {
                let hold = partial_tag_suffix(rest, CLOSE_TAG);
                let thinking = &rest[..rest.len() - hold];
                split.push_thinking(thinking);
                state.think_buffer.push_str(thinking);
                state.pending_tag = rest[rest.len() - hold..].to_string();
            }
        }

        split
    }

    /// Release any held-back partial tag at end of stream
    pub fn flush(state: &mut ThinkTagState) -> ThinkSplit {
        let mut split = ThinkSplit::default();
        let pending = std::mem::take(&mut state.pending_tag);
        if state.inside_think_tag {
            split.push_thinking(&pending);
        } else {
            split.push_answer(&pending);
        }
        split
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(chunks: &[&str]) -> (String, String, ThinkTagState) {
        let mut state = ThinkTagState::default();
        let mut thinking = String::new();
        let mut answer = String::new();
        for chunk in chunks {
            let split = ThinkTagDemultiplexer::process(chunk, &mut state);
            thinking.push_str(split.thinking.as_deref().unwrap_or(""));
            answer.push_str(split.answer.as_deref().unwrap_or(""));
        }
        (thinking, answer, state)
    }

    #[test]
    fn test_plain_text_is_answer() {
        let (thinking, answer, state) = feed(&["Hello ", "world"]);
        assert_eq!(thinking, "");
        assert_eq!(answer, "Hello world");
        assert!(!state.found_think_tag);
    }

    #[test]
    fn test_both_tags_in_one_chunk() {
        let (thinking, answer, state) = feed(&["<think>plan</think>answer"]);
        assert_eq!(thinking, "plan");
        assert_eq!(answer, "answer");
        assert!(state.found_think_tag);
        assert!(!state.inside_think_tag);
        assert!(state.think_buffer.is_empty());
    }

    #[test]
    fn test_tags_split_across_chunks() {
        let (thinking, answer, state) = feed(&["<thi", "nk>reasoning</th", "ink>answer"]);
        assert_eq!(thinking, "reasoning");
        assert_eq!(answer, "answer");
        assert!(state.found_think_tag);
        assert!(state.pending_tag.is_empty());
    }

    #[test]
    fn test_buffer_only_while_inside() {
        let mut state = ThinkTagState::default();
        ThinkTagDemultiplexer::process("<think>step one", &mut state);
        assert!(state.inside_think_tag);
        assert_eq!(state.think_buffer, "step one");

        let split = ThinkTagDemultiplexer::process(" step two", &mut state);
        assert_eq!(split.thinking.as_deref(), Some(" step two"));
        assert_eq!(state.think_buffer, "step one step two");

        let split = ThinkTagDemultiplexer::process("</think>done", &mut state);
        assert!(split.closed);
        assert!(state.think_buffer.is_empty());
        assert_eq!(split.answer.as_deref(), Some("done"));
    }

    #[test]
    fn test_second_segment_is_answer_text() {
        let (thinking, answer, _) = feed(&["<think>a</think>b", "<think>c</think>"]);
        assert_eq!(thinking, "a");
        assert_eq!(answer, "b<think>c</think>");
    }

    #[test]
    fn test_lone_angle_bracket_not_held_forever() {
        let (thinking, answer, state) = feed(&["x <", " y"]);
        assert_eq!(thinking, "");
        assert_eq!(answer, "x < y");
        assert!(state.pending_tag.is_empty());
    }

    #[test]
    fn test_flush_releases_pending_prefix() {
        let mut state = ThinkTagState::default();
        let split = ThinkTagDemultiplexer::process("a <th", &mut state);
        assert_eq!(split.answer.as_deref(), Some("a "));
        let flushed = ThinkTagDemultiplexer::flush(&mut state);
        assert_eq!(flushed.answer.as_deref(), Some("<th"));
        assert!(flushed.thinking.is_none());
    }

    #[test]
    fn test_multibyte_text_is_safe() {
        let (thinking, answer, _) = feed(&["<think>思考中", "…</think>答案"]);
        assert_eq!(thinking, "思考中…");
        assert_eq!(answer, "答案");
    }
}
