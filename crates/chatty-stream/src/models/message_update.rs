use super::lane::{Lane, StreamStatus};
use super::stream_event::WebSearchResult;

/// A proposed mutation of one message, keyed by message id.
///
/// The pipeline never owns the message list; the UI collaborator applies these
/// on its own execution context. `None` fields leave the message untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessageUpdate {
    pub message_id: String,
    pub text: Option<String>,
    pub reasoning: Option<String>,
    pub output_type: Option<String>,
    /// Complete de-duplicated image list for the message, not a delta
    pub image_urls: Option<Vec<String>>,
    pub web_search_results: Option<Vec<WebSearchResult>>,
    pub status: Option<String>,
    pub error_flag: bool,
}

impl MessageUpdate {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.reasoning.is_none()
            && self.output_type.is_none()
            && self.image_urls.is_none()
            && self.web_search_results.is_none()
            && self.status.is_none()
            && !self.error_flag
    }

    /// Fold a newer update for the same message into this one.
    ///
    /// Newer values win field by field; the error flag is sticky.
    pub fn merge(&mut self, newer: MessageUpdate) {
        debug_assert_eq!(self.message_id, newer.message_id);
        if newer.text.is_some() {
            self.text = newer.text;
        }
        if newer.reasoning.is_some() {
            self.reasoning = newer.reasoning;
        }
        if newer.output_type.is_some() {
            self.output_type = newer.output_type;
        }
        if newer.image_urls.is_some() {
            self.image_urls = newer.image_urls;
        }
        if newer.web_search_results.is_some() {
            self.web_search_results = newer.web_search_results;
        }
        if newer.status.is_some() {
            self.status = newer.status;
        }
        self.error_flag |= newer.error_flag;
    }
}

/// Events emitted by a `StreamController` for the UI collaborator.
/// Each variant is tagged with its lane so subscribers can filter.
#[derive(Clone, Debug, PartialEq)]
pub enum LaneEvent {
    /// A placeholder assistant message was created for a new stream
    MessageCreated { lane: Lane, message_id: String },
    /// Throttled content mutation
    MessageUpdated { lane: Lane, update: MessageUpdate },
    /// The placeholder message must be removed from the list
    MessageRemoved { lane: Lane, message_id: String },
    /// Thinking block for this message is finished
    ReasoningCompleted { lane: Lane, message_id: String },
    /// A user-visible notice (e.g. content was filtered)
    Notice { lane: Lane, message: String },
    StreamEnded {
        lane: Lane,
        message_id: String,
        status: StreamStatus,
    },
}

impl LaneEvent {
    pub fn lane(&self) -> Lane {
        match self {
            LaneEvent::MessageCreated { lane, .. }
            | LaneEvent::MessageUpdated { lane, .. }
            | LaneEvent::MessageRemoved { lane, .. }
            | LaneEvent::ReasoningCompleted { lane, .. }
            | LaneEvent::Notice { lane, .. }
            | LaneEvent::StreamEnded { lane, .. } => *lane,
        }
    }
}
