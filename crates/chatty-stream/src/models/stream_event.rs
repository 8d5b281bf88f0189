use serde::{Deserialize, Serialize};

/// One result entry delivered by the backend's web-search tool
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// Events produced by the transport for a single request.
///
/// The sequence is ordered and may end at any point; a closed sequence with
/// no terminal event is treated as `StreamEnd`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental answer text. Some backends deliver cumulative snapshots instead
    /// of true deltas; the assembler handles both.
    ContentDelta(String),
    /// Authoritative full replacement of the answer text
    ContentFinal(String),
    ReasoningDelta(String),
    Error(String),
    StatusUpdate(String),
    WebSearchResults(Vec<WebSearchResult>),
    OutputTypeTag(String),
    ImageResult(String),
    /// A tool call finished; terminal for the text sub-stream
    ToolCallFinished,
    /// Backend finish marker with its reason (`stop`, `length`, ...)
    Finish(String),
    StreamEnd,
}

impl StreamEvent {
    /// Whether the transport has nothing more to send for this request.
    /// Tool-call and finish markers close a segment but more text may follow.
    pub fn ends_stream(&self) -> bool {
        matches!(self, StreamEvent::StreamEnd)
    }
}

/// Outcome of feeding one event into the `MessageProcessor`
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessedResult {
    /// Repaired, display-ready answer text
    ContentUpdated(String),
    /// Repaired, display-ready reasoning text
    ReasoningUpdated(String),
    /// One event grew both the answer and a still-open reasoning segment
    ContentAndReasoningUpdated { text: String, reasoning: String },
    ReasoningComplete,
    StatusUpdate(String),
    WebSearchResults(Vec<WebSearchResult>),
    /// Output-type tag recorded; carries the tag for the controller
    OutputType(String),
    /// Image URL to merge into the message's image list
    ImageUrl(String),
    Error(String),
    Cancelled,
    NoChange,
}
