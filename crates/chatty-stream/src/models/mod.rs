pub mod conversations_store;
pub mod lane;
pub mod message_update;
pub mod stream_event;

pub use conversations_store::{ChatMessage, ConversationsStore};
pub use lane::{CancelCause, Lane, LanePhase, LaneRuntime, LaneSnapshot, StreamStatus};
pub use message_update::{LaneEvent, MessageUpdate};
pub use stream_event::{ProcessedResult, StreamEvent, WebSearchResult};
