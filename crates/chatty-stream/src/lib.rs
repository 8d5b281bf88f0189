//! Streaming chat assembly for Chatty.
//!
//! Model output arrives as a sequence of [`StreamEvent`]s. A
//! [`MessageProcessor`] turns them into de-duplicated, repaired answer and
//! reasoning text, and a [`StreamController`] per [`Lane`] owns the request
//! lifecycle: supersede/cancel handling, throttled UI updates, image retries
//! and persistence.

pub mod controllers;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use controllers::{CancelToken, ChatSession, StreamController};
pub use models::{
    CancelCause, ConversationsStore, Lane, LaneEvent, MessageUpdate, ProcessedResult,
    StreamEvent, StreamStatus,
};
pub use repositories::{ChatPersistence, InMemoryChatRepository, MessageSnapshot};
pub use services::{
    FormatRepairEngine, MessageProcessor, PipelineContext, ScriptedTransport, StreamTransport,
};
pub use settings::{CorrectionIntensity, FormatCorrectionConfig, StreamSettings};
