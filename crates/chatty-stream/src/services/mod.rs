pub mod dedup_guard;
pub mod format_repair;
pub mod image_retry;
pub mod message_processor;
pub mod preprocessor;
pub mod text_cache;
pub mod think_tag;
pub mod throttle;
pub mod transport;

pub use format_repair::{FormatRepairEngine, RepairError};
pub use image_retry::{AttemptOutcome, AttemptReport};
pub use message_processor::{AssemblyError, MessageProcessor, PipelineContext};
pub use preprocessor::IncrementalPreprocessor;
pub use text_cache::{ContentCacheKey, TextCache};
pub use think_tag::{ThinkSplit, ThinkTagDemultiplexer, ThinkTagState};
pub use throttle::UpdateThrottle;
pub use transport::{EventStream, ScriptStep, ScriptedTransport, StreamRequest, StreamTransport};
