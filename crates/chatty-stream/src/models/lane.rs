use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Independent streaming conversation contexts
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Text,
    Image,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lane::Text => write!(f, "text"),
            Lane::Image => write!(f, "image"),
        }
    }
}

/// Why a stream was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// The user pressed stop; partial content is kept and finalized as-is
    UserCancelled,
    /// A newer request in the same lane replaces this one
    Superseded,
}

/// Status of a stream lifecycle
#[derive(Clone, Debug, PartialEq)]
pub enum StreamStatus {
    Completed,
    Cancelled(CancelCause),
    /// The placeholder was dropped because the backend filtered the response
    Filtered,
    Error(String),
}

/// Lifecycle phase of a lane's controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LanePhase {
    Idle,
    Starting,
    Streaming,
    Completing,
    Cancelling,
}

/// Per-lane runtime state, mutated only by that lane's `StreamController`.
#[derive(Debug)]
pub struct LaneRuntime {
    pub phase: LanePhase,
    /// Generation of the job currently owning the lane
    pub active_job: Option<u64>,
    pub streaming_message_id: Option<String>,
    pub is_calling: bool,
    /// Attempts already retried for the current image request (image lane only)
    pub retry_count: u32,
    pub reasoning_complete: HashMap<String, bool>,
}

impl LaneRuntime {
    pub fn new() -> Self {
        Self {
            phase: LanePhase::Idle,
            active_job: None,
            streaming_message_id: None,
            is_calling: false,
            retry_count: 0,
            reasoning_complete: HashMap::new(),
        }
    }

    pub fn is_reasoning_complete(&self, message_id: &str) -> bool {
        self.reasoning_complete
            .get(message_id)
            .copied()
            .unwrap_or(false)
    }
}

impl Default for LaneRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a `LaneRuntime`, handed out to callers
#[derive(Clone, Debug, PartialEq)]
pub struct LaneSnapshot {
    pub phase: LanePhase,
    pub has_active_job: bool,
    pub streaming_message_id: Option<String>,
    pub is_calling: bool,
    pub retry_count: u32,
}

impl From<&LaneRuntime> for LaneSnapshot {
    fn from(runtime: &LaneRuntime) -> Self {
        Self {
            phase: runtime.phase,
            has_active_job: runtime.active_job.is_some(),
            streaming_message_id: runtime.streaming_message_id.clone(),
            is_calling: runtime.is_calling,
            retry_count: runtime.retry_count,
        }
    }
}
