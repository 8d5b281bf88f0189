use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for the stream lifecycle controllers
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Minimum interval between UI-visible updates
    pub ui_throttle_interval_ms: u64,
    /// Attempts per image request (first attempt included)
    pub image_max_attempts: u32,
    /// Attempts when the image request reads as a plain question
    pub image_text_only_max_attempts: u32,
    /// Fixed delay between image attempts
    pub image_retry_backoff_ms: u64,
    /// Largest single chunk the assembler accepts
    pub max_chunk_bytes: usize,
    /// Largest accumulated answer or reasoning text per message
    pub max_message_bytes: usize,
}

impl StreamSettings {
    pub fn ui_throttle_interval(&self) -> Duration {
        Duration::from_millis(self.ui_throttle_interval_ms)
    }

    pub fn image_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.image_retry_backoff_ms)
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            ui_throttle_interval_ms: 100,
            image_max_attempts: 3,
            image_text_only_max_attempts: 1,
            image_retry_backoff_ms: 1500,
            max_chunk_bytes: 256 * 1024,
            max_message_bytes: 8 * 1024 * 1024,
        }
    }
}
