use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use super::error::RepositoryResult;
use crate::models::Lane;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Serializable state of the assistant message being saved
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub message_id: String,
    pub text: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub is_error: bool,
    /// The stream was cut short and the content is partial
    #[serde(default)]
    pub partial: bool,
}

impl MessageSnapshot {
    pub fn has_content(&self) -> bool {
        !self.text.trim().is_empty()
            || !self.reasoning.trim().is_empty()
            || !self.image_urls.is_empty()
    }
}

/// Storage of finished (or cut short) conversations.
///
/// Called on normal completion, on user cancellation with content, and when
/// the active lane changes.
pub trait ChatPersistence: Send + Sync + 'static {
    fn save_current_chat(
        &self,
        force: bool,
        lane: Lane,
        snapshot: MessageSnapshot,
    ) -> BoxFuture<'static, RepositoryResult<()>>;
}
