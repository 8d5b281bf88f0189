use std::collections::HashMap;

use super::lane::{Lane, StreamStatus};
use super::message_update::{LaneEvent, MessageUpdate};
use super::stream_event::WebSearchResult;

/// Assistant message as the UI sees it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub text: String,
    pub reasoning: String,
    pub output_type: Option<String>,
    pub image_urls: Vec<String>,
    pub web_search_results: Vec<WebSearchResult>,
    pub status: Option<String>,
    pub is_error: bool,
    pub is_streaming: bool,
    pub reasoning_complete: bool,
}

impl ChatMessage {
    fn apply(&mut self, update: MessageUpdate) {
        if let Some(text) = update.text {
            self.text = text;
        }
        if let Some(reasoning) = update.reasoning {
            self.reasoning = reasoning;
        }
        if update.output_type.is_some() {
            self.output_type = update.output_type;
        }
        if let Some(urls) = update.image_urls {
            self.image_urls = urls;
        }
        if let Some(results) = update.web_search_results {
            self.web_search_results = results;
        }
        if update.status.is_some() {
            self.status = update.status;
        }
        self.is_error |= update.error_flag;
    }
}

/// Message list per lane, built by applying `LaneEvent`s in order.
///
/// This is the UI-state side of the pipeline: it must be driven from a single
/// context (the one draining the controller's event channel).
pub struct ConversationsStore {
    messages: HashMap<Lane, Vec<ChatMessage>>,
    notices: Vec<(Lane, String)>,
}

impl ConversationsStore {
    pub fn new() -> Self {
        Self {
            messages: HashMap::new(),
            notices: Vec::new(),
        }
    }

    /// Apply a single controller event
    pub fn apply(&mut self, event: LaneEvent) {
        match event {
            LaneEvent::MessageCreated { lane, message_id } => {
                self.messages.entry(lane).or_default().push(ChatMessage {
                    id: message_id,
                    is_streaming: true,
                    ..Default::default()
                });
            }
            LaneEvent::MessageUpdated { lane, update } => {
                if let Some(message) = self.get_message_mut(lane, &update.message_id) {
                    message.apply(update);
                }
            }
            LaneEvent::MessageRemoved { lane, message_id } => {
                if let Some(list) = self.messages.get_mut(&lane) {
                    list.retain(|m| m.id != message_id);
                }
            }
            LaneEvent::ReasoningCompleted { lane, message_id } => {
                if let Some(message) = self.get_message_mut(lane, &message_id) {
                    message.reasoning_complete = true;
                }
            }
            LaneEvent::Notice { lane, message } => {
                self.notices.push((lane, message));
            }
            LaneEvent::StreamEnded {
                lane,
                message_id,
                status,
            } => {
                if let Some(message) = self.get_message_mut(lane, &message_id) {
                    message.is_streaming = false;
                    message.reasoning_complete = true;
                    if matches!(status, StreamStatus::Error(_)) {
                        message.is_error = true;
                    }
                }
            }
        }
    }

    /// Get a message by lane and ID
    pub fn get_message(&self, lane: Lane, id: &str) -> Option<&ChatMessage> {
        self.messages.get(&lane)?.iter().find(|m| m.id == id)
    }

    fn get_message_mut(&mut self, lane: Lane, id: &str) -> Option<&mut ChatMessage> {
        self.messages.get_mut(&lane)?.iter_mut().find(|m| m.id == id)
    }

    /// All messages of a lane in creation order
    pub fn messages(&self, lane: Lane) -> &[ChatMessage] {
        self.messages.get(&lane).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn last_message(&self, lane: Lane) -> Option<&ChatMessage> {
        self.messages(lane).last()
    }

    pub fn notices(&self) -> &[(Lane, String)] {
        &self.notices
    }

    /// Get count of messages in a lane
    pub fn count(&self, lane: Lane) -> usize {
        self.messages(lane).len()
    }
}

impl Default for ConversationsStore {
    fn default() -> Self {
        Self::new()
    }
}
