pub mod chat_session;
pub mod stream_controller;

#[cfg(test)]
mod stream_controller_test;

pub use chat_session::ChatSession;
pub use stream_controller::{CancelToken, FILTERED_NOTICE, StreamController};
