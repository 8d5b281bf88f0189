use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::models::{Lane, StreamEvent};

/// Ordered events of one backend response. Transport failures arrive as
/// `Err` items and are shown to the user as error text.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

/// One outgoing request as handed to the transport
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub lane: Lane,
    pub prompt: String,
    /// 1-based attempt number; above 1 only for image retries
    pub attempt: u32,
}

/// Source of stream events for a request
pub trait StreamTransport: Send + Sync + 'static {
    fn open(&self, request: &StreamRequest) -> BoxFuture<'static, Result<EventStream>>;
}

/// One step of a scripted response
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Event(StreamEvent),
    /// A transport-level failure in the middle of the stream
    Fail(String),
    Delay(Duration),
    /// Never yield again; only cancellation ends the stream
    Stall,
}

impl From<StreamEvent> for ScriptStep {
    fn from(event: StreamEvent) -> Self {
        ScriptStep::Event(event)
    }
}

/// Transport that replays fixed responses.
///
/// Attempt `n` plays script `n - 1`; attempts beyond the last script replay
/// the last one. Used by tests and the replay binary.
#[derive(Clone)]
pub struct ScriptedTransport {
    scripts: Arc<Vec<Vec<ScriptStep>>>,
    opens: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<StreamRequest>>>,
    refuse_open: Option<String>,
}

impl ScriptedTransport {
    pub fn new(scripts: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            scripts: Arc::new(scripts),
            opens: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
            refuse_open: None,
        }
    }

    /// A transport playing the same events for every attempt
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        Self::new(vec![events.into_iter().map(ScriptStep::from).collect()])
    }

    /// Make every `open` call fail with `message`
    pub fn refusing(message: impl Into<String>) -> Self {
        Self {
            refuse_open: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().clone()
    }

    fn script_for(&self, attempt: u32) -> Vec<ScriptStep> {
        let index = (attempt.max(1) as usize - 1).min(self.scripts.len().saturating_sub(1));
        self.scripts.get(index).cloned().unwrap_or_default()
    }
}

impl StreamTransport for ScriptedTransport {
    fn open(&self, request: &StreamRequest) -> BoxFuture<'static, Result<EventStream>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        let refuse = self.refuse_open.clone();
        let script = self.script_for(request.attempt);

        Box::pin(async move {
            if let Some(message) = refuse {
                return Err(anyhow!(message));
            }
            let stream = async_stream::stream! {
                for step in script {
                    match step {
                        ScriptStep::Event(event) => yield Ok(event),
                        ScriptStep::Fail(message) => yield Err(anyhow!(message)),
                        ScriptStep::Delay(duration) => tokio::time::sleep(duration).await,
                        ScriptStep::Stall => futures::future::pending::<()>().await,
                    }
                }
            };
            Ok(stream.boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(attempt: u32) -> StreamRequest {
        StreamRequest {
            lane: Lane::Image,
            prompt: "a lighthouse".to_string(),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_scripts_per_attempt() {
        let transport = ScriptedTransport::new(vec![
            vec![StreamEvent::ContentDelta("one".to_string()).into()],
            vec![StreamEvent::ContentDelta("two".to_string()).into()],
        ]);

        for (attempt, expected) in [(1, "one"), (2, "two"), (3, "two")] {
            let mut stream = transport.open(&request(attempt)).await.unwrap();
            let event = stream.next().await.unwrap().unwrap();
            assert_eq!(event, StreamEvent::ContentDelta(expected.to_string()));
            assert!(stream.next().await.is_none());
        }
        assert_eq!(transport.open_count(), 3);
        assert_eq!(transport.requests()[2].attempt, 3);
    }

    #[tokio::test]
    async fn test_failures_are_stream_items() {
        let transport = ScriptedTransport::new(vec![vec![
            ScriptStep::Fail("connection reset".to_string()),
            StreamEvent::StreamEnd.into(),
        ]]);
        let mut stream = transport.open(&request(1)).await.unwrap();
        let first = stream.next().await.unwrap();
        assert_eq!(first.unwrap_err().to_string(), "connection reset");
        assert_eq!(stream.next().await.unwrap().unwrap(), StreamEvent::StreamEnd);
    }

    #[tokio::test]
    async fn test_refusing_transport() {
        let transport = ScriptedTransport::refusing("no route to host");
        let result = transport.open(&request(1)).await;
        assert!(result.is_err());
        assert_eq!(transport.open_count(), 1);
    }
}
