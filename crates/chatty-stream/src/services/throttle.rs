use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::models::{Lane, LaneEvent, MessageUpdate};

/// Coalesces message updates and forwards at most one per interval.
///
/// Runs as its own task. Pushing is non-blocking; `close` flushes whatever
/// is still pending and waits for the task to exit, so events the caller
/// sends afterwards are ordered after the last update.
pub struct UpdateThrottle {
    tx: mpsc::UnboundedSender<MessageUpdate>,
    task: JoinHandle<()>,
}

impl UpdateThrottle {
    pub fn spawn(lane: Lane, interval: Duration, sink: mpsc::UnboundedSender<LaneEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_throttle(lane, interval, rx, sink));
        Self { tx, task }
    }

    pub fn push(&self, update: MessageUpdate) {
        if update.is_empty() {
            return;
        }
        // The task only stops after `close`, which consumes self
        let _ = self.tx.send(update);
    }

    /// Flush pending updates and stop the task
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

async fn run_throttle(
    lane: Lane,
    interval: Duration,
    mut rx: mpsc::UnboundedReceiver<MessageUpdate>,
    sink: mpsc::UnboundedSender<LaneEvent>,
) {
    let mut pending: Option<MessageUpdate> = None;
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut coalesced = 0usize;

    let emit = |update: MessageUpdate| {
        let _ = sink.send(LaneEvent::MessageUpdated { lane, update });
    };

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(update) => match pending.as_mut() {
                    Some(current) if current.message_id == update.message_id => {
                        current.merge(update);
                        coalesced += 1;
                    }
                    _ => {
                        if let Some(previous) = pending.replace(update) {
                            emit(previous);
                        }
                    }
                },
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(update) = pending.take() {
                    emit(update);
                }
            }
        }
    }

    if let Some(update) = pending.take() {
        emit(update);
    }
    debug!(lane = ?lane, coalesced, "Update throttle closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_update(id: &str, text: &str) -> MessageUpdate {
        let mut update = MessageUpdate::new(id);
        update.text = Some(text.to_string());
        update
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LaneEvent>) -> Vec<MessageUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let LaneEvent::MessageUpdated { update, .. } = event {
                updates.push(update);
            }
        }
        updates
    }

    #[tokio::test]
    async fn test_flood_is_coalesced() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let throttle = UpdateThrottle::spawn(Lane::Text, Duration::from_secs(60), sink);

        let mut text = String::new();
        for i in 0..100 {
            text.push_str(&i.to_string());
            throttle.push(text_update("m1", &text));
        }
        throttle.close().await;

        let updates = drain(&mut rx);
        assert!(updates.len() < 100);
        assert_eq!(updates.last().and_then(|u| u.text.clone()), Some(text));
    }

    #[tokio::test]
    async fn test_close_flushes_pending() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let throttle = UpdateThrottle::spawn(Lane::Image, Duration::from_secs(60), sink);
        let mut update = MessageUpdate::new("m1");
        update.error_flag = true;
        throttle.push(update);
        throttle.close().await;

        let updates = drain(&mut rx);
        assert_eq!(updates.len(), 1);
        assert!(updates[0].error_flag);
    }

    #[tokio::test]
    async fn test_different_messages_not_merged() {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let throttle = UpdateThrottle::spawn(Lane::Text, Duration::from_secs(60), sink);
        throttle.push(text_update("m1", "first"));
        throttle.push(text_update("m2", "second"));
        throttle.push(MessageUpdate::new("m2"));
        throttle.close().await;

        let updates = drain(&mut rx);
        let ids: Vec<_> = updates.iter().map(|u| u.message_id.as_str()).collect();
        assert_eq!(ids.last(), Some(&"m2"));
        assert!(ids.contains(&"m1"));
    }
}
