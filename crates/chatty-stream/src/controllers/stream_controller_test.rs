#[cfg(test)]
mod tests {
    use super::super::stream_controller::{CancelToken, FILTERED_NOTICE, StreamController};
    use crate::models::{
        CancelCause, ConversationsStore, Lane, LaneEvent, LanePhase, StreamEvent, StreamStatus,
    };
    use crate::repositories::InMemoryChatRepository;
    use crate::services::{PipelineContext, ScriptStep, ScriptedTransport};
    use crate::settings::{FormatCorrectionConfig, StreamSettings};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            ui_throttle_interval_ms: 5,
            image_retry_backoff_ms: 1,
            ..Default::default()
        }
    }

    fn controller(
        lane: Lane,
        transport: &ScriptedTransport,
        repo: &InMemoryChatRepository,
        events: mpsc::UnboundedSender<LaneEvent>,
    ) -> StreamController {
        StreamController::new(
            lane,
            PipelineContext::new(FormatCorrectionConfig::default(), fast_settings()),
            Arc::new(transport.clone()),
            Arc::new(repo.clone()),
            events,
        )
    }

    fn delta(text: &str) -> ScriptStep {
        StreamEvent::ContentDelta(text.to_string()).into()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<LaneEvent>, store: &mut ConversationsStore) -> Vec<LaneEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            store.apply(event.clone());
            seen.push(event);
        }
        seen
    }

    async fn wait_for_text(controller: &StreamController, expected: &str) {
        for _ in 0..400 {
            if controller.current_text().await.as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for text {:?}", expected);
    }

    #[tokio::test]
    async fn test_cancel_token_first_cause_wins() {
        let token = CancelToken::new();
        assert_eq!(token.cause(), None);
        token.cancel(CancelCause::UserCancelled);
        token.cancel(CancelCause::Superseded);
        assert_eq!(token.cause(), Some(CancelCause::UserCancelled));
        assert_eq!(token.clone().cancelled().await, CancelCause::UserCancelled);
    }

    #[tokio::test]
    async fn test_cancelling_image_lane_leaves_text_lane_alone() {
        let transport = ScriptedTransport::new(vec![vec![
            delta("partial answer still streaming"),
            ScriptStep::Stall,
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let text = controller(Lane::Text, &transport, &repo, tx.clone());
        let image = controller(Lane::Image, &transport, &repo, tx);

        let text_id = text.start("tell me a story").await;
        image.start("a castle at dusk").await;
        wait_for_text(&text, "partial answer still streaming").await;
        wait_for_text(&image, "partial answer still streaming").await;

        let status = image.cancel(CancelCause::UserCancelled).await;
        assert_eq!(status, Some(StreamStatus::Cancelled(CancelCause::UserCancelled)));
        assert!(!image.snapshot().is_calling);

        let snapshot = text.snapshot();
        assert!(snapshot.is_calling);
        assert!(snapshot.has_active_job);
        assert_eq!(snapshot.streaming_message_id.as_deref(), Some(text_id.as_str()));
        assert_eq!(snapshot.phase, LanePhase::Streaming);
        assert_eq!(
            text.current_text().await.as_deref(),
            Some("partial answer still streaming")
        );

        text.cancel(CancelCause::UserCancelled).await;
    }

    #[tokio::test]
    async fn test_second_start_supersedes_first() {
        let transport = ScriptedTransport::new(vec![vec![delta("first draft"), ScriptStep::Stall]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let first = lane.start("one").await;
        wait_for_text(&lane, "first draft").await;
        let second = lane.start("two").await;
        assert_ne!(first, second);

        let snapshot = lane.snapshot();
        assert!(snapshot.has_active_job);
        assert_eq!(snapshot.streaming_message_id.as_deref(), Some(second.as_str()));

        let mut store = ConversationsStore::new();
        let events = drain(&mut rx, &mut store);
        assert!(events.contains(&LaneEvent::StreamEnded {
            lane: Lane::Text,
            message_id: first.clone(),
            status: StreamStatus::Cancelled(CancelCause::Superseded),
        }));
        // The superseded message had content, so it stays and is saved
        assert_eq!(store.get_message(Lane::Text, &first).unwrap().text, "first draft");
        let saves = repo.saves().unwrap();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].snapshot.partial);

        lane.cancel(CancelCause::UserCancelled).await;
        assert!(!lane.snapshot().has_active_job);
    }

    #[tokio::test]
    async fn test_superseded_empty_placeholder_is_removed() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::Stall]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let first = lane.start("one").await;
        let second = lane.start("two").await;

        let mut store = ConversationsStore::new();
        let events = drain(&mut rx, &mut store);
        assert!(events.contains(&LaneEvent::MessageRemoved {
            lane: Lane::Text,
            message_id: first.clone(),
        }));
        assert!(store.get_message(Lane::Text, &first).is_none());
        assert!(store.get_message(Lane::Text, &second).is_some());
        assert!(repo.saves().unwrap().is_empty());

        lane.cancel(CancelCause::UserCancelled).await;
    }

    #[tokio::test]
    async fn test_user_cancel_persists_partial_content() {
        let transport = ScriptedTransport::new(vec![vec![
            delta("<think>weighing options</think>"),
            delta("The short version is"),
            ScriptStep::Stall,
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("summarize").await;
        wait_for_text(&lane, "The short version is").await;
        assert!(lane.is_reasoning_complete(&id));

        let status = lane.cancel(CancelCause::UserCancelled).await;
        assert_eq!(status, Some(StreamStatus::Cancelled(CancelCause::UserCancelled)));

        let saves = repo.saves_for(Lane::Text).unwrap();
        assert_eq!(saves.len(), 1);
        assert!(saves[0].force);
        assert_eq!(saves[0].snapshot.text, "The short version is");
        assert_eq!(saves[0].snapshot.reasoning, "weighing options");

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        let message = store.get_message(Lane::Text, &id).unwrap();
        assert_eq!(message.text, "The short version is");
        assert!(message.reasoning_complete);
        assert!(!message.is_streaming);

        let snapshot = lane.snapshot();
        assert!(!snapshot.is_calling);
        assert_eq!(snapshot.streaming_message_id, None);
        assert_eq!(snapshot.phase, LanePhase::Idle);
    }

    #[tokio::test]
    async fn test_user_cancel_without_content_saves_nothing() {
        let transport = ScriptedTransport::new(vec![vec![ScriptStep::Stall]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("hello").await;
        lane.cancel(CancelCause::UserCancelled).await;
        assert!(repo.saves().unwrap().is_empty());

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        assert!(store.get_message(Lane::Text, &id).is_some());
        assert_eq!(lane.cancel(CancelCause::UserCancelled).await, None);
    }

    #[tokio::test]
    async fn test_image_retry_is_bounded() {
        let transport = ScriptedTransport::new(vec![
            vec![delta("Working on the first sketch"), StreamEvent::StreamEnd.into()],
            vec![delta("Trying a second composition"), StreamEvent::StreamEnd.into()],
            vec![StreamEvent::StreamEnd.into()],
        ]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Image, &transport, &repo, tx);

        let id = lane.start("a watercolor fox").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));
        assert_eq!(transport.open_count(), 3);
        let attempts: Vec<u32> = transport.requests().iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(lane.snapshot().retry_count, 2);

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        let message = store.get_message(Lane::Image, &id).unwrap();
        assert_eq!(message.text, "Trying a second composition");

        let saves = repo.saves_for(Lane::Image).unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].snapshot.text, "Trying a second composition");
    }

    #[tokio::test]
    async fn test_text_only_image_request_gets_one_attempt() {
        let transport = ScriptedTransport::new(vec![vec![
            delta("A lighthouse guides ships."),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Image, &transport, &repo, tx);

        lane.start("What is a lighthouse?").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_image_result_stops_retrying() {
        let transport = ScriptedTransport::new(vec![vec![
            StreamEvent::ImageResult("https://cdn/fox-1.png".to_string()).into(),
            StreamEvent::ImageResult("https://cdn/fox-1.png".to_string()).into(),
            StreamEvent::ImageResult("https://cdn/fox-2.png".to_string()).into(),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Image, &transport, &repo, tx);

        let id = lane.start("two foxes").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));
        assert_eq!(transport.open_count(), 1);

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        assert_eq!(
            store.get_message(Lane::Image, &id).unwrap().image_urls,
            vec!["https://cdn/fox-1.png".to_string(), "https://cdn/fox-2.png".to_string()]
        );
    }

    #[tokio::test]
    async fn test_backend_error_is_terminal() {
        let transport = ScriptedTransport::new(vec![vec![
            delta("Upstream error: the image service is overloaded"),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Image, &transport, &repo, tx);

        let id = lane.start("a harbor at night").await;
        let status = lane.join().await;
        assert!(matches!(status, Some(StreamStatus::Error(_))));
        assert_eq!(transport.open_count(), 1);

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        let message = store.get_message(Lane::Image, &id).unwrap();
        assert!(message.is_error);
        assert_eq!(message.text, "Upstream error: the image service is overloaded");
    }

    #[tokio::test]
    async fn test_content_filter_removes_placeholder() {
        let transport = ScriptedTransport::new(vec![vec![
            StreamEvent::OutputTypeTag("content_filter".to_string()).into(),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Image, &transport, &repo, tx);

        let id = lane.start("something disallowed").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Filtered));
        assert_eq!(transport.open_count(), 1);

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        assert!(store.get_message(Lane::Image, &id).is_none());
        assert_eq!(store.notices(), &[(Lane::Image, FILTERED_NOTICE.to_string())]);
        assert!(repo.saves().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_transport_counts_as_stream_end() {
        let transport = ScriptedTransport::new(vec![vec![delta("<think>plan</think>done")]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("go").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));
        assert!(lane.is_reasoning_complete(&id));

        let mut store = ConversationsStore::new();
        let events = drain(&mut rx, &mut store);
        assert!(events.contains(&LaneEvent::ReasoningCompleted {
            lane: Lane::Text,
            message_id: id.clone(),
        }));
        let message = store.get_message(Lane::Text, &id).unwrap();
        assert_eq!(message.reasoning, "plan");
        assert_eq!(message.text, "done");
    }

    #[tokio::test]
    async fn test_text_after_tool_call_is_kept() {
        let transport = ScriptedTransport::new(vec![vec![
            delta("Let me search."),
            StreamEvent::ToolCallFinished.into(),
            delta(" Found it."),
            StreamEvent::Finish("stop".to_string()).into(),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("search for it").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        assert_eq!(store.get_message(Lane::Text, &id).unwrap().text, "Let me search. Found it.");
        let saves = repo.saves_for(Lane::Text).unwrap();
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].snapshot.text, "Let me search. Found it.");
    }

    #[tokio::test]
    async fn test_error_event_does_not_abort_stream() {
        let transport = ScriptedTransport::new(vec![vec![
            StreamEvent::Error("timeout".to_string()).into(),
            delta("continuing"),
            StreamEvent::StreamEnd.into(),
        ]]);
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("go").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        let message = store.get_message(Lane::Text, &id).unwrap();
        assert!(message.text.contains("timeout"));
        assert!(message.text.contains("continuing"));
        assert!(message.is_error);
    }

    #[tokio::test]
    async fn test_transport_open_failure_ends_with_error() {
        let transport = ScriptedTransport::refusing("connection refused");
        let repo = InMemoryChatRepository::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        let id = lane.start("hi").await;
        assert_eq!(
            lane.join().await,
            Some(StreamStatus::Error("connection refused".to_string()))
        );

        let mut store = ConversationsStore::new();
        drain(&mut rx, &mut store);
        let message = store.get_message(Lane::Text, &id).unwrap();
        assert!(message.is_error);
        assert_eq!(message.text, "connection refused");
    }

    #[tokio::test]
    async fn test_repository_failure_is_not_fatal() {
        let transport = ScriptedTransport::new(vec![vec![delta("fine"), StreamEvent::StreamEnd.into()]]);
        let repo = InMemoryChatRepository::new();
        repo.set_unavailable(true);
        let (tx, _rx) = mpsc::unbounded_channel();
        let lane = controller(Lane::Text, &transport, &repo, tx);

        lane.start("hi").await;
        assert_eq!(lane.join().await, Some(StreamStatus::Completed));
        assert!(!lane.snapshot().is_calling);
    }
}
