use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::stream_controller::StreamController;
use crate::models::{CancelCause, Lane, LaneEvent, StreamStatus};
use crate::repositories::ChatPersistence;
use crate::services::{PipelineContext, StreamTransport};
use crate::settings::{FormatCorrectionConfig, StreamSettings};

/// A conversation session with one controller per lane.
///
/// Both lanes share the pipeline caches and publish into a single event
/// channel; every event carries its lane.
pub struct ChatSession {
    pipeline: PipelineContext,
    text: StreamController,
    image: StreamController,
    active_lane: Mutex<Lane>,
}

impl ChatSession {
    pub fn new(
        settings: StreamSettings,
        correction: FormatCorrectionConfig,
        transport: Arc<dyn StreamTransport>,
        persistence: Arc<dyn ChatPersistence>,
    ) -> (Self, mpsc::UnboundedReceiver<LaneEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pipeline = PipelineContext::new(correction, settings);

        let text = StreamController::new(
            Lane::Text,
            pipeline.clone(),
            transport.clone(),
            persistence.clone(),
            events_tx.clone(),
        );
        let image = StreamController::new(
            Lane::Image,
            pipeline.clone(),
            transport,
            persistence,
            events_tx,
        );

        let session = Self {
            pipeline,
            text,
            image,
            active_lane: Mutex::new(Lane::Text),
        };
        (session, events_rx)
    }

    pub fn controller(&self, lane: Lane) -> &StreamController {
        match lane {
            Lane::Text => &self.text,
            Lane::Image => &self.image,
        }
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.pipeline
    }

    pub fn active_lane(&self) -> Lane {
        *self.active_lane.lock()
    }

    /// Make `lane` the visible lane, saving the one being left.
    /// Returns false when `lane` was already active.
    pub async fn switch_lane(&self, lane: Lane) -> bool {
        let previous = {
            let mut active = self.active_lane.lock();
            if *active == lane {
                return false;
            }
            std::mem::replace(&mut *active, lane)
        };
        debug!(from = ?previous, to = ?lane, "Switching lane");
        self.controller(previous).persist_current(false).await;
        true
    }

    /// Send `prompt` on `lane`, returning the id of the assistant message
    pub async fn send(&self, lane: Lane, prompt: impl Into<String>) -> String {
        self.switch_lane(lane).await;
        self.controller(lane).start(prompt).await
    }

    pub async fn cancel(&self, lane: Lane, cause: CancelCause) -> Option<StreamStatus> {
        self.controller(lane).cancel(cause).await
    }

    /// Cancel both lanes as a user stop
    pub async fn stop_all(&self) {
        for lane in [Lane::Text, Lane::Image] {
            self.controller(lane).cancel(CancelCause::UserCancelled).await;
        }
    }
}
