use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    CancelCause, Lane, LaneEvent, LanePhase, LaneRuntime, LaneSnapshot, MessageUpdate,
    ProcessedResult, StreamEvent, StreamStatus,
};
use crate::repositories::{ChatPersistence, MessageSnapshot};
use crate::services::image_retry::{self, AttemptOutcome, AttemptReport};
use crate::services::{
    MessageProcessor, PipelineContext, StreamRequest, StreamTransport, UpdateThrottle,
};

pub const FILTERED_NOTICE: &str = "The image request was blocked by the content filter.";

/// Cooperative cancellation signal carrying its cause.
///
/// Clones observe the same signal. The first cause wins; later calls to
/// `cancel` are ignored.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<Option<CancelCause>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self, cause: CancelCause) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        });
    }

    pub fn cause(&self) -> Option<CancelCause> {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) -> CancelCause {
        let mut rx = self.tx.subscribe();
        let cause = match rx.wait_for(Option::is_some).await {
            Ok(cause) => *cause,
            Err(_) => None,
        };
        match cause {
            Some(cause) => cause,
            // The sender lives in `self`, so the channel cannot close first
            None => std::future::pending().await,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct JobProgress {
    /// De-duplicated, in arrival order
    image_urls: Vec<String>,
    /// Last non-blank text of any image attempt
    best_text: String,
    error_seen: bool,
    reasoning_marked: bool,
}

/// One request in flight. Shared by the spawned task and the controller.
struct Job {
    generation: u64,
    message_id: String,
    prompt: String,
    cancel: CancelToken,
    processor: MessageProcessor,
    progress: Mutex<JobProgress>,
}

impl Job {
    fn snapshot(&self, partial: bool) -> MessageSnapshot {
        let progress = self.progress.lock();
        let mut text = self.processor.render_text();
        if text.trim().is_empty() {
            text = progress.best_text.clone();
        }
        MessageSnapshot {
            message_id: self.message_id.clone(),
            text,
            reasoning: self.processor.render_reasoning(),
            image_urls: progress.image_urls.clone(),
            is_error: progress.error_seen,
            partial,
        }
    }
}

struct ActiveJob {
    job: Arc<Job>,
    handle: JoinHandle<StreamStatus>,
}

enum JobOutcome {
    Completed,
    /// Terminal backend failure; the text is shown as the final message
    Failed(String),
    Filtered,
    Cancelled(CancelCause),
}

struct AttemptRun {
    report: AttemptReport,
    opened: bool,
}

/// State shared between a controller and the tasks it spawns
struct ControllerShared {
    lane: Lane,
    pipeline: PipelineContext,
    transport: Arc<dyn StreamTransport>,
    persistence: Arc<dyn ChatPersistence>,
    events: mpsc::UnboundedSender<LaneEvent>,
    runtime: Mutex<LaneRuntime>,
    last_message: Mutex<Option<MessageSnapshot>>,
}

/// Owns at most one streaming job for a single lane.
///
/// Starting a new job cancels the previous one with `CancelCause::Superseded`
/// and waits for its teardown first. Lanes never share jobs, so cancelling
/// one lane leaves the other untouched.
pub struct StreamController {
    shared: Arc<ControllerShared>,
    job: tokio::sync::Mutex<Option<ActiveJob>>,
    generations: AtomicU64,
}

impl StreamController {
    pub fn new(
        lane: Lane,
        pipeline: PipelineContext,
        transport: Arc<dyn StreamTransport>,
        persistence: Arc<dyn ChatPersistence>,
        events: mpsc::UnboundedSender<LaneEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                lane,
                pipeline,
                transport,
                persistence,
                events,
                runtime: Mutex::new(LaneRuntime::new()),
                last_message: Mutex::new(None),
            }),
            job: tokio::sync::Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    pub fn lane(&self) -> Lane {
        self.shared.lane
    }

    /// Start streaming a response to `prompt`, returning the new message id
    pub async fn start(&self, prompt: impl Into<String>) -> String {
        let lane = self.shared.lane;
        let mut slot = self.job.lock().await;

        if let Some(previous) = slot.take() {
            if !previous.handle.is_finished() {
                debug!(lane = ?lane, message_id = %previous.job.message_id, "Superseding active stream");
                self.shared.set_phase(previous.job.generation, LanePhase::Cancelling);
            }
            previous.job.processor.cancel();
            previous.job.cancel.cancel(CancelCause::Superseded);
            let status = join_status(previous.handle).await;
            debug!(lane = ?lane, status = ?status, "Previous stream torn down");
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let message_id = Uuid::new_v4().to_string();
        {
            let mut runtime = self.shared.runtime.lock();
            runtime.phase = LanePhase::Starting;
            runtime.active_job = Some(generation);
            runtime.streaming_message_id = Some(message_id.clone());
            runtime.is_calling = true;
            runtime.retry_count = 0;
        }
        self.shared.emit(LaneEvent::MessageCreated {
            lane,
            message_id: message_id.clone(),
        });

        let job = Arc::new(Job {
            generation,
            message_id: message_id.clone(),
            prompt: prompt.into(),
            cancel: CancelToken::new(),
            processor: self.shared.pipeline.new_processor(),
            progress: Mutex::new(JobProgress::default()),
        });
        let handle = tokio::spawn(run_job(self.shared.clone(), job.clone()));
        *slot = Some(ActiveJob { job, handle });

        info!(lane = ?lane, message_id = %message_id, "Stream started");
        message_id
    }

    /// Cancel the active job and wait for its teardown.
    /// Returns `None` when nothing was streaming.
    pub async fn cancel(&self, cause: CancelCause) -> Option<StreamStatus> {
        let mut slot = self.job.lock().await;
        let active = slot.take()?;
        if active.handle.is_finished() {
            return None;
        }

        debug!(lane = ?self.shared.lane, message_id = %active.job.message_id, cause = ?cause, "Cancelling stream");
        self.shared
            .set_phase(active.job.generation, LanePhase::Cancelling);
        active.job.processor.cancel();
        active.job.cancel.cancel(cause);
        Some(join_status(active.handle).await)
    }

    /// Wait for the active job to finish on its own
    pub async fn join(&self) -> Option<StreamStatus> {
        let mut slot = self.job.lock().await;
        let active = slot.take()?;
        Some(join_status(active.handle).await)
    }

    pub fn snapshot(&self) -> LaneSnapshot {
        LaneSnapshot::from(&*self.shared.runtime.lock())
    }

    pub fn is_reasoning_complete(&self, message_id: &str) -> bool {
        self.shared.runtime.lock().is_reasoning_complete(message_id)
    }

    /// Raw accumulated text of the job occupying the lane, if any
    pub async fn current_text(&self) -> Option<String> {
        let slot = self.job.lock().await;
        slot.as_ref().map(|active| active.job.processor.get_current_text())
    }

    /// Save the lane's current message: partial content of a running job,
    /// or the last finished message.
    pub async fn persist_current(&self, force: bool) -> bool {
        let running = {
            let slot = self.job.lock().await;
            slot.as_ref()
                .filter(|active| !active.handle.is_finished())
                .map(|active| active.job.snapshot(true))
        };
        let snapshot = running.or_else(|| self.shared.last_message.lock().clone());
        match snapshot {
            Some(snapshot) if snapshot.has_content() => {
                self.shared.persist(force, snapshot).await;
                true
            }
            _ => false,
        }
    }
}

async fn join_status(handle: JoinHandle<StreamStatus>) -> StreamStatus {
    handle
        .await
        .unwrap_or_else(|e| StreamStatus::Error(format!("stream task failed: {}", e)))
}

async fn run_job(shared: Arc<ControllerShared>, job: Arc<Job>) -> StreamStatus {
    let throttle = UpdateThrottle::spawn(
        shared.lane,
        shared.pipeline.settings().ui_throttle_interval(),
        shared.events.clone(),
    );

    let outcome = tokio::select! {
        biased;
        cause = job.cancel.cancelled() => JobOutcome::Cancelled(cause),
        outcome = shared.drive(&job, &throttle) => outcome,
    };

    shared.finish(&job, outcome, throttle).await
}

impl ControllerShared {
    fn emit(&self, event: LaneEvent) {
        if self.events.send(event).is_err() {
            debug!(lane = ?self.lane, "Lane event receiver dropped");
        }
    }

    fn set_phase(&self, generation: u64, phase: LanePhase) {
        let mut runtime = self.runtime.lock();
        if runtime.active_job == Some(generation) {
            runtime.phase = phase;
        }
    }

    /// Clear the lane if `generation` still owns it. Returns whether it did.
    fn finish_runtime(&self, generation: u64, message_id: &str) -> bool {
        let mut runtime = self.runtime.lock();
        if runtime.active_job != Some(generation) {
            return false;
        }
        runtime.active_job = None;
        runtime.is_calling = false;
        runtime.phase = LanePhase::Idle;
        if runtime.streaming_message_id.as_deref() == Some(message_id) {
            runtime.streaming_message_id = None;
        }
        runtime
            .reasoning_complete
            .insert(message_id.to_string(), true);
        true
    }

    async fn persist(&self, force: bool, snapshot: MessageSnapshot) {
        let message_id = snapshot.message_id.clone();
        match self
            .persistence
            .save_current_chat(force, self.lane, snapshot)
            .await
        {
            Ok(()) => debug!(lane = ?self.lane, message_id = %message_id, force, "Saved conversation"),
            Err(e) => {
                warn!(lane = ?self.lane, message_id = %message_id, error = %e, "Failed to save conversation")
            }
        }
    }

    async fn drive(&self, job: &Job, throttle: &UpdateThrottle) -> JobOutcome {
        match self.lane {
            Lane::Text => match self.stream_attempt(job, throttle, 1).await {
                Ok(run) if !run.opened => {
                    JobOutcome::Failed(run.report.errors.join("\n"))
                }
                Ok(_) => JobOutcome::Completed,
                Err(cause) => JobOutcome::Cancelled(cause),
            },
            Lane::Image => self.drive_image(job, throttle).await,
        }
    }

    async fn drive_image(&self, job: &Job, throttle: &UpdateThrottle) -> JobOutcome {
        let settings = self.pipeline.settings();
        let max_attempts = image_retry::max_attempts(&job.prompt, settings);
        let mut attempt = 1;

        loop {
            let run = match self.stream_attempt(job, throttle, attempt).await {
                Ok(run) => run,
                Err(cause) => return JobOutcome::Cancelled(cause),
            };
            if !run.report.text.trim().is_empty() {
                job.progress.lock().best_text = run.report.text.clone();
            }

            match image_retry::classify_attempt(&run.report) {
                AttemptOutcome::Image => return JobOutcome::Completed,
                AttemptOutcome::Filtered => return JobOutcome::Filtered,
                AttemptOutcome::BackendError(text) => {
                    warn!(lane = ?self.lane, message_id = %job.message_id, attempt, "Image backend returned a terminal error");
                    let mut update = MessageUpdate::new(job.message_id.clone());
                    update.text = Some(text.clone());
                    update.error_flag = true;
                    throttle.push(update);
                    return JobOutcome::Failed(text);
                }
                outcome if outcome.is_retryable() && attempt < max_attempts => {
                    {
                        let mut runtime = self.runtime.lock();
                        if runtime.active_job == Some(job.generation) {
                            runtime.retry_count = attempt;
                        }
                    }
                    warn!(
                        lane = ?self.lane,
                        message_id = %job.message_id,
                        attempt,
                        max_attempts,
                        "Image attempt returned no image, retrying"
                    );
                    tokio::time::sleep(settings.image_retry_backoff()).await;
                    if let Some(cause) = job.cancel.cause() {
                        return JobOutcome::Cancelled(cause);
                    }
                    job.processor.reset();
                    attempt += 1;
                }
                AttemptOutcome::Empty => {
                    let best_text = job.progress.lock().best_text.clone();
                    if !best_text.is_empty() {
                        let mut update = MessageUpdate::new(job.message_id.clone());
                        update.text = Some(best_text);
                        throttle.push(update);
                    }
                    info!(lane = ?self.lane, message_id = %job.message_id, attempts = attempt, "Image attempts exhausted without an image");
                    return JobOutcome::Completed;
                }
            }
        }
    }

    /// Run one request against the transport until `StreamEnd`. A transport
    /// that closes without one is treated as if it had sent it.
    async fn stream_attempt(
        &self,
        job: &Job,
        throttle: &UpdateThrottle,
        attempt: u32,
    ) -> Result<AttemptRun, CancelCause> {
        let request = StreamRequest {
            lane: self.lane,
            prompt: job.prompt.clone(),
            attempt,
        };
        let mut report = AttemptReport::default();
        debug!(lane = ?self.lane, message_id = %job.message_id, attempt, "Opening stream");

        let mut stream = match self.transport.open(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(lane = ?self.lane, message_id = %job.message_id, error = %message, "Failed to open stream");
                self.apply_event(job, throttle, &mut report, StreamEvent::Error(message));
                self.apply_event(job, throttle, &mut report, StreamEvent::StreamEnd);
                report.text = job.processor.render_text();
                return Ok(AttemptRun {
                    report,
                    opened: false,
                });
            }
        };
        self.set_phase(job.generation, LanePhase::Streaming);

        let mut end_seen = false;
        while let Some(item) = stream.next().await {
            if let Some(cause) = job.cancel.cause() {
                return Err(cause);
            }
            let event = item.unwrap_or_else(|e| StreamEvent::Error(format!("{:#}", e)));
            let ends_stream = event.ends_stream();
            self.apply_event(job, throttle, &mut report, event);
            if ends_stream {
                end_seen = true;
                break;
            }
        }
        if let Some(cause) = job.cancel.cause() {
            return Err(cause);
        }
        if !end_seen {
            self.apply_event(job, throttle, &mut report, StreamEvent::StreamEnd);
        }

        report.text = job.processor.render_text();
        report.image_urls = job.progress.lock().image_urls.clone();
        Ok(AttemptRun {
            report,
            opened: true,
        })
    }

    /// Feed one event to the assembler and queue the resulting UI update
    fn apply_event(
        &self,
        job: &Job,
        throttle: &UpdateThrottle,
        report: &mut AttemptReport,
        event: StreamEvent,
    ) {
        let is_error = matches!(event, StreamEvent::Error(_));
        if let StreamEvent::Error(message) = &event {
            report.errors.push(message.clone());
        }

        let mut update = MessageUpdate::new(job.message_id.clone());
        match job.processor.process_event(&event, &job.message_id) {
            ProcessedResult::ContentUpdated(text) => update.text = Some(text),
            ProcessedResult::ReasoningUpdated(reasoning) => update.reasoning = Some(reasoning),
            ProcessedResult::ContentAndReasoningUpdated { text, reasoning } => {
                update.text = Some(text);
                update.reasoning = Some(reasoning);
            }
            ProcessedResult::ReasoningComplete => {
                let text = job.processor.render_text();
                if !text.trim().is_empty() {
                    update.text = Some(text);
                }
                let reasoning = job.processor.render_reasoning();
                if !reasoning.trim().is_empty() {
                    update.reasoning = Some(reasoning);
                }
            }
            ProcessedResult::StatusUpdate(stage) => update.status = Some(stage),
            ProcessedResult::WebSearchResults(results) => {
                update.web_search_results = Some(results)
            }
            ProcessedResult::OutputType(kind) => {
                report.output_type = Some(kind.clone());
                update.output_type = Some(kind);
            }
            ProcessedResult::ImageUrl(url) => {
                let mut progress = job.progress.lock();
                if !progress.image_urls.contains(&url) {
                    progress.image_urls.push(url);
                }
                update.image_urls = Some(progress.image_urls.clone());
            }
            ProcessedResult::Error(message) => {
                warn!(lane = ?self.lane, message_id = %job.message_id, error = %message, "Stream event could not be applied");
                update.error_flag = true;
            }
            ProcessedResult::Cancelled | ProcessedResult::NoChange => {}
        }

        if is_error {
            update.error_flag = true;
            job.progress.lock().error_seen = true;
        }
        self.note_reasoning_finished(job, &mut update);
        throttle.push(update);
    }

    /// Mark the thinking block complete the first time the assembler reports it
    fn note_reasoning_finished(&self, job: &Job, update: &mut MessageUpdate) {
        if !job.processor.reasoning_finished() {
            return;
        }
        {
            let mut progress = job.progress.lock();
            if progress.reasoning_marked {
                return;
            }
            progress.reasoning_marked = true;
        }

        let current = {
            let mut runtime = self.runtime.lock();
            let current = runtime.active_job == Some(job.generation);
            if current {
                runtime
                    .reasoning_complete
                    .insert(job.message_id.clone(), true);
            }
            current
        };
        if current {
            let reasoning = job.processor.render_reasoning();
            if !reasoning.trim().is_empty() {
                update.reasoning = Some(reasoning);
            }
            self.emit(LaneEvent::ReasoningCompleted {
                lane: self.lane,
                message_id: job.message_id.clone(),
            });
        }
    }

    async fn finish(&self, job: &Job, outcome: JobOutcome, throttle: UpdateThrottle) -> StreamStatus {
        let lane = self.lane;
        let message_id = job.message_id.clone();

        match outcome {
            JobOutcome::Cancelled(cause) => {
                job.processor.cancel();
                throttle.close().await;

                let snapshot = job.snapshot(true);
                let has_content = snapshot.has_content();
                if has_content {
                    self.persist(true, snapshot.clone()).await;
                    *self.last_message.lock() = Some(snapshot);
                }
                self.finish_runtime(job.generation, &message_id);

                if cause == CancelCause::Superseded && !has_content {
                    self.emit(LaneEvent::MessageRemoved { lane, message_id: message_id.clone() });
                } else {
                    self.emit(LaneEvent::StreamEnded {
                        lane,
                        message_id: message_id.clone(),
                        status: StreamStatus::Cancelled(cause),
                    });
                }
                info!(lane = ?lane, message_id = %message_id, cause = ?cause, kept = has_content, "Stream cancelled");
                StreamStatus::Cancelled(cause)
            }
            JobOutcome::Filtered => {
                throttle.close().await;
                self.finish_runtime(job.generation, &message_id);
                info!(lane = ?lane, message_id = %message_id, "Response was content filtered");
                self.emit(LaneEvent::MessageRemoved { lane, message_id });
                self.emit(LaneEvent::Notice {
                    lane,
                    message: FILTERED_NOTICE.to_string(),
                });
                StreamStatus::Filtered
            }
            JobOutcome::Completed | JobOutcome::Failed(_) => {
                self.set_phase(job.generation, LanePhase::Completing);
                throttle.close().await;

                let mut snapshot = job.snapshot(false);
                let status = match outcome {
                    JobOutcome::Failed(text) => {
                        snapshot.text = text.clone();
                        snapshot.is_error = true;
                        StreamStatus::Error(text)
                    }
                    _ => StreamStatus::Completed,
                };

                if self.finish_runtime(job.generation, &message_id) {
                    self.persist(false, snapshot.clone()).await;
                }
                *self.last_message.lock() = Some(snapshot);

                self.emit(LaneEvent::StreamEnded {
                    lane,
                    message_id: message_id.clone(),
                    status: status.clone(),
                });
                debug!(lane = ?lane, message_id = %message_id, status = ?status, "Stream finished");
                status
            }
        }
    }
}
