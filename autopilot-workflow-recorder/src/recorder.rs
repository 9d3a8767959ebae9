use crate::events::{InteractionEvent, RecordedEvent};
use crate::validation::validate_step;
use crate::{Result, WorkflowRecorderError};
use autopilot::model::now_millis;
use autopilot::{DomSnapshot, ElementDetector, NodeId, StepKind, Workflow, WorkflowStep};
use futures::StreamExt;
use std::{
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

/// Name given to a recording started without one.
pub const DEFAULT_WORKFLOW_NAME: &str = "Recorded workflow";

/// Configuration for the workflow recorder
#[derive(Debug, Clone)]
pub struct WorkflowRecorderConfig {
    /// Whether to record clicks
    pub record_clicks: bool,

    /// Whether to record text entered into fields
    pub record_inputs: bool,

    /// Whether to record key presses
    pub record_keypresses: bool,

    /// Whether to record page scrolling
    pub record_scrolls: bool,

    /// Whether to record location changes as navigation steps
    pub record_navigation: bool,

    /// Attach an element diagnostics snapshot to click and input steps
    pub capture_element_info: bool,

    /// Scroll events closer together than this collapse into one step (milliseconds, 0 disables)
    pub scroll_throttle_ms: u64,

    /// Skip a navigation step whose url equals the previous one
    pub dedupe_navigation: bool,

    /// Buffer size of the recorded-step broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for WorkflowRecorderConfig {
    fn default() -> Self {
        Self {
            record_clicks: true,
            record_inputs: true,
            record_keypresses: true,
            record_scrolls: true,
            record_navigation: true,
            capture_element_info: true,
            scroll_throttle_ms: 200,
            dedupe_navigation: true,
            event_channel_capacity: 100,
        }
    }
}

#[derive(Default)]
struct NoiseFilter {
    last_url: Option<String>,
    last_scroll_at: Option<u64>,
}

struct RecorderShared {
    workflow: Mutex<Workflow>,
    noise: Mutex<NoiseFilter>,
    config: WorkflowRecorderConfig,
    detector: ElementDetector,
    event_tx: broadcast::Sender<WorkflowStep>,
    recording: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RecorderShared {
    fn capture(&self, event: &RecordedEvent) -> Option<WorkflowStep> {
        let config = &self.config;
        let step = match &event.event {
            InteractionEvent::Click { document, target } if config.record_clicks => {
                let mut step = WorkflowStep::click(self.element_selector(document, *target)?);
                if config.capture_element_info {
                    step.element_info = Some(self.detector.analyze_element(document, *target));
                }
                step
            }
            InteractionEvent::Input {
                document,
                target,
                value,
            } if config.record_inputs => {
                let mut step =
                    WorkflowStep::input(self.element_selector(document, *target)?, value.clone());
                if config.capture_element_info {
                    step.element_info = Some(self.detector.analyze_element(document, *target));
                }
                step
            }
            InteractionEvent::Keypress { key } if config.record_keypresses => {
                WorkflowStep::keypress(key.clone(), None)
            }
            InteractionEvent::Scroll { x, y } if config.record_scrolls => WorkflowStep::scroll(*x, *y),
            InteractionEvent::LocationChanged { url } if config.record_navigation => {
                WorkflowStep::navigation(url.clone())
            }
            other => {
                debug!(kind = other.name(), "Capture disabled for event kind");
                return None;
            }
        };

        Some(match event.timestamp {
            Some(ts) => step.with_timestamp(ts),
            None => step,
        })
    }

    fn element_selector(&self, document: &DomSnapshot, target: NodeId) -> Option<String> {
        if !document.contains(target) {
            warn!(target, nodes = document.len(), "Event target is outside its document snapshot");
            return None;
        }
        Some(self.detector.generate_selector(document, target))
    }

    fn record(&self, step: WorkflowStep) -> Option<WorkflowStep> {
        if !self.recording.load(Ordering::SeqCst) {
            debug!(kind = %step.kind, "Not recording, dropping step");
            return None;
        }

        let step = validate_step(step);
        if let Err(e) = step.validate() {
            warn!(error = %e, "Dropping malformed step");
            return None;
        }

        let mut noise = lock(&self.noise);
        let mut workflow = lock(&self.workflow);

        match step.kind {
            StepKind::Navigation => {
                if self.config.dedupe_navigation && noise.last_url == step.url {
                    debug!(url = ?step.url, "Same location as the previous navigation, skipping");
                    return None;
                }
                noise.last_url = step.url.clone();
            }
            StepKind::Scroll => {
                let previous = noise.last_scroll_at.replace(step.timestamp);
                let throttle = self.config.scroll_throttle_ms;
                if let (Some(at), Some(last)) = (previous, workflow.steps.last_mut()) {
                    if throttle > 0
                        && last.kind == StepKind::Scroll
                        && step.timestamp.saturating_sub(at) < throttle
                    {
                        last.position = step.position;
                        let updated = last.clone();
                        let _ = self.event_tx.send(updated.clone());
                        return Some(updated);
                    }
                }
            }
            _ => {}
        }

        workflow.push_step(step);
        let stored = workflow.steps.last().cloned()?;
        debug!(
            kind = %stored.kind,
            selector = ?stored.selector,
            steps = workflow.steps.len(),
            "Recorded step"
        );
        let _ = self.event_tx.send(stored.clone());
        Some(stored)
    }
}

/// The workflow recorder
pub struct WorkflowRecorder {
    shared: Arc<RecorderShared>,

    /// Handle to the task draining a live event feed
    capture_task: Option<JoinHandle<()>>,
}

impl WorkflowRecorder {
    /// Create a new workflow recorder
    pub fn new(name: impl Into<String>, config: WorkflowRecorderConfig) -> Result<Self> {
        let workflow = Workflow::new(name)?;
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        Ok(Self {
            shared: Arc::new(RecorderShared {
                workflow: Mutex::new(workflow),
                noise: Mutex::new(NoiseFilter::default()),
                config,
                detector: ElementDetector::new(),
                event_tx,
                recording: AtomicBool::new(false),
            }),
            capture_task: None,
        })
    }

    pub fn config(&self) -> &WorkflowRecorderConfig {
        &self.shared.config
    }

    pub fn is_recording(&self) -> bool {
        self.shared.recording.load(Ordering::SeqCst)
    }

    /// A copy of the workflow recorded so far.
    pub fn workflow(&self) -> Workflow {
        lock(&self.shared.workflow).clone()
    }

    /// Get a stream of recorded steps
    pub fn event_stream(&self) -> impl Stream<Item = WorkflowStep> {
        let mut rx = self.shared.event_tx.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(step) => yield step,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Step stream lagged, skipped {} steps", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Start recording
    pub async fn start(&mut self) -> Result<()> {
        if self.shared.recording.swap(true, Ordering::SeqCst) {
            return Err(WorkflowRecorderError::AlreadyRecording);
        }
        let workflow = lock(&self.shared.workflow);
        info!(id = %workflow.id, name = %workflow.name, "Starting workflow recording");
        Ok(())
    }

    /// Feeds a live stream of host events into the recording until it ends or
    /// recording stops. Replaces any previously attached feed.
    pub fn attach<S>(&mut self, events: S) -> Result<()>
    where
        S: Stream<Item = RecordedEvent> + Send + Unpin + 'static,
    {
        if !self.is_recording() {
            return Err(WorkflowRecorderError::NotRecording);
        }
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }

        let shared = Arc::clone(&self.shared);
        self.capture_task = Some(tokio::spawn(async move {
            let mut events = events;
            while let Some(event) = events.next().await {
                if !shared.recording.load(Ordering::SeqCst) {
                    break;
                }
                if let Some(step) = shared.capture(&event) {
                    shared.record(step);
                }
            }
            debug!("Interaction feed ended");
        }));
        Ok(())
    }

    /// Converts a host event into a step without recording it.
    pub fn capture(&self, event: &RecordedEvent) -> Option<WorkflowStep> {
        self.shared.capture(event)
    }

    /// Captures and records one host event.
    pub fn handle_event(&self, event: impl Into<RecordedEvent>) -> Option<WorkflowStep> {
        let step = self.shared.capture(&event.into())?;
        self.shared.record(step)
    }

    /// Runs the clean-up pass on `step` and appends it to the workflow.
    ///
    /// Returns the stored step, or `None` when the step was dropped: not
    /// recording, malformed after clean-up, or filtered as noise. A scroll
    /// that collapses into the previous one returns the updated step.
    pub fn record(&self, step: WorkflowStep) -> Option<WorkflowStep> {
        self.shared.record(step)
    }

    /// Stop recording
    pub async fn stop(&mut self) -> Result<Workflow> {
        if !self.shared.recording.swap(false, Ordering::SeqCst) {
            return Err(WorkflowRecorderError::NotRecording);
        }
        if let Some(task) = self.capture_task.take() {
            task.abort();
            let _ = task.await;
        }

        let mut workflow = lock(&self.shared.workflow);
        workflow.updated_at = now_millis();
        info!(
            id = %workflow.id,
            steps = workflow.steps.len(),
            "Stopped workflow recording"
        );
        Ok(workflow.clone())
    }

    /// Save the recorded workflow to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        info!("Saving workflow recording to {:?}", path.as_ref());

        let workflow = self.workflow();
        workflow.save_to_file(path).map_err(|e| {
            WorkflowRecorderError::SaveError(format!("Failed to save workflow: {e}"))
        })?;

        Ok(())
    }
}

impl Drop for WorkflowRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.capture_task.take() {
            task.abort();
        }
    }
}
