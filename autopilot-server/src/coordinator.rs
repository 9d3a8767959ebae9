//! Single owner of the recording/playback state.
//!
//! Every control message goes through [`PlaybackCoordinator::handle`], which
//! takes the state lock, checks the transition and either applies it or
//! reports it as [`Transition::Ignored`].

use std::sync::{Arc, Mutex as StdMutex};

use autopilot::{
    AutomationError, BrowserSession, ExecutorConfig, PlaybackAbort, PlaybackContext,
    PlaybackObserver, TargetId, Workflow, WorkflowError, WorkflowExecutor, WorkflowLibrary,
    WorkflowStep,
};
use autopilot_workflow_recorder::{
    events_from_values, WorkflowRecorder, WorkflowRecorderConfig, WorkflowRecorderError,
    DEFAULT_WORKFLOW_NAME,
};
use futures::StreamExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::types::{ControlMessage, CoordinatorStatus, Notification, Phase};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Recorder(#[from] WorkflowRecorderError),

    #[error(transparent)]
    Automation(#[from] AutomationError),
}

/// Source of raw interaction events captured while recording.
pub trait InteractionSource: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Value>;
}

impl InteractionSource for autopilot::session::ExtensionBridge {
    fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.subscribe_events()
    }
}

impl InteractionSource for broadcast::Sender<Value> {
    fn subscribe(&self) -> broadcast::Receiver<Value> {
        broadcast::Sender::subscribe(self)
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub executor: ExecutorConfig,
    pub recorder: WorkflowRecorderConfig,
    /// Deadline for a whole playback run, checked between steps.
    pub run_timeout_ms: Option<u64>,
    pub notification_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            recorder: WorkflowRecorderConfig::default(),
            run_timeout_ms: None,
            notification_capacity: 256,
        }
    }
}

/// Outcome of a control message.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    RecordingStarted { workflow_id: String },
    RecordingStopped { workflow: Workflow },
    StepRecorded { step: WorkflowStep },
    PlaybackStarted { run_id: String },
    PlaybackStopping { run_id: String },
    /// The message was not applicable in the current state. Nothing changed.
    Ignored(String),
}

impl Transition {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Transition::Ignored(_))
    }
}

struct RecordingSession {
    recorder: WorkflowRecorder,
    target: TargetId,
    capture_task: Option<JoinHandle<()>>,
}

struct PlaybackRun {
    run_id: String,
    workflow_id: String,
    token: CancellationToken,
}

enum State {
    Idle,
    Recording(RecordingSession),
    Playing(PlaybackRun),
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Idle => Phase::Idle,
            State::Recording(_) => Phase::Recording,
            State::Playing(_) => Phase::Playing,
        }
    }
}

pub struct PlaybackCoordinator {
    session: Arc<dyn BrowserSession>,
    executor: WorkflowExecutor,
    library: WorkflowLibrary,
    config: CoordinatorConfig,
    interactions: Option<Arc<dyn InteractionSource>>,
    state: Arc<Mutex<State>>,
    playback_errors: StdMutex<Vec<WorkflowError>>,
    notify_tx: broadcast::Sender<Notification>,
}

impl PlaybackCoordinator {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        library: WorkflowLibrary,
        config: CoordinatorConfig,
    ) -> Self {
        let executor = WorkflowExecutor::with_config(session.clone(), config.executor.clone());
        let (notify_tx, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            session,
            executor,
            library,
            config,
            interactions: None,
            state: Arc::new(Mutex::new(State::Idle)),
            playback_errors: StdMutex::new(Vec::new()),
            notify_tx,
        }
    }

    /// Records live interaction events from `source` while a recording is active.
    pub fn with_interaction_source(mut self, source: Arc<dyn InteractionSource>) -> Self {
        self.interactions = Some(source);
        self
    }

    pub fn library(&self) -> &WorkflowLibrary {
        &self.library
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notify_tx.subscribe()
    }

    fn notify(&self, notification: Notification) {
        // No subscribers is fine.
        let _ = self.notify_tx.send(notification);
    }

    fn errors(&self) -> std::sync::MutexGuard<'_, Vec<WorkflowError>> {
        self.playback_errors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn playback_errors(&self) -> Vec<WorkflowError> {
        self.errors().clone()
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let state = self.state.lock().await;
        let (workflow_id, run_id, target_id) = match &*state {
            State::Idle => (None, None, None),
            State::Recording(session) => (
                Some(session.recorder.workflow().id),
                None,
                Some(session.target.to_string()),
            ),
            State::Playing(run) => (Some(run.workflow_id.clone()), Some(run.run_id.clone()), None),
        };
        CoordinatorStatus {
            state: state.phase(),
            workflow_id,
            run_id,
            target_id,
            playback_errors: self.errors().len(),
        }
    }

    /// Applies one control message.
    pub async fn handle(
        self: &Arc<Self>,
        message: ControlMessage,
    ) -> Result<Transition, CoordinatorError> {
        let name = message.name();
        let transition = match message {
            ControlMessage::StartRecording { name } => self.start_recording(name).await?,
            ControlMessage::StopRecording => self.stop_recording().await?,
            ControlMessage::StartPlayback { workflow } => self.start_playback(workflow).await,
            ControlMessage::StopPlayback => self.stop_playback().await,
            ControlMessage::RecordStep { step } => self.record_step(step).await?,
        };
        if let Transition::Ignored(reason) = &transition {
            warn!(message = name, reason = %reason, "Ignoring control message");
        }
        Ok(transition)
    }

    pub async fn start_recording(
        &self,
        name: Option<String>,
    ) -> Result<Transition, CoordinatorError> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Idle => {}
            State::Recording(_) => return Ok(Transition::Ignored("recording already active".into())),
            State::Playing(_) => return Ok(Transition::Ignored("playback in progress".into())),
        }

        let name = name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_WORKFLOW_NAME.to_string());
        self.errors().clear();

        let target = match self.session.active_target().await? {
            Some(target) => target,
            None => {
                self.session
                    .open_target(&self.config.executor.blank_url)
                    .await?
            }
        };

        let mut recorder = WorkflowRecorder::new(name, self.config.recorder.clone())?;
        recorder.start().await?;

        let workflow = recorder.workflow();
        self.library.save_current(&workflow).await?;

        // Spawned while the state lock is held, so it sees `Recording` first.
        let capture_task = self
            .interactions
            .as_ref()
            .map(|source| self.spawn_capture_task(&**source));

        info!(id = %workflow.id, name = %workflow.name, target = %target, "Recording started");
        *state = State::Recording(RecordingSession {
            recorder,
            target,
            capture_task,
        });
        drop(state);

        self.notify(Notification::RecordingStarted {
            workflow_id: workflow.id.clone(),
        });
        Ok(Transition::RecordingStarted {
            workflow_id: workflow.id,
        })
    }

    // Feeds live interaction events to the recorder. Steps are stored and
    // persisted under the state lock, the same way `record_step` does it.
    fn spawn_capture_task(&self, source: &dyn InteractionSource) -> JoinHandle<()> {
        let mut events = events_from_values(source.subscribe());
        let state = Arc::clone(&self.state);
        let library = self.library.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let state = state.lock().await;
                let State::Recording(session) = &*state else {
                    break;
                };
                if session.recorder.handle_event(event).is_none() {
                    continue;
                }
                if let Err(e) = library.save_current(&session.recorder.workflow()).await {
                    warn!(error = %e, "Failed to persist the open workflow");
                }
            }
        })
    }

    pub async fn stop_recording(&self) -> Result<Transition, CoordinatorError> {
        let mut state = self.state.lock().await;
        let mut session = match std::mem::replace(&mut *state, State::Idle) {
            State::Recording(session) => session,
            other => {
                *state = other;
                return Ok(Transition::Ignored("no recording in progress".into()));
            }
        };

        if let Some(task) = session.capture_task.take() {
            task.abort();
            let _ = task.await;
        }
        let workflow = session.recorder.stop().await?;

        self.library.save(&workflow).await?;
        self.library.clear_current().await?;
        drop(state);
        info!(id = %workflow.id, steps = workflow.steps.len(), "Recording stopped");

        self.notify(Notification::RecordingStopped {
            workflow: workflow.clone(),
        });
        Ok(Transition::RecordingStopped { workflow })
    }

    pub async fn record_step(&self, step: WorkflowStep) -> Result<Transition, CoordinatorError> {
        let state = self.state.lock().await;
        let State::Recording(session) = &*state else {
            return Ok(Transition::Ignored("not recording".into()));
        };
        let Some(stored) = session.recorder.record(step) else {
            return Ok(Transition::Ignored("step dropped by validation".into()));
        };
        self.library.save_current(&session.recorder.workflow()).await?;
        Ok(Transition::StepRecorded { step: stored })
    }

    pub async fn start_playback(self: &Arc<Self>, workflow: Workflow) -> Transition {
        let mut state = self.state.lock().await;
        match &*state {
            State::Idle => {}
            State::Recording(_) => return Transition::Ignored("recording in progress".into()),
            State::Playing(run) => {
                return Transition::Ignored(format!("playback {} already running", run.run_id))
            }
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let ctx = PlaybackContext::new(run_id.clone(), self.config.run_timeout_ms);
        self.errors().clear();
        *state = State::Playing(PlaybackRun {
            run_id: run_id.clone(),
            workflow_id: workflow.id.clone(),
            token: ctx.cancellation_token.clone(),
        });
        drop(state);

        info!(run = %run_id, workflow = %workflow.name, steps = workflow.steps.len(), "Playback started");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_playback(workflow, ctx).await;
        });
        Transition::PlaybackStarted { run_id }
    }

    async fn run_playback(&self, workflow: Workflow, ctx: PlaybackContext) {
        let observer = NotifyingObserver { coordinator: self };
        let (report, abort) = match self.executor.play_workflow(&workflow, &ctx, &observer).await {
            Ok(report) => (report, None),
            Err(PlaybackAbort { error, report }) => (report, Some(error)),
        };

        match self
            .library
            .record_run(&workflow.id, report.outcome, report.errors.len())
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => debug!(id = %workflow.id, "Played workflow is not in the library"),
            Err(e) => warn!(error = %e, "Failed to record the run outcome"),
        }

        {
            let mut state = self.state.lock().await;
            if matches!(&*state, State::Playing(run) if run.run_id == ctx.run_id) {
                *state = State::Idle;
            }
        }

        if let Some(error) = abort {
            error!(run = %ctx.run_id, error = %error.message, "Playback aborted");
            self.notify(Notification::PlaybackError {
                message: error.message,
                step: error.step,
            });
        }
        info!(run = %ctx.run_id, outcome = ?report.outcome, errors = report.errors.len(), "Playback complete");
        self.notify(Notification::PlaybackComplete {
            errors: report.errors,
        });
    }

    pub async fn stop_playback(&self) -> Transition {
        let state = self.state.lock().await;
        match &*state {
            State::Playing(run) => {
                info!(run = %run.run_id, "Stopping playback after the current step");
                run.token.cancel();
                Transition::PlaybackStopping {
                    run_id: run.run_id.clone(),
                }
            }
            _ => Transition::Ignored("no playback running".into()),
        }
    }
}

struct NotifyingObserver<'a> {
    coordinator: &'a PlaybackCoordinator,
}

impl PlaybackObserver for NotifyingObserver<'_> {
    fn on_progress(&self, _index: usize, step: &WorkflowStep, total: usize) {
        self.coordinator.notify(Notification::PlaybackProgress {
            step: step.clone(),
            total,
        });
    }

    fn on_step_error(&self, error: &WorkflowError) {
        self.coordinator.errors().push(error.clone());
    }
}
