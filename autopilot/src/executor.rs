//! Step replay.
//!
//! Each step is turned into a typed [`StepAction`], its selector is awaited,
//! the action runs under the retry wrapper and the page is polled until it
//! settles. [`WorkflowExecutor::play_workflow`] drives a whole workflow
//! sequentially against one freshly opened target.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::cancellation::{PlaybackContext, StopReason};
use crate::classification::FailureClass;
use crate::errors::AutomationError;
use crate::model::{StepKind, StepStatus, Workflow, WorkflowError, WorkflowStep};
use crate::retry::{retry_with_backoff, RetryOptions};
use crate::selector::Selector;
use crate::session::{BrowserSession, DomEvent, EventTarget, ReadyState, TargetId};

/// Pauses after each step so the page can settle before the next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub navigation: Duration,
    pub input: Duration,
    pub click: Duration,
    pub other: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        Self {
            navigation: Duration::from_millis(2000),
            input: Duration::from_millis(500),
            click: Duration::from_millis(800),
            other: Duration::from_millis(300),
        }
    }
}

impl SettleDelays {
    pub fn none() -> Self {
        Self {
            navigation: Duration::ZERO,
            input: Duration::ZERO,
            click: Duration::ZERO,
            other: Duration::ZERO,
        }
    }

    pub fn for_kind(&self, kind: StepKind) -> Duration {
        match kind {
            StepKind::Navigation => self.navigation,
            StepKind::Input => self.input,
            StepKind::Click => self.click,
            StepKind::Scroll | StepKind::Keypress => self.other,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Budget for waiting on a selector and, separately, on step completion.
    pub step_timeout: Duration,
    pub poll_interval: Duration,
    pub action_retry: RetryOptions,
    pub navigation_retry: RetryOptions,
    pub settle: SettleDelays,
    /// URL the playback target is opened with.
    pub blank_url: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            action_retry: RetryOptions::default(),
            navigation_retry: RetryOptions::default(),
            settle: SettleDelays::default(),
            blank_url: "about:blank".to_string(),
        }
    }
}

/// A step reduced to what the session has to do.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Click { selector: Selector },
    Input { selector: Selector, value: String },
    Scroll { x: f64, y: f64 },
    Keypress { key: String },
}

impl StepAction {
    /// Builds the action for `step`. Failures here are never retried.
    pub fn from_step(step: &WorkflowStep) -> Result<Self, AutomationError> {
        let selector = || -> Result<Selector, AutomationError> {
            let raw = step.target().ok_or_else(|| {
                AutomationError::InvalidStep(format!("{} step requires a selector", step.kind))
            })?;
            match Selector::from(raw) {
                Selector::Invalid(reason) => Err(AutomationError::InvalidSelector(format!(
                    "`{raw}`: {reason}"
                ))),
                selector => Ok(selector),
            }
        };

        match step.kind {
            StepKind::Click => Ok(StepAction::Click {
                selector: selector()?,
            }),
            StepKind::Input => Ok(StepAction::Input {
                selector: selector()?,
                value: step.value.clone().unwrap_or_default(),
            }),
            StepKind::Scroll => {
                let position = step.position.unwrap_or_default();
                Ok(StepAction::Scroll {
                    x: position.x,
                    y: position.y,
                })
            }
            StepKind::Keypress => {
                let key = step
                    .value
                    .clone()
                    .filter(|k| !k.is_empty())
                    .ok_or_else(|| AutomationError::InvalidStep("keypress step requires a key".into()))?;
                Ok(StepAction::Keypress { key })
            }
            StepKind::Navigation => Err(AutomationError::UnsupportedStepType(
                StepKind::Navigation.to_string(),
            )),
        }
    }

    pub fn selector(&self) -> Option<&Selector> {
        match self {
            StepAction::Click { selector } | StepAction::Input { selector, .. } => Some(selector),
            StepAction::Scroll { .. } | StepAction::Keypress { .. } => None,
        }
    }
}

/// Receives playback events in step order.
pub trait PlaybackObserver: Send + Sync {
    fn on_progress(&self, _index: usize, _step: &WorkflowStep, _total: usize) {}

    fn on_step_error(&self, _error: &WorkflowError) {}
}

impl PlaybackObserver for () {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackReport {
    pub run_id: String,
    pub workflow_id: String,
    pub outcome: RunOutcome,
    /// Per-run copies of the workflow's steps with their status filled in.
    pub steps: Vec<WorkflowStep>,
    pub errors: Vec<WorkflowError>,
}

impl PlaybackReport {
    fn new(run_id: &str, workflow: &Workflow) -> Self {
        Self {
            run_id: run_id.to_string(),
            workflow_id: workflow.id.clone(),
            outcome: RunOutcome::Completed,
            steps: workflow.steps.iter().map(WorkflowStep::run_copy).collect(),
            errors: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.errors.is_empty()
    }
}

/// A run stopped by a fatal step error.
#[derive(Debug, Clone, Error)]
#[error("playback aborted: {error}")]
pub struct PlaybackAbort {
    pub error: WorkflowError,
    pub report: PlaybackReport,
}

#[derive(Clone)]
pub struct WorkflowExecutor {
    session: Arc<dyn BrowserSession>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(session: Arc<dyn BrowserSession>) -> Self {
        Self::with_config(session, ExecutorConfig::default())
    }

    pub fn with_config(session: Arc<dyn BrowserSession>, config: ExecutorConfig) -> Self {
        Self { session, config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Replays one non-navigation step against `target`.
    #[instrument(level = "debug", skip(self, step), fields(kind = %step.kind))]
    pub async fn execute_step(
        &self,
        target: &TargetId,
        step: &WorkflowStep,
    ) -> Result<(), WorkflowError> {
        self.run_step(target, step)
            .await
            .map_err(|e| WorkflowError::from_step_failure(e, step))
    }

    async fn run_step(&self, target: &TargetId, step: &WorkflowStep) -> Result<(), AutomationError> {
        let action = StepAction::from_step(step)?;
        if let Some(selector) = action.selector() {
            self.wait_for_selector(target, selector).await?;
        }
        retry_with_backoff(|| self.perform(target, &action), &self.config.action_retry).await?;
        self.wait_for_completion(target).await
    }

    async fn wait_for_selector(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<(), AutomationError> {
        let deadline = Instant::now() + self.config.step_timeout;
        loop {
            match self.session.count_matches(target, selector).await? {
                0 => {}
                1 => return Ok(()),
                count => {
                    warn!(%selector, count, "Selector matches several elements, acting on the first");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(AutomationError::StepExecutionTimeout(format!(
                    "Timeout waiting for selector `{selector}`"
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn wait_for_completion(&self, target: &TargetId) -> Result<(), AutomationError> {
        let deadline = Instant::now() + self.config.step_timeout;
        loop {
            if self.session.ready_state(target).await? == ReadyState::Complete {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AutomationError::StepExecutionTimeout(format!(
                    "page did not settle within {:?}",
                    self.config.step_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn perform(&self, target: &TargetId, action: &StepAction) -> Result<(), AutomationError> {
        let session = &self.session;
        match action {
            StepAction::Click { selector } => {
                let state = session
                    .element_state(target, selector)
                    .await?
                    .ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))?;
                if !state.rect.has_area() {
                    return Err(AutomationError::ElementNotVisible(selector.to_string()));
                }
                session.click(target, selector).await
            }
            StepAction::Input { selector, value } => {
                let state = session
                    .element_state(target, selector)
                    .await?
                    .ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))?;
                if !state.editable {
                    return Err(AutomationError::InvalidFieldTarget(format!(
                        "{selector} is a <{}>",
                        state.tag
                    )));
                }
                session.set_value(target, selector, value).await?;
                let on = EventTarget::Element(selector.clone());
                session.dispatch_event(target, &on, &DomEvent::Input).await?;
                session.dispatch_event(target, &on, &DomEvent::Change).await
            }
            StepAction::Scroll { x, y } => session.scroll_to(target, *x, *y, true).await,
            StepAction::Keypress { key } => {
                session
                    .dispatch_event(
                        target,
                        &EventTarget::Focused,
                        &DomEvent::KeyPress { key: key.clone() },
                    )
                    .await
            }
        }
    }

    /// Navigates `target` and waits for the load, retrying with backoff.
    #[instrument(level = "debug", skip(self))]
    pub async fn navigate(&self, target: &TargetId, url: &str) -> Result<(), AutomationError> {
        let session = &self.session;
        retry_with_backoff(
            || async move {
                session.navigate(target, url).await?;
                session.wait_for_load(target).await
            },
            &self.config.navigation_retry,
        )
        .await
        .map_err(|e| match e {
            AutomationError::NavigationFailed(_) | AutomationError::PermissionDenied(_) => e,
            other => AutomationError::NavigationFailed(format!("{url}: {other}")),
        })
    }

    /// Replays every step of `workflow` in order on a new target.
    ///
    /// Cancellation and the run deadline are checked between steps only. A step
    /// seen before any navigation is skipped. Recoverable failures are collected
    /// in the report; the first fatal one aborts the run.
    #[instrument(skip(self, workflow, ctx, observer), fields(workflow = %workflow.name, run = %ctx.run_id))]
    pub async fn play_workflow(
        &self,
        workflow: &Workflow,
        ctx: &PlaybackContext,
        observer: &dyn PlaybackObserver,
    ) -> Result<PlaybackReport, PlaybackAbort> {
        let mut report = PlaybackReport::new(&ctx.run_id, workflow);
        let total = workflow.steps.len();
        info!(steps = total, "Starting playback");

        let target = match self.session.open_target(&self.config.blank_url).await {
            Ok(target) => target,
            Err(e) => {
                error!(error = %e, "Could not open a playback target");
                let error = WorkflowError::new(format!("Failed to open target: {e}"));
                report.outcome = RunOutcome::Aborted;
                report.errors.push(error.clone());
                return Err(PlaybackAbort { error, report });
            }
        };

        let mut last_url: Option<&str> = None;
        for (index, step) in workflow.steps.iter().enumerate() {
            match ctx.stop_reason() {
                Some(StopReason::Cancelled) => {
                    info!(step = index, "Playback cancelled");
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
                Some(StopReason::DeadlineExceeded) => {
                    warn!(step = index, elapsed = ?ctx.elapsed(), "Playback deadline exceeded");
                    report.outcome = RunOutcome::TimedOut;
                    break;
                }
                None => {}
            }

            let result = match (step.kind, step.url.as_deref()) {
                (StepKind::Navigation, Some(url)) => {
                    last_url = Some(url);
                    self.navigate(&target, url)
                        .await
                        .map(|_| true)
                        .map_err(|e| WorkflowError::from_step_failure(e, step))
                }
                _ if last_url.is_some() => self.execute_step(&target, step).await.map(|_| true),
                _ => {
                    debug!(step = index, kind = %step.kind, "No page loaded yet, skipping step");
                    Ok(false)
                }
            };

            match result {
                Ok(executed) => {
                    if executed {
                        report.steps[index].status = Some(StepStatus::Success);
                    }
                    observer.on_progress(index, step, total);
                    tokio::time::sleep(self.config.settle.for_kind(step.kind)).await;
                }
                Err(err) => {
                    let err = err.at_index(index);
                    let class = FailureClass::of(&err.message);
                    report.steps[index].status = Some(StepStatus::Error);
                    report.steps[index].error = Some(err.message.clone());
                    report.errors.push(err.clone());
                    observer.on_step_error(&err);
                    if class.is_fatal() {
                        error!(step = index, error = %err.message, "Fatal step failure, aborting playback");
                        report.outcome = RunOutcome::Aborted;
                        return Err(PlaybackAbort { error: err, report });
                    }
                    warn!(step = index, error = %err.message, "Step failed, continuing");
                }
            }
        }

        info!(outcome = ?report.outcome, errors = report.errors.len(), "Playback finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn navigation_is_not_an_action() {
        let err = StepAction::from_step(&WorkflowStep::navigation("https://x.test")).unwrap_err();
        assert_eq!(err, AutomationError::UnsupportedStepType("navigation".into()));
        assert!(err.is_construction_error());
    }

    #[test]
    fn scroll_defaults_missing_position_to_origin() {
        let mut step = WorkflowStep::scroll(5.0, 9.0);
        step.position = None;
        assert_eq!(
            StepAction::from_step(&step).unwrap(),
            StepAction::Scroll { x: 0.0, y: 0.0 }
        );
    }

    #[test]
    fn element_steps_need_a_parseable_selector() {
        let mut step = WorkflowStep::click("#ok");
        assert!(StepAction::from_step(&step).unwrap().selector().is_some());
        step.selector = Some("div  span".into());
        assert!(matches!(
            StepAction::from_step(&step),
            Err(AutomationError::InvalidSelector(_))
        ));
        step.selector = None;
        assert!(matches!(
            StepAction::from_step(&step),
            Err(AutomationError::InvalidStep(_))
        ));
    }

    #[test]
    fn settle_delays_by_kind() {
        let settle = SettleDelays::default();
        assert_eq!(settle.for_kind(StepKind::Navigation), Duration::from_millis(2000));
        assert_eq!(settle.for_kind(StepKind::Input), Duration::from_millis(500));
        assert_eq!(settle.for_kind(StepKind::Click), Duration::from_millis(800));
        assert_eq!(settle.for_kind(StepKind::Keypress), Duration::from_millis(300));
    }
}
