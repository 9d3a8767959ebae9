use std::fmt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::errors::AutomationError;

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The closed vocabulary of replayable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Click,
    Input,
    Navigation,
    Scroll,
    Keypress,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Click => "click",
            StepKind::Input => "input",
            StepKind::Navigation => "navigation",
            StepKind::Scroll => "scroll",
            StepKind::Keypress => "keypress",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Rendered bounds of an element in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// Recording-time diagnostics about the element a step targeted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInfo {
    pub selector: String,
    pub tag: String,
    #[serde(rename = "type")]
    pub input_type: String,
    pub visible: bool,
    pub clickable: bool,
    pub attributes: std::collections::BTreeMap<String, String>,
    pub position: Rect,
}

/// One recorded or replayable action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStep {
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_info: Option<ElementInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StepStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowStep {
    fn bare(kind: StepKind) -> Self {
        Self {
            kind,
            selector: None,
            value: None,
            url: None,
            position: None,
            timestamp: now_millis(),
            element_info: None,
            status: None,
            error: None,
        }
    }

    pub fn click(selector: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            ..Self::bare(StepKind::Click)
        }
    }

    pub fn input(selector: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            selector: Some(selector.into()),
            value: Some(value.into()),
            ..Self::bare(StepKind::Input)
        }
    }

    pub fn navigation(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::bare(StepKind::Navigation)
        }
    }

    pub fn scroll(x: f64, y: f64) -> Self {
        Self {
            position: Some(Position { x, y }),
            ..Self::bare(StepKind::Scroll)
        }
    }

    pub fn keypress(key: impl Into<String>, selector: Option<String>) -> Self {
        Self {
            value: Some(key.into()),
            selector,
            ..Self::bare(StepKind::Keypress)
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// The selector, if present and non-blank.
    pub fn target(&self) -> Option<&str> {
        self.selector
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Checks the fields each kind requires.
    pub fn validate(&self) -> Result<(), AutomationError> {
        match self.kind {
            StepKind::Navigation if self.url.as_deref().map_or(true, |u| u.trim().is_empty()) => Err(
                AutomationError::InvalidStep("navigation step requires a url".into()),
            ),
            StepKind::Scroll if self.position.is_none() => Err(AutomationError::InvalidStep(
                "scroll step requires a position".into(),
            )),
            StepKind::Click | StepKind::Input if self.target().is_none() => Err(
                AutomationError::InvalidStep(format!("{} step requires a selector", self.kind)),
            ),
            // " " is the space key, so only an empty key is missing.
            StepKind::Keypress if self.value.as_deref().map_or(true, str::is_empty) => Err(
                AutomationError::InvalidStep("keypress step requires a key".into()),
            ),
            _ => Ok(()),
        }
    }

    /// A copy for a single run, marked pending.
    pub fn run_copy(&self) -> Self {
        Self {
            status: Some(StepStatus::Pending),
            error: None,
            ..self.clone()
        }
    }
}

/// A named, ordered sequence of steps plus run bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<u64>,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Result<Self, AutomationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AutomationError::InvalidWorkflow(
                "workflow name must not be empty".into(),
            ));
        }
        let now = now_millis();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
            status: Some(WorkflowStatus::Active),
            last_run: None,
            success_count: 0,
            failure_count: 0,
        })
    }

    /// Appends a step, keeping timestamps non-decreasing.
    pub fn push_step(&mut self, mut step: WorkflowStep) {
        if let Some(last) = self.steps.last() {
            step.timestamp = step.timestamp.max(last.timestamp);
        }
        self.updated_at = now_millis().max(step.timestamp);
        self.steps.push(step);
    }

    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.name.trim().is_empty() {
            return Err(AutomationError::InvalidWorkflow(
                "workflow name must not be empty".into(),
            ));
        }
        for (index, step) in self.steps.iter().enumerate() {
            step.validate().map_err(|e| {
                AutomationError::InvalidWorkflow(format!("step {index}: {e}"))
            })?;
        }
        if self
            .steps
            .windows(2)
            .any(|pair| pair[1].timestamp < pair[0].timestamp)
        {
            return Err(AutomationError::InvalidWorkflow(
                "step timestamps must be non-decreasing".into(),
            ));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), AutomationError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AutomationError> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

/// A step failure captured during a recording or a playback run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowError {
    pub timestamp: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip)]
    pub source: Option<AutomationError>,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            timestamp: now_millis(),
            message: message.into(),
            step: None,
            step_index: None,
            details: None,
            source: None,
        }
    }

    /// Wraps a raw failure with the kind, selector and url of the step that raised it.
    pub fn from_step_failure(err: AutomationError, step: &WorkflowStep) -> Self {
        Self {
            timestamp: now_millis(),
            message: err.to_string(),
            details: Some(serde_json::json!({
                "type": step.kind,
                "selector": step.selector,
                "url": step.url,
            })),
            step: Some(step.clone()),
            step_index: None,
            source: Some(err),
        }
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.step_index = Some(index);
        self
    }
}

impl fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{} ({} step)", self.message, step.kind),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for WorkflowError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_workflow_name() {
        assert!(matches!(
            Workflow::new("   "),
            Err(AutomationError::InvalidWorkflow(_))
        ));
        let wf = Workflow::new("login").unwrap();
        assert_eq!(wf.status, Some(WorkflowStatus::Active));
        assert!(!wf.id.is_empty());
    }

    #[test]
    fn step_validation_per_kind() {
        assert!(WorkflowStep::click("#go").validate().is_ok());
        assert!(WorkflowStep::click("  ").validate().is_err());
        assert!(WorkflowStep::navigation("").validate().is_err());
        assert!(WorkflowStep::keypress("Enter", None).validate().is_ok());
        assert!(WorkflowStep::keypress(" ", None).validate().is_ok());
        assert!(WorkflowStep::keypress("", None).validate().is_err());

        let mut scroll = WorkflowStep::scroll(0.0, 10.0);
        assert!(scroll.validate().is_ok());
        scroll.position = None;
        assert!(scroll.validate().is_err());
    }

    #[test]
    fn push_step_keeps_timestamps_monotonic() {
        let mut wf = Workflow::new("t").unwrap();
        wf.push_step(WorkflowStep::click("#a").with_timestamp(100));
        wf.push_step(WorkflowStep::click("#b").with_timestamp(50));
        assert_eq!(wf.steps[1].timestamp, 100);
        assert!(wf.validate().is_ok());
    }

    #[test]
    fn step_wire_format_uses_type_tag() {
        let json = serde_json::to_value(WorkflowStep::input("#user", "alice").with_timestamp(1))
            .unwrap();
        assert_eq!(json["type"], "input");
        assert_eq!(json["selector"], "#user");
        assert!(json.get("url").is_none());

        let parsed: WorkflowStep =
            serde_json::from_str(r#"{"type":"navigation","url":"https://x.test","timestamp":5}"#)
                .unwrap();
        assert_eq!(parsed.kind, StepKind::Navigation);
        assert_eq!(parsed.url.as_deref(), Some("https://x.test"));
    }

    #[test]
    fn step_failure_details_carry_step_fields() {
        let step = WorkflowStep::click("#login");
        let err = WorkflowError::from_step_failure(
            AutomationError::ElementNotFound("#login".into()),
            &step,
        );
        assert_eq!(err.message, "Element not found: #login");
        let details = err.details.unwrap();
        assert_eq!(details["type"], "click");
        assert_eq!(details["selector"], "#login");
        assert!(details["url"].is_null());
    }
}
