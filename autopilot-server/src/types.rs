use autopilot::{Workflow, WorkflowError, WorkflowStep};
use serde::{Deserialize, Serialize};

// ============================================================================
// Control Channel
// ============================================================================

/// Inbound control message, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    StartRecording {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    StopRecording,
    StartPlayback {
        workflow: Workflow,
    },
    StopPlayback,
    RecordStep {
        step: WorkflowStep,
    },
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::StartRecording { .. } => "START_RECORDING",
            ControlMessage::StopRecording => "STOP_RECORDING",
            ControlMessage::StartPlayback { .. } => "START_PLAYBACK",
            ControlMessage::StopPlayback => "STOP_PLAYBACK",
            ControlMessage::RecordStep { .. } => "RECORD_STEP",
        }
    }
}

/// Outbound notification, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Notification {
    PlaybackProgress {
        step: WorkflowStep,
        total: usize,
    },
    PlaybackComplete {
        errors: Vec<WorkflowError>,
    },
    PlaybackError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<WorkflowStep>,
    },
    #[serde(rename_all = "camelCase")]
    RecordingStarted {
        workflow_id: String,
    },
    RecordingStopped {
        workflow: Workflow,
    },
}

impl Notification {
    pub fn error(message: impl Into<String>) -> Self {
        Notification::PlaybackError {
            message: message.into(),
            step: None,
        }
    }
}

// ============================================================================
// HTTP Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Recording,
    Playing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub state: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Errors collected by the current or most recent playback run.
    pub playback_errors: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_messages_use_wire_names() {
        let msg: ControlMessage = serde_json::from_value(json!({"type": "STOP_PLAYBACK"})).unwrap();
        assert_eq!(msg, ControlMessage::StopPlayback);

        let msg: ControlMessage =
            serde_json::from_value(json!({"type": "START_RECORDING"})).unwrap();
        assert_eq!(msg, ControlMessage::StartRecording { name: None });

        let msg: ControlMessage = serde_json::from_value(json!({
            "type": "RECORD_STEP",
            "step": {"type": "click", "selector": "#go", "timestamp": 5}
        }))
        .unwrap();
        assert_eq!(msg.name(), "RECORD_STEP");

        assert!(serde_json::from_value::<ControlMessage>(json!({"type": "REBOOT"})).is_err());
    }

    #[test]
    fn notifications_serialize_with_wire_names() {
        let value = serde_json::to_value(Notification::RecordingStarted {
            workflow_id: "wf-1".into(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "RECORDING_STARTED", "workflowId": "wf-1"}));

        let value = serde_json::to_value(Notification::error("boom")).unwrap();
        assert_eq!(value, json!({"type": "PLAYBACK_ERROR", "message": "boom"}));
    }
}
