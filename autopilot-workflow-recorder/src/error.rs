use autopilot::AutomationError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowRecorderError {
    #[error("Recorder initialization error: {0}")]
    InitializationError(String),

    #[error("Recording is already in progress")]
    AlreadyRecording,

    #[error("Recording has not been started")]
    NotRecording,

    #[error("Save error: {0}")]
    SaveError(String),

    #[error(transparent)]
    Automation(#[from] AutomationError),
}

pub type Result<T> = std::result::Result<T, WorkflowRecorderError>;
