use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AutomationError {
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Element is not visible: {0}")]
    ElementNotVisible(String),

    #[error("Element is not an input field: {0}")]
    InvalidFieldTarget(String),

    #[error("Step execution timed out: {0}")]
    StepExecutionTimeout(String),

    #[error("Unsupported step type: {0}")]
    UnsupportedStepType(String),

    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid step: {0}")]
    InvalidStep(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid selector: {0}")]
    InvalidSelector(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Platform-specific error: {0}")]
    PlatformError(String),
}

impl AutomationError {
    /// Errors raised while building an action. These are never retried.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            AutomationError::UnsupportedStepType(_)
                | AutomationError::InvalidStep(_)
                | AutomationError::InvalidSelector(_)
        )
    }
}

impl From<serde_json::Error> for AutomationError {
    fn from(err: serde_json::Error) -> Self {
        AutomationError::Storage(format!("serialization: {err}"))
    }
}

impl From<std::io::Error> for AutomationError {
    fn from(err: std::io::Error) -> Self {
        AutomationError::Storage(err.to_string())
    }
}
