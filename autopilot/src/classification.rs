use std::fmt;

/// Messages containing any of these phrases abort a playback run.
pub const FATAL_ERROR_PHRASES: [&str; 3] =
    ["Navigation failed", "Element not found", "Permission denied"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Aborts the whole run.
    Fatal,
    /// Logged, playback continues with the next step.
    Recoverable,
}

impl FailureClass {
    pub fn of(message: &str) -> Self {
        if FATAL_ERROR_PHRASES.iter().any(|p| message.contains(p)) {
            FailureClass::Fatal
        } else {
            FailureClass::Recoverable
        }
    }

    pub fn of_error(err: &dyn fmt::Display) -> Self {
        Self::of(&err.to_string())
    }

    pub fn is_fatal(self) -> bool {
        self == FailureClass::Fatal
    }
}

pub fn is_fatal(message: &str) -> bool {
    FailureClass::of(message).is_fatal()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AutomationError;

    #[test]
    fn fatal_phrases_abort() {
        assert!(is_fatal("Element not found during click"));
        assert!(is_fatal("Navigation failed: net::ERR_NAME_NOT_RESOLVED"));
        assert!(is_fatal("Permission denied: cannot access chrome:// pages"));
    }

    #[test]
    fn timeouts_are_recoverable() {
        assert!(!is_fatal("Timeout waiting for selector"));
        assert_eq!(
            FailureClass::of_error(&AutomationError::StepExecutionTimeout(
                "Timeout waiting for selector `#user`".into()
            )),
            FailureClass::Recoverable
        );
        assert_eq!(
            FailureClass::of_error(&AutomationError::ElementNotVisible("#x".into())),
            FailureClass::Recoverable
        );
    }

    #[test]
    fn rendered_errors_carry_their_phrase() {
        for err in [
            AutomationError::ElementNotFound("#a".into()),
            AutomationError::NavigationFailed("https://x.test".into()),
            AutomationError::PermissionDenied("tab".into()),
        ] {
            assert!(FailureClass::of_error(&err).is_fatal(), "{err}");
        }
    }
}
