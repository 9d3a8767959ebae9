//! Cancellation and the optional deadline of one playback run.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a run ends before its next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

#[derive(Clone, Debug)]
pub struct PlaybackContext {
    pub run_id: String,
    /// Cancelling it stops the run once the in-flight step finishes.
    pub cancellation_token: CancellationToken,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl PlaybackContext {
    pub fn new(run_id: impl Into<String>, run_timeout_ms: Option<u64>) -> Self {
        let started_at = Instant::now();
        Self {
            run_id: run_id.into(),
            cancellation_token: CancellationToken::new(),
            started_at,
            deadline: run_timeout_ms.map(|ms| started_at + Duration::from_millis(ms)),
        }
    }

    pub fn cancel(&self) {
        self.cancellation_token.cancel();
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Checked at step boundaries. Cancellation takes precedence over the deadline.
    pub fn stop_reason(&self) -> Option<StopReason> {
        if self.cancellation_token.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => Some(StopReason::DeadlineExceeded),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelling_a_clone_stops_the_run() {
        let ctx = PlaybackContext::new("run-1", None);
        assert_eq!(ctx.stop_reason(), None);
        ctx.clone().cancel();
        assert_eq!(ctx.stop_reason(), Some(StopReason::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_observed() {
        let ctx = PlaybackContext::new("run-2", Some(1_000));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(ctx.stop_reason(), None);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(ctx.stop_reason(), Some(StopReason::DeadlineExceeded));

        ctx.cancel();
        assert_eq!(ctx.stop_reason(), Some(StopReason::Cancelled));
    }
}
