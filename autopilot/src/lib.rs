//! Browser workflow record/replay engine
//!
//! Recorded user interactions become an ordered list of [`WorkflowStep`]s that
//! can later be replayed against a live [`BrowserSession`] with polling,
//! retry/backoff and fatal/recoverable failure classification.

pub mod cancellation;
pub mod classification;
pub mod dom;
pub mod element_detector;
pub mod errors;
pub mod executor;
pub mod model;
pub mod retry;
pub mod selector;
pub mod session;
pub mod storage;

pub use cancellation::{PlaybackContext, StopReason};
pub use classification::{is_fatal, FailureClass, FATAL_ERROR_PHRASES};
pub use dom::{ComputedStyle, DocumentTree, DomSnapshot, NodeId, NodeSpec};
pub use element_detector::ElementDetector;
pub use errors::AutomationError;
pub use executor::{
    ExecutorConfig, PlaybackAbort, PlaybackObserver, PlaybackReport, RunOutcome, SettleDelays,
    StepAction, WorkflowExecutor,
};
pub use model::{
    ElementInfo, Position, Rect, StepKind, StepStatus, Workflow, WorkflowError, WorkflowStatus,
    WorkflowStep,
};
pub use retry::{retry_with_backoff, RetryOptions};
pub use selector::{Compound, PathSegment, Selector};
pub use session::{BrowserSession, ElementState, ReadyState, TargetId};
pub use storage::{FileStore, KeyValueStore, MemoryStore, WorkflowLibrary};
