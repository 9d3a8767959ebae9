//! Typed automation primitives a host browser session provides.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AutomationError;
use crate::model::Rect;
use crate::selector::Selector;

pub mod extension;
pub mod memory;

pub use extension::{ExtensionBridge, ExtensionSession};
pub use memory::{FailureMode, MemorySession, SessionCall, SessionOp};

/// Identifies a tab/page inside the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

/// What the executor needs to know about a matched element before acting on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementState {
    pub tag: String,
    pub rect: Rect,
    /// `<input>` or `<textarea>`
    pub editable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomEvent {
    Input,
    Change,
    KeyPress { key: String },
}

impl DomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomEvent::Input => "input",
            DomEvent::Change => "change",
            DomEvent::KeyPress { .. } => "keypress",
        }
    }
}

/// Where a dispatched event lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    Element(Selector),
    /// The document's active element.
    Focused,
}

#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Opens a new tab/page at `url` and returns its id.
    async fn open_target(&self, url: &str) -> Result<TargetId, AutomationError>;

    /// The tab the user is currently looking at, if any.
    async fn active_target(&self) -> Result<Option<TargetId>, AutomationError>;

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<(), AutomationError>;

    /// Resolves once the last navigation of `target` has finished loading.
    async fn wait_for_load(&self, target: &TargetId) -> Result<(), AutomationError>;

    async fn ready_state(&self, target: &TargetId) -> Result<ReadyState, AutomationError>;

    async fn count_matches(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<usize, AutomationError>;

    /// State of the first element matching `selector`, or `None` when absent.
    async fn element_state(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<Option<ElementState>, AutomationError>;

    async fn click(&self, target: &TargetId, selector: &Selector) -> Result<(), AutomationError>;

    async fn set_value(
        &self,
        target: &TargetId,
        selector: &Selector,
        value: &str,
    ) -> Result<(), AutomationError>;

    async fn dispatch_event(
        &self,
        target: &TargetId,
        on: &EventTarget,
        event: &DomEvent,
    ) -> Result<(), AutomationError>;

    async fn scroll_to(
        &self,
        target: &TargetId,
        x: f64,
        y: f64,
        smooth: bool,
    ) -> Result<(), AutomationError>;
}
