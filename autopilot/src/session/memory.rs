//! In-memory host backed by [`DomSnapshot`] pages.
//!
//! Used for dry runs and tests: pages are registered by URL, every side effect
//! is appended to a call log, and any primitive can be made to fail on demand.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use super::{BrowserSession, DomEvent, ElementState, EventTarget, ReadyState, TargetId};
use crate::dom::{DocumentTree, DomSnapshot, NodeId, NodeSpec};
use crate::errors::AutomationError;
use crate::model::Position;
use crate::selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionOp {
    OpenTarget,
    ActiveTarget,
    Navigate,
    WaitForLoad,
    ReadyState,
    CountMatches,
    ElementState,
    Click,
    SetValue,
    DispatchEvent,
    ScrollTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    Always,
    Times(u32),
}

/// A side effect observed by the session, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCall {
    OpenTarget { url: String },
    Navigate { target: TargetId, url: String },
    Click { target: TargetId, selector: String },
    SetValue { target: TargetId, selector: String, value: String },
    DispatchEvent { target: TargetId, on: String, event: String },
    ScrollTo { target: TargetId, x: f64, y: f64, smooth: bool },
}

struct InjectedFailure {
    op: SessionOp,
    error: AutomationError,
    remaining: Option<u32>,
}

struct TargetState {
    url: String,
    document: DomSnapshot,
    values: HashMap<NodeId, String>,
    focused: Option<NodeId>,
    scroll: Position,
}

#[derive(Default)]
struct MemoryState {
    pages: HashMap<String, DomSnapshot>,
    targets: HashMap<TargetId, TargetState>,
    active: Option<TargetId>,
    next_target: u32,
    ready_state: Option<ReadyState>,
    failures: Vec<InjectedFailure>,
    calls: Vec<SessionCall>,
    invocations: HashMap<SessionOp, usize>,
}

impl MemoryState {
    /// Counts the invocation and returns the injected failure for `op`, if any.
    fn take_failure(&mut self, op: SessionOp) -> Result<(), AutomationError> {
        *self.invocations.entry(op).or_default() += 1;
        let Some(pos) = self
            .failures
            .iter()
            .position(|f| f.op == op && f.remaining != Some(0))
        else {
            return Ok(());
        };
        let failure = &mut self.failures[pos];
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Err(failure.error.clone())
    }

    fn page(&self, url: &str) -> DomSnapshot {
        self.pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| DomSnapshot::new(NodeSpec::new("html").child(NodeSpec::new("body"))))
    }

    fn target(&mut self, id: &TargetId) -> Result<&mut TargetState, AutomationError> {
        self.targets
            .get_mut(id)
            .ok_or_else(|| AutomationError::PlatformError(format!("unknown target {id}")))
    }
}

#[derive(Default)]
pub struct MemorySession {
    state: Mutex<MemoryState>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the document served for `url`.
    pub fn with_page(self, url: impl Into<String>, document: DomSnapshot) -> Self {
        self.add_page(url, document);
        self
    }

    pub fn add_page(&self, url: impl Into<String>, document: DomSnapshot) {
        self.lock().pages.insert(url.into(), document);
    }

    /// Makes `op` fail with `error` according to `mode`.
    pub fn inject_failure(&self, op: SessionOp, error: AutomationError, mode: FailureMode) {
        let remaining = match mode {
            FailureMode::Always => None,
            FailureMode::Times(n) => Some(n),
        };
        self.lock().failures.push(InjectedFailure {
            op,
            error,
            remaining,
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Overrides the ready state reported for every target.
    pub fn set_ready_state(&self, state: Option<ReadyState>) {
        self.lock().ready_state = state;
    }

    pub fn calls(&self) -> Vec<SessionCall> {
        self.lock().calls.clone()
    }

    /// How many times `op` was invoked, failed attempts included.
    pub fn invocations(&self, op: SessionOp) -> usize {
        self.lock().invocations.get(&op).copied().unwrap_or(0)
    }

    pub fn url_of(&self, target: &TargetId) -> Option<String> {
        self.lock().targets.get(target).map(|t| t.url.clone())
    }

    pub fn value_of(&self, target: &TargetId, selector: &str) -> Option<String> {
        let state = self.lock();
        let t = state.targets.get(target)?;
        let node = t.document.select(selector)?;
        t.values.get(&node).cloned()
    }

    pub fn scroll_position(&self, target: &TargetId) -> Option<Position> {
        self.lock().targets.get(target).map(|t| t.scroll)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-call; the state is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn first_match(
        state: &mut MemoryState,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<Option<NodeId>, AutomationError> {
        let t = state.target(target)?;
        Ok(t.document.query_all(selector).into_iter().next())
    }
}

#[async_trait]
impl BrowserSession for MemorySession {
    async fn open_target(&self, url: &str) -> Result<TargetId, AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::OpenTarget)?;
        state.next_target += 1;
        let id = TargetId(format!("tab-{}", state.next_target));
        let document = state.page(url);
        state.targets.insert(
            id.clone(),
            TargetState {
                url: url.to_string(),
                document,
                values: HashMap::new(),
                focused: None,
                scroll: Position::default(),
            },
        );
        state.active = Some(id.clone());
        state.calls.push(SessionCall::OpenTarget {
            url: url.to_string(),
        });
        debug!(target = %id, url, "opened target");
        Ok(id)
    }

    async fn active_target(&self) -> Result<Option<TargetId>, AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::ActiveTarget)?;
        Ok(state.active.clone())
    }

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::Navigate)?;
        let document = state.page(url);
        let t = state.target(target)?;
        t.url = url.to_string();
        t.document = document;
        t.values.clear();
        t.focused = None;
        t.scroll = Position::default();
        state.calls.push(SessionCall::Navigate {
            target: target.clone(),
            url: url.to_string(),
        });
        Ok(())
    }

    async fn wait_for_load(&self, target: &TargetId) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::WaitForLoad)?;
        state.target(target)?;
        Ok(())
    }

    async fn ready_state(&self, target: &TargetId) -> Result<ReadyState, AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::ReadyState)?;
        state.target(target)?;
        Ok(state.ready_state.unwrap_or(ReadyState::Complete))
    }

    async fn count_matches(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<usize, AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::CountMatches)?;
        Ok(state.target(target)?.document.query_count(selector))
    }

    async fn element_state(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<Option<ElementState>, AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::ElementState)?;
        let Some(node) = Self::first_match(&mut state, target, selector)? else {
            return Ok(None);
        };
        let doc = &state.target(target)?.document;
        let tag = doc.tag_name(node);
        Ok(Some(ElementState {
            editable: tag == "input" || tag == "textarea",
            rect: doc.bounding_rect(node),
            tag,
        }))
    }

    async fn click(&self, target: &TargetId, selector: &Selector) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::Click)?;
        let node = Self::first_match(&mut state, target, selector)?
            .ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))?;
        state.target(target)?.focused = Some(node);
        state.calls.push(SessionCall::Click {
            target: target.clone(),
            selector: selector.to_string(),
        });
        Ok(())
    }

    async fn set_value(
        &self,
        target: &TargetId,
        selector: &Selector,
        value: &str,
    ) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::SetValue)?;
        let node = Self::first_match(&mut state, target, selector)?
            .ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))?;
        let t = state.target(target)?;
        t.values.insert(node, value.to_string());
        t.focused = Some(node);
        state.calls.push(SessionCall::SetValue {
            target: target.clone(),
            selector: selector.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn dispatch_event(
        &self,
        target: &TargetId,
        on: &EventTarget,
        event: &DomEvent,
    ) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::DispatchEvent)?;
        let on = match on {
            EventTarget::Element(selector) => {
                Self::first_match(&mut state, target, selector)?
                    .ok_or_else(|| AutomationError::ElementNotFound(selector.to_string()))?;
                selector.to_string()
            }
            EventTarget::Focused => {
                let t = state.target(target)?;
                let node = t.focused.unwrap_or_else(|| t.document.body());
                t.document.tag_name(node)
            }
        };
        let event = match event {
            DomEvent::KeyPress { key } => format!("keypress:{key}"),
            other => other.name().to_string(),
        };
        state.calls.push(SessionCall::DispatchEvent {
            target: target.clone(),
            on,
            event,
        });
        Ok(())
    }

    async fn scroll_to(
        &self,
        target: &TargetId,
        x: f64,
        y: f64,
        smooth: bool,
    ) -> Result<(), AutomationError> {
        let mut state = self.lock();
        state.take_failure(SessionOp::ScrollTo)?;
        state.target(target)?.scroll = Position { x, y };
        state.calls.push(SessionCall::ScrollTo {
            target: target.clone(),
            x,
            y,
            smooth,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_page() -> DomSnapshot {
        DomSnapshot::new(NodeSpec::new("body").children([
            NodeSpec::new("input").id("user"),
            NodeSpec::new("button").id("login").text("Log in"),
        ]))
    }

    #[tokio::test]
    async fn navigation_swaps_documents() {
        let session = MemorySession::new().with_page("https://x.test/login", login_page());
        let tab = session.open_target("about:blank").await.unwrap();
        let login = Selector::from("#login");
        assert_eq!(session.count_matches(&tab, &login).await.unwrap(), 0);

        session.navigate(&tab, "https://x.test/login").await.unwrap();
        assert_eq!(session.count_matches(&tab, &login).await.unwrap(), 1);
        assert_eq!(session.url_of(&tab).as_deref(), Some("https://x.test/login"));

        let user = session
            .element_state(&tab, &Selector::from("#user"))
            .await
            .unwrap()
            .unwrap();
        assert!(user.editable);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let session = MemorySession::new();
        session.inject_failure(
            SessionOp::OpenTarget,
            AutomationError::PermissionDenied("tabs".into()),
            FailureMode::Times(1),
        );
        assert!(session.open_target("about:blank").await.is_err());
        assert!(session.open_target("about:blank").await.is_ok());
        assert_eq!(session.calls().len(), 1);
    }
}
