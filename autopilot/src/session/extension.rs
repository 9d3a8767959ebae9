//! Host session backed by a browser extension.
//!
//! The extension connects to a local WebSocket server and executes typed
//! commands against real tabs. It also pushes the raw interaction events it
//! observes while recording, which are re-broadcast to subscribers.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

use super::{BrowserSession, DomEvent, ElementState, EventTarget, ReadyState, TargetId};
use crate::errors::AutomationError;
use crate::selector::Selector;

pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:17373";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Reduce type complexity for Clippy
type BridgeResult = Result<Value, AutomationError>;
type PendingMap = HashMap<String, oneshot::Sender<BridgeResult>>;
type Pending = Arc<Mutex<PendingMap>>;
type Clients = Arc<Mutex<Vec<Client>>>;

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    id: String,
    action: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeIncoming {
    CommandResult {
        id: String,
        ok: bool,
        result: Option<Value>,
        error: Option<Value>,
    },
    Typed(TypedIncoming),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum TypedIncoming {
    #[serde(rename = "hello")]
    Hello { from: Option<String> },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "interaction_event")]
    InteractionEvent { event: Value },
}

/// Maps an extension error payload onto the automation error taxonomy.
///
/// Structured payloads look like `{"code": "element_not_found", "message": "..."}`;
/// anything else is treated as a plain message.
fn error_from_reply(error: Option<Value>) -> AutomationError {
    let Some(error) = error else {
        return AutomationError::PlatformError("unknown error".into());
    };
    let (code, message) = match &error {
        Value::Object(map) => (
            map.get("code").and_then(Value::as_str).unwrap_or(""),
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
        ),
        Value::String(s) => ("", s.clone()),
        other => ("", other.to_string()),
    };
    match code {
        "element_not_found" => AutomationError::ElementNotFound(message),
        "element_not_visible" => AutomationError::ElementNotVisible(message),
        "invalid_field_target" => AutomationError::InvalidFieldTarget(message),
        "navigation_failed" => AutomationError::NavigationFailed(message),
        "permission_denied" => AutomationError::PermissionDenied(message),
        "timeout" => AutomationError::StepExecutionTimeout(message),
        _ => AutomationError::PlatformError(message),
    }
}

struct Client {
    sender: mpsc::UnboundedSender<Message>,
}

pub struct ExtensionBridge {
    _server_task: JoinHandle<()>,
    local_addr: SocketAddr,
    clients: Clients,
    pending: Pending,
    events: broadcast::Sender<Value>,
}

impl ExtensionBridge {
    pub async fn start(addr: &str) -> Result<Arc<ExtensionBridge>, AutomationError> {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::warn!(%addr, ?e, "Port in use, waiting 2 seconds and retrying once...");
                tokio::time::sleep(Duration::from_secs(2)).await;
                TcpListener::bind(addr).await.map_err(|e2| {
                    AutomationError::PlatformError(format!("failed to bind {addr} after retry: {e2}"))
                })?
            }
            Err(e) => {
                return Err(AutomationError::PlatformError(format!(
                    "failed to bind {addr}: {e}"
                )))
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| AutomationError::PlatformError(format!("local addr: {e}")))?;
        tracing::info!("Extension bridge listening on {}", local_addr);

        let clients: Clients = Arc::new(Mutex::new(Vec::new()));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(256);

        let server_task = tokio::spawn(Self::accept_loop(
            listener,
            clients.clone(),
            pending.clone(),
            events.clone(),
        ));

        Ok(Arc::new(ExtensionBridge {
            _server_task: server_task,
            local_addr,
            clients,
            pending,
            events,
        }))
    }

    async fn accept_loop(
        listener: TcpListener,
        clients: Clients,
        pending: Pending,
        events: broadcast::Sender<Value>,
    ) {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("ws accept error: {}", e);
                    continue;
                }
            };
            let ws_clients = clients.clone();
            let ws_pending = pending.clone();
            let ws_events = events.clone();
            tokio::spawn(async move {
                let ws_stream = match accept_async(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::warn!("ws handshake error: {}", e);
                        return;
                    }
                };
                let (mut sink, mut stream) = ws_stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

                // writer task
                let writer = tokio::spawn(async move {
                    while let Some(msg) = rx.recv().await {
                        if let Err(e) = sink.send(msg).await {
                            tracing::warn!("ws send error: {}", e);
                            break;
                        }
                    }
                });

                ws_clients.lock().await.push(Client { sender: tx.clone() });

                // reader loop
                while let Some(Ok(msg)) = stream.next().await {
                    if !msg.is_text() {
                        continue;
                    }
                    let txt = msg.into_text().unwrap_or_default();
                    match serde_json::from_str::<BridgeIncoming>(&txt) {
                        Ok(BridgeIncoming::CommandResult {
                            id,
                            ok,
                            result,
                            error,
                        }) => {
                            let reply = if ok {
                                Ok(result.unwrap_or(Value::Null))
                            } else {
                                let err = error_from_reply(error);
                                tracing::debug!(id = %id, error = %err, "Bridge command failed");
                                Err(err)
                            };
                            if let Some(tx) = ws_pending.lock().await.remove(&id) {
                                let _ = tx.send(reply);
                            }
                        }
                        Ok(BridgeIncoming::Typed(TypedIncoming::InteractionEvent { event })) => {
                            // No subscribers simply means nobody is recording.
                            let _ = ws_events.send(event);
                        }
                        Ok(BridgeIncoming::Typed(TypedIncoming::Hello { from })) => {
                            tracing::info!(from = ?from, "Extension connected");
                        }
                        Ok(BridgeIncoming::Typed(TypedIncoming::Pong)) => {}
                        Err(e) => tracing::warn!("Invalid incoming JSON: {}", e),
                    }
                }

                ws_clients
                    .lock()
                    .await
                    .retain(|c| !c.sender.same_channel(&tx));
                writer.abort();
            });
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn is_client_connected(&self) -> bool {
        !self.clients.lock().await.is_empty()
    }

    /// Raw interaction events pushed by the extension.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Value> {
        self.events.subscribe()
    }

    /// Sends a command to the first connected extension and waits for its reply.
    pub async fn request(
        &self,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, AutomationError> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel::<BridgeResult>();
        self.pending.lock().await.insert(id.clone(), tx);
        let payload = serde_json::to_string(&CommandRequest {
            id: id.clone(),
            action,
            params,
        })
        .map_err(|e| AutomationError::PlatformError(format!("bridge serialize: {e}")))?;

        let sent = {
            let clients = self.clients.lock().await;
            tracing::debug!(clients = clients.len(), action, "Sending command to extension");
            clients
                .first()
                .map(|c| c.sender.send(Message::Text(payload)).is_ok())
                .unwrap_or(false)
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(AutomationError::PlatformError(
                "no browser extension connected".into(),
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_canceled)) => Err(AutomationError::PlatformError(
                "extension disconnected before replying".into(),
            )),
            Err(_elapsed) => {
                self.pending.lock().await.remove(&id);
                tracing::warn!("ExtensionBridge: timed out waiting for reply (id={})", id);
                Err(AutomationError::PlatformError(format!(
                    "extension did not answer `{action}` within {timeout:?}"
                )))
            }
        }
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(
    action: &str,
    value: Value,
) -> Result<T, AutomationError> {
    serde_json::from_value(value)
        .map_err(|e| AutomationError::PlatformError(format!("bad `{action}` reply: {e}")))
}

// `{"css": ...}` for anything `querySelectorAll` understands, otherwise a
// tag plus the text its trimmed content must include.
fn locator_json(selector: &Selector) -> Value {
    match (selector, selector.to_css()) {
        (_, Some(css)) => json!({ "css": css }),
        (Selector::TagText { tag, text }, None) => json!({ "tag": tag, "text": text }),
        (other, None) => json!({ "css": other.to_string() }),
    }
}

fn event_target_json(on: &EventTarget) -> Value {
    match on {
        EventTarget::Element(selector) => json!({ "locator": locator_json(selector) }),
        EventTarget::Focused => json!({ "focused": true }),
    }
}

fn dom_event_json(event: &DomEvent) -> Value {
    match event {
        DomEvent::KeyPress { key } => json!({ "type": event.name(), "key": key }),
        other => json!({ "type": other.name() }),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetReply {
    target_id: TargetId,
}

/// [`BrowserSession`] that forwards each primitive to the extension.
#[derive(Clone)]
pub struct ExtensionSession {
    bridge: Arc<ExtensionBridge>,
    request_timeout: Duration,
}

impl ExtensionSession {
    pub fn new(bridge: Arc<ExtensionBridge>) -> Self {
        Self {
            bridge,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn bridge(&self) -> &Arc<ExtensionBridge> {
        &self.bridge
    }

    async fn call(&self, action: &str, params: Value) -> Result<Value, AutomationError> {
        self.bridge
            .request(action, params, self.request_timeout)
            .await
    }
}

#[async_trait]
impl BrowserSession for ExtensionSession {
    async fn open_target(&self, url: &str) -> Result<TargetId, AutomationError> {
        let reply = self.call("open_target", json!({ "url": url })).await?;
        Ok(parse_reply::<TargetReply>("open_target", reply)?.target_id)
    }

    async fn active_target(&self) -> Result<Option<TargetId>, AutomationError> {
        let reply = self.call("active_target", json!({})).await?;
        if reply.is_null() {
            return Ok(None);
        }
        Ok(Some(
            parse_reply::<TargetReply>("active_target", reply)?.target_id,
        ))
    }

    async fn navigate(&self, target: &TargetId, url: &str) -> Result<(), AutomationError> {
        self.call("navigate", json!({ "targetId": target, "url": url }))
            .await
            .map(|_| ())
    }

    async fn wait_for_load(&self, target: &TargetId) -> Result<(), AutomationError> {
        self.call("wait_for_load", json!({ "targetId": target }))
            .await
            .map(|_| ())
    }

    async fn ready_state(&self, target: &TargetId) -> Result<ReadyState, AutomationError> {
        let reply = self.call("ready_state", json!({ "targetId": target })).await?;
        parse_reply("ready_state", reply)
    }

    async fn count_matches(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<usize, AutomationError> {
        let reply = self
            .call(
                "count",
                json!({ "targetId": target, "locator": locator_json(selector) }),
            )
            .await?;
        parse_reply("count", reply)
    }

    async fn element_state(
        &self,
        target: &TargetId,
        selector: &Selector,
    ) -> Result<Option<ElementState>, AutomationError> {
        let reply = self
            .call(
                "element_state",
                json!({ "targetId": target, "locator": locator_json(selector) }),
            )
            .await?;
        parse_reply("element_state", reply)
    }

    async fn click(&self, target: &TargetId, selector: &Selector) -> Result<(), AutomationError> {
        self.call(
            "click",
            json!({ "targetId": target, "locator": locator_json(selector) }),
        )
        .await
        .map(|_| ())
    }

    async fn set_value(
        &self,
        target: &TargetId,
        selector: &Selector,
        value: &str,
    ) -> Result<(), AutomationError> {
        self.call(
            "set_value",
            json!({ "targetId": target, "locator": locator_json(selector), "value": value }),
        )
        .await
        .map(|_| ())
    }

    async fn dispatch_event(
        &self,
        target: &TargetId,
        on: &EventTarget,
        event: &DomEvent,
    ) -> Result<(), AutomationError> {
        self.call(
            "dispatch_event",
            json!({
                "targetId": target,
                "target": event_target_json(on),
                "event": dom_event_json(event),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn scroll_to(
        &self,
        target: &TargetId,
        x: f64,
        y: f64,
        smooth: bool,
    ) -> Result<(), AutomationError> {
        let behavior = if smooth { "smooth" } else { "auto" };
        self.call(
            "scroll_to",
            json!({ "targetId": target, "x": x, "y": y, "behavior": behavior }),
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structured_errors_map_to_variants() {
        let err = error_from_reply(Some(json!({"code": "element_not_found", "message": "#go"})));
        assert_eq!(err, AutomationError::ElementNotFound("#go".into()));

        let err = error_from_reply(Some(json!("Cannot access a chrome:// URL")));
        assert_eq!(
            err,
            AutomationError::PlatformError("Cannot access a chrome:// URL".into())
        );

        let err = error_from_reply(Some(json!({"code": "permission_denied", "message": "tab"})));
        assert!(err.to_string().starts_with("Permission denied"));
    }

    #[test]
    fn incoming_frames_parse() {
        let reply: BridgeIncoming =
            serde_json::from_str(r#"{"id":"1","ok":true,"result":{"targetId":"7"}}"#).unwrap();
        assert!(matches!(reply, BridgeIncoming::CommandResult { ok: true, .. }));

        let event: BridgeIncoming = serde_json::from_str(
            r#"{"type":"interaction_event","event":{"kind":"keypress","key":"Enter"}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            BridgeIncoming::Typed(TypedIncoming::InteractionEvent { .. })
        ));
    }

    #[test]
    fn text_locators_are_sent_as_tag_and_text() {
        let link = EventTarget::Element(Selector::from(r#"a:contains("Pricing")"#));
        assert_eq!(
            event_target_json(&link),
            json!({ "locator": { "tag": "a", "text": "Pricing" } })
        );

        let item = Selector::from("#main > ul > li:nth-child(2)");
        assert_eq!(
            locator_json(&item),
            json!({ "css": "#main > ul > li:nth-of-type(2)" })
        );
        assert_eq!(
            locator_json(&Selector::from("div.item > span")),
            json!({ "css": "div.item > span" })
        );
        assert_eq!(
            event_target_json(&EventTarget::Focused),
            json!({ "focused": true })
        );
    }

    #[tokio::test]
    async fn request_without_client_fails_fast() {
        let bridge = ExtensionBridge::start("127.0.0.1:0").await.unwrap();
        assert!(!bridge.is_client_connected().await);
        let err = bridge
            .request("ready_state", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no browser extension connected"));
    }
}
