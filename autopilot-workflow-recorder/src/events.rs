use autopilot::{DomSnapshot, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::warn;

/// A raw interaction reported by the host while recording.
///
/// Element-based events ship a snapshot of the document together with the
/// index of the target element in document order, so selectors can be
/// generated against the page as it was when the user acted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InteractionEvent {
    Click {
        document: DomSnapshot,
        target: NodeId,
    },
    Input {
        document: DomSnapshot,
        target: NodeId,
        value: String,
    },
    Keypress {
        key: String,
    },
    Scroll {
        x: f64,
        y: f64,
    },
    LocationChanged {
        url: String,
    },
}

impl InteractionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InteractionEvent::Click { .. } => "click",
            InteractionEvent::Input { .. } => "input",
            InteractionEvent::Keypress { .. } => "keypress",
            InteractionEvent::Scroll { .. } => "scroll",
            InteractionEvent::LocationChanged { .. } => "location_changed",
        }
    }
}

/// An interaction plus the host's capture time, if it sent one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(flatten)]
    pub event: InteractionEvent,
}

impl RecordedEvent {
    pub fn new(event: InteractionEvent) -> Self {
        Self {
            timestamp: None,
            event,
        }
    }

    pub fn at(timestamp: u64, event: InteractionEvent) -> Self {
        Self {
            timestamp: Some(timestamp),
            event,
        }
    }
}

impl From<InteractionEvent> for RecordedEvent {
    fn from(event: InteractionEvent) -> Self {
        Self::new(event)
    }
}

/// Adapts a feed of raw JSON events (e.g. from the extension bridge) into
/// typed events. Payloads that do not parse are logged and skipped.
pub fn events_from_values(
    mut rx: broadcast::Receiver<Value>,
) -> impl Stream<Item = RecordedEvent> + Send + Unpin + 'static {
    Box::pin(async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(value) => match serde_json::from_value::<RecordedEvent>(value) {
                    Ok(event) => yield event,
                    Err(e) => warn!("Dropping malformed interaction event: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Interaction feed lagged, skipped {} events", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_host_payloads() {
        let event: RecordedEvent = serde_json::from_value(json!({
            "kind": "click",
            "timestamp": 1700000000000u64,
            "target": 1,
            "document": {"tag": "body", "children": [{"tag": "button", "attributes": {"id": "go"}}]}
        }))
        .unwrap();
        assert_eq!(event.timestamp, Some(1700000000000));
        match event.event {
            InteractionEvent::Click { document, target } => {
                assert_eq!(target, 1);
                assert_eq!(document.find_by_id("go"), Some(1));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let event: RecordedEvent =
            serde_json::from_value(json!({"kind": "location_changed", "url": "https://x.test"}))
                .unwrap();
        assert_eq!(event.timestamp, None);
        assert_eq!(event.event.name(), "location_changed");
    }

    #[tokio::test]
    async fn value_feed_skips_garbage() {
        use futures::StreamExt;

        let (tx, rx) = broadcast::channel(8);
        let mut events = events_from_values(rx);
        tx.send(json!({"kind": "teleport"})).unwrap();
        tx.send(json!({"kind": "keypress", "key": "Enter"})).unwrap();
        drop(tx);

        let first = events.next().await.unwrap();
        assert_eq!(
            first.event,
            InteractionEvent::Keypress {
                key: "Enter".into()
            }
        );
        assert!(events.next().await.is_none());
    }
}
