use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::coordinator::PlaybackCoordinator;
use crate::types::{ControlMessage, Notification};

/// WebSocket handler for the control channel
pub async fn control_handler(
    ws: WebSocketUpgrade,
    State(coordinator): State<Arc<PlaybackCoordinator>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, coordinator))
}

async fn handle_socket(socket: WebSocket, coordinator: Arc<PlaybackCoordinator>) {
    info!("Control client connected");

    let (mut sender, mut receiver) = socket.split();
    let mut notifications = coordinator.subscribe();

    loop {
        tokio::select! {
            notification = notifications.recv() => {
                match notification {
                    Ok(notification) => {
                        if !send(&mut sender, &notification).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Control client lagged, skipped {} notifications", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Notification channel closed, ending control socket");
                        break;
                    }
                }
            }

            msg_result = receiver.next() => {
                match msg_result {
                    Some(Ok(Message::Text(text))) => {
                        if text.as_str() == "ping" {
                            let _ = sender.send(Message::Text("pong".into())).await;
                            continue;
                        }
                        if let Some(reply) = dispatch(&coordinator, text.as_str()).await {
                            if !send(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("Control socket close received");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("Control socket error: {}", e);
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
        }
    }

    info!("Control client disconnected");
}

/// Runs one inbound frame. Returns a reply only when the frame failed.
async fn dispatch(coordinator: &Arc<PlaybackCoordinator>, text: &str) -> Option<Notification> {
    let message = match serde_json::from_str::<ControlMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Invalid control message: {}", e);
            return Some(Notification::error(format!("Invalid control message: {e}")));
        }
    };

    let name = message.name();
    match coordinator.handle(message).await {
        Ok(transition) => {
            debug!(message = name, ?transition, "Control message handled");
            None
        }
        Err(e) => {
            warn!(message = name, error = %e, "Control message failed");
            Some(Notification::error(e.to_string()))
        }
    }
}

async fn send(sender: &mut SplitSink<WebSocket, Message>, notification: &Notification) -> bool {
    let text = match serde_json::to_string(notification) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize notification: {}", e);
            return true;
        }
    };
    if let Err(e) = sender.send(Message::Text(text.into())).await {
        warn!("Failed to send notification: {}", e);
        return false;
    }
    true
}
