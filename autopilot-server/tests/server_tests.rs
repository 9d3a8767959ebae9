use std::net::SocketAddr;
use std::sync::Arc;

use autopilot::session::MemorySession;
use autopilot::{Workflow, WorkflowLibrary};
use autopilot_server::{router, CoordinatorConfig, PlaybackCoordinator};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;

async fn serve() -> (SocketAddr, Arc<PlaybackCoordinator>) {
    let coordinator = Arc::new(PlaybackCoordinator::new(
        Arc::new(MemorySession::new()),
        WorkflowLibrary::in_memory(),
        CoordinatorConfig::default(),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(coordinator.clone(), true);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, coordinator)
}

async fn http(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    let body = raw
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn health_and_status() {
    let (addr, _) = serve().await;

    let (status, body) = http(addr, "GET", "/api/health").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""status":"ok""#));

    let (status, body) = http(addr, "GET", "/api/status").await;
    assert_eq!(status, 200);
    assert!(body.contains(r#""state":"idle""#));
}

#[tokio::test]
async fn saved_workflows_can_be_listed_and_deleted() {
    let (addr, coordinator) = serve().await;
    let wf = Workflow::new("nightly report").unwrap();
    coordinator.library().save(&wf).await.unwrap();

    let (status, body) = http(addr, "GET", "/api/workflows").await;
    assert_eq!(status, 200);
    assert!(body.contains(&wf.id));

    let (status, _) = http(addr, "DELETE", &format!("/api/workflows/{}", wf.id)).await;
    assert_eq!(status, 204);
    let (status, body) = http(addr, "DELETE", &format!("/api/workflows/{}", wf.id)).await;
    assert_eq!(status, 404);
    assert!(body.contains("error"));
    assert!(coordinator.library().saved().await.unwrap().is_empty());
}

#[tokio::test]
async fn control_socket_drives_a_recording() {
    let (addr, coordinator) = serve().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/control"))
        .await
        .unwrap();

    socket
        .send(Message::Text(
            json!({"type": "START_RECORDING", "name": "from socket"}).to_string(),
        ))
        .await
        .unwrap();
    let started = next_json(&mut socket).await;
    assert_eq!(started["type"], "RECORDING_STARTED");
    let workflow_id = started["workflowId"].as_str().unwrap().to_string();

    socket
        .send(Message::Text(
            json!({"type": "RECORD_STEP", "step": {"type": "click", "selector": "#save"}})
                .to_string(),
        ))
        .await
        .unwrap();
    socket
        .send(Message::Text(json!({"type": "STOP_RECORDING"}).to_string()))
        .await
        .unwrap();

    let stopped = next_json(&mut socket).await;
    assert_eq!(stopped["type"], "RECORDING_STOPPED");
    assert_eq!(stopped["workflow"]["id"], workflow_id.as_str());
    assert_eq!(stopped["workflow"]["steps"][0]["selector"], "#save");

    assert_eq!(coordinator.library().saved().await.unwrap().len(), 1);
}

#[tokio::test]
async fn bad_frames_are_answered_with_an_error() {
    let (addr, _) = serve().await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/control"))
        .await
        .unwrap();

    socket
        .send(Message::Text("{\"type\":\"SELF_DESTRUCT\"}".to_string()))
        .await
        .unwrap();
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "PLAYBACK_ERROR");
    assert!(reply["message"]
        .as_str()
        .unwrap()
        .starts_with("Invalid control message"));
}
