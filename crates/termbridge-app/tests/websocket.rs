mod common;

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pretty_assertions::assert_eq;
use serde_json::Value;
use termbridge::terminal::BackendError;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const IDLE: Duration = Duration::from_secs(60);

async fn connect(addr: SocketAddr, path: &str) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
    socket
}

/// Next text frame as JSON, skipping control frames
async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("no message in time")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_unsubscribed(server: &termbridge::web::WebServer) {
    let manager = server.manager();
    timeout(Duration::from_secs(2), async {
        while manager.active_subscriptions() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscription still active");
}

#[tokio::test]
async fn test_directory_pushes_list_on_connect() {
    let server = common::server(common::backend(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals").await;
    let message = next_json(&mut socket).await;

    assert_eq!(message["type"], "terminals");
    let ids: Vec<&str> = message["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["%0", "%1"]);
}

#[tokio::test]
async fn test_directory_pushes_on_client_message() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals").await;
    next_json(&mut socket).await;

    backend.remove_session("%0");
    socket.send(Message::Text("refresh".into())).await.unwrap();

    let message = next_json(&mut socket).await;
    let sessions = message["data"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], "%1");
}

#[tokio::test]
async fn test_directory_pushes_after_idle_period() {
    let server = common::server(common::backend(), Duration::from_millis(200));
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals").await;
    next_json(&mut socket).await;

    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "terminals");
}

#[tokio::test]
async fn test_directory_reports_errors_and_stays_open() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals").await;
    next_json(&mut socket).await;

    backend.set_reachable(false);
    socket.send(Message::Text("refresh".into())).await.unwrap();
    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "error");
    assert!(message["data"]["message"].is_string());

    backend.set_reachable(true);
    socket.send(Message::Text("refresh".into())).await.unwrap();
    let message = next_json(&mut socket).await;
    assert_eq!(message["type"], "terminals");
}

#[tokio::test]
async fn test_terminal_stream_forwards_output() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;
    assert!(server.manager().is_subscribed("%1"));

    backend.push_screen("%1", &["$ echo hi", "hi", "$ "]);

    let event = next_json(&mut socket).await;
    assert_eq!(event["terminal_id"], "%1");
    assert_eq!(event["event_type"], "output");
    assert_eq!(event["data"]["content"], "$ echo hi\nhi\n$ ");
    assert_eq!(event["data"]["cursor"]["x"], 2);
    assert_eq!(event["data"]["cursor"]["y"], 2);
}

#[tokio::test]
async fn test_terminal_stream_stops_when_client_leaves() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    socket.close(None).await.unwrap();

    backend.wait_for_closed_streams(1).await;
    wait_for_unsubscribed(&server).await;
}

#[tokio::test]
async fn test_second_listener_sees_already_streaming() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut first = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    let mut second = connect(addr, "/ws/terminals/%251").await;
    let event = next_json(&mut second).await;
    assert_eq!(event["event_type"], "status");
    assert_eq!(event["data"]["state"], "already_streaming");

    // Leaving must not tear down the stream the first connection owns
    second.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.manager().is_subscribed("%1"));

    backend.push_screen("%1", &["still here"]);
    let event = next_json(&mut first).await;
    assert_eq!(event["event_type"], "output");
    assert_eq!(event["data"]["content"], "still here");
    assert_eq!(backend.streams_opened(), 1);
}

#[tokio::test]
async fn test_stale_owner_leaving_keeps_new_subscription() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut first = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;
    backend.fail_stream("%1", BackendError::Rejected("capture failed".to_string()));
    assert_eq!(next_json(&mut first).await["event_type"], "closed");
    wait_for_unsubscribed(&server).await;

    // The first socket stays open while a second one takes over the session
    let mut second = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(2).await;
    assert!(server.manager().is_subscribed("%1"));

    first.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.manager().is_subscribed("%1"));
    assert_eq!(backend.streams_closed(), 1);

    backend.push_screen("%1", &["second owner"]);
    let event = next_json(&mut second).await;
    assert_eq!(event["event_type"], "output");
    assert_eq!(event["data"]["content"], "second owner");
}

#[tokio::test]
async fn test_waiting_listener_told_when_owner_leaves() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut owner = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    let mut waiting = connect(addr, "/ws/terminals/%251").await;
    assert_eq!(next_json(&mut waiting).await["data"]["state"], "already_streaming");

    owner.close(None).await.unwrap();

    let event = next_json(&mut waiting).await;
    assert_eq!(event["terminal_id"], "%1");
    assert_eq!(event["event_type"], "closed");
    assert_eq!(event["data"]["reason"], "stream ended");
    wait_for_unsubscribed(&server).await;
}

#[tokio::test]
async fn test_waiting_listener_told_when_stream_fails() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut owner = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    let mut waiting = connect(addr, "/ws/terminals/%251").await;
    assert_eq!(next_json(&mut waiting).await["event_type"], "status");

    backend.fail_stream("%1", BackendError::NotFound("pane closed".to_string()));

    assert_eq!(next_json(&mut owner).await["event_type"], "closed");
    assert_eq!(next_json(&mut waiting).await["event_type"], "closed");
}

#[tokio::test]
async fn test_unknown_terminal_gets_closed_event() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals/%2599").await;
    let event = next_json(&mut socket).await;

    assert_eq!(event["terminal_id"], "%99");
    assert_eq!(event["event_type"], "closed");
    assert!(event["data"]["reason"].is_string());
    assert_eq!(backend.streams_opened(), 0);
}

#[tokio::test]
async fn test_stream_failure_closes_subscription() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let mut socket = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    backend.fail_stream("%1", BackendError::NotFound("pane closed".to_string()));

    let event = next_json(&mut socket).await;
    assert_eq!(event["event_type"], "closed");
    wait_for_unsubscribed(&server).await;
}

#[tokio::test]
async fn test_shutdown_stops_streams() {
    let backend = common::backend();
    let server = common::server(backend.clone(), IDLE);
    let addr = common::spawn(&server).await;

    let _socket = connect(addr, "/ws/terminals/%251").await;
    backend.wait_for_open_streams(1).await;

    server.manager().shutdown().await;

    assert_eq!(server.manager().active_subscriptions(), 0);
    assert_eq!(backend.streams_closed(), 1);
    assert!(!server.manager().is_connected());
}
