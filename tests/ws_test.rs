//! Integration tests for WebSocket handshake, ping/pong, fan-out, and the
//! ingest surface.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use chorus_hub::state::{AppState, HubSettings};

type WsRead = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
>;
type WsWrite = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

fn test_settings() -> HubSettings {
    HubSettings {
        queue_capacity: 64,
        offline_grace: Duration::from_millis(150),
        ping_interval: Duration::from_secs(30),
        pong_timeout: Duration::from_secs(10),
        dedup_window: Duration::from_secs(300),
        dedup_max_entries: 1024,
        upstream_timeout: Duration::from_millis(500),
        max_conns_per_user: 8,
        ticket_ttl: Duration::from_secs(60),
    }
}

/// Start the hub on a random port and return (base_url, addr).
async fn start_test_server() -> (String, SocketAddr) {
    start_server_with(test_settings()).await
}

async fn start_server_with(settings: HubSettings) -> (String, SocketAddr) {
    let state = AppState::build(settings);
    let app = chorus_hub::routes::build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), addr)
}

async fn issue_ticket(base_url: &str, user_id: u64) -> String {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/tickets", base_url))
        .json(&json!({ "user_id": user_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["ticket"].as_str().unwrap().to_string()
}

async fn seed_conversation(base_url: &str, conversation_id: u64, participants: &[u64]) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/conversations", base_url))
        .json(&json!({
            "conversation_id": conversation_id,
            "participants": participants,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
}

/// Connect a user: issues a fresh single-use ticket and upgrades.
async fn connect_user(base_url: &str, addr: SocketAddr, user_id: u64) -> (WsWrite, WsRead) {
    let ticket = issue_ticket(base_url, user_id).await;
    let ws_url = format!("ws://{}/ws?ticket={}", addr, ticket);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream.split()
}

/// Read frames until an event with the wanted `type` arrives, skipping
/// everything else (connected_users snapshot, presence churn, ...).
async fn expect_event(read: &mut WsRead, wanted: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = tokio::time::timeout(remaining, read.next())
            .await
            .unwrap_or_else(|_| panic!("Timed out waiting for '{}' event", wanted))
            .expect("Stream ended")
            .expect("WebSocket error");
        if let Message::Text(text) = msg {
            let event: serde_json::Value = serde_json::from_str(&text).unwrap();
            if event["type"] == wanted {
                return event;
            }
        }
    }
}

/// Assert that no event of the given type arrives within the window.
async fn expect_no_event(read: &mut WsRead, unwanted: &str, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, read.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                let event: serde_json::Value = serde_json::from_str(&text).unwrap();
                assert_ne!(event["type"], unwanted, "Got unwanted event: {}", event);
            }
            Ok(Some(Ok(_))) => continue,
            _ => break,
        }
    }
}

async fn send_action(write: &mut WsWrite, action: serde_json::Value) {
    write
        .send(Message::Text(action.to_string().into()))
        .await
        .expect("Failed to send action");
}

#[tokio::test]
async fn connect_receives_online_snapshot() {
    let (base_url, addr) = start_test_server().await;
    let (_write, mut read) = connect_user(&base_url, addr, 1).await;

    let snapshot = expect_event(&mut read, "connected_users").await;
    assert!(snapshot["user_ids"].is_array());
}

#[tokio::test]
async fn invalid_ticket_closes_with_4002() {
    let (_base_url, addr) = start_test_server().await;

    let ws_url = format!("ws://{}/ws?ticket=not-a-ticket", addr);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("WebSocket should upgrade even with a bad ticket");
    let (mut _write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4002, "Expected ticket-invalid close code");
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn ticket_reuse_closes_with_4002() {
    let (base_url, addr) = start_test_server().await;
    let ticket = issue_ticket(&base_url, 1).await;
    let ws_url = format!("ws://{}/ws?ticket={}", addr, ticket);

    // First use succeeds.
    let (first, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let (_w1, mut r1) = first.split();
    expect_event(&mut r1, "connected_users").await;

    // Replay of the same ticket is refused.
    let (second, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let (mut _w2, mut r2) = second.split();
    let msg = tokio::time::timeout(Duration::from_secs(2), r2.next())
        .await
        .expect("Expected close within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4002);
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn expired_ticket_closes_with_4001() {
    let mut settings = test_settings();
    settings.ticket_ttl = Duration::from_millis(100);
    let (base_url, addr) = start_server_with(settings).await;

    let ticket = issue_ticket(&base_url, 1).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let ws_url = format!("ws://{}/ws?ticket={}", addr, ticket);
    let (ws_stream, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let (mut _write, mut read) = ws_stream.split();

    let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Expected close within timeout");
    match msg {
        Some(Ok(Message::Close(Some(frame)))) => {
            assert_eq!(u16::from(frame.code), 4001, "Expected ticket-expired close code");
        }
        other => panic!("Expected close frame, got: {:?}", other),
    }
}

#[tokio::test]
async fn client_ping_gets_pong() {
    let (base_url, addr) = start_test_server().await;
    let (mut write, mut read) = connect_user(&base_url, addr, 1).await;
    expect_event(&mut read, "connected_users").await;

    write
        .send(Message::Ping(vec![42, 43, 44].into()))
        .await
        .expect("Failed to send ping");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let msg = tokio::time::timeout(remaining, read.next())
            .await
            .expect("Expected pong within timeout");
        if let Some(Ok(Message::Pong(data))) = msg {
            assert_eq!(data.as_ref(), &[42, 43, 44]);
            break;
        }
    }
}

#[tokio::test]
async fn message_fans_out_to_joined_members_only() {
    let (base_url, addr) = start_test_server().await;
    seed_conversation(&base_url, 10, &[1, 2]).await;

    let (mut write_a, mut read_a) = connect_user(&base_url, addr, 1).await;
    let (mut write_b, mut read_b) = connect_user(&base_url, addr, 2).await;
    let (_write_c, mut read_c) = connect_user(&base_url, addr, 3).await;

    send_action(&mut write_a, json!({ "type": "join", "conversation_id": 10 })).await;
    expect_event(&mut read_a, "joined").await;
    send_action(&mut write_b, json!({ "type": "join", "conversation_id": 10 })).await;
    expect_event(&mut read_b, "joined").await;

    send_action(
        &mut write_a,
        json!({ "type": "message", "conversation_id": 10, "content": "hello" }),
    )
    .await;

    let received = expect_event(&mut read_b, "message").await;
    assert_eq!(received["message"]["content"], "hello");
    assert_eq!(received["message"]["sender_id"], 1);

    // Sender's own connection gets the canonical copy too.
    let echo = expect_event(&mut read_a, "message").await;
    assert_eq!(echo["message"]["content"], "hello");

    // User 3 is not a participant and never joined: nothing arrives.
    expect_no_event(&mut read_c, "message", Duration::from_millis(400)).await;
}

#[tokio::test]
async fn both_tabs_of_a_user_receive_the_message() {
    let (base_url, addr) = start_test_server().await;
    seed_conversation(&base_url, 10, &[1]).await;

    let (mut write_tab1, mut read_tab1) = connect_user(&base_url, addr, 1).await;
    let (_write_tab2, mut read_tab2) = connect_user(&base_url, addr, 1).await;

    send_action(&mut write_tab1, json!({ "type": "join", "conversation_id": 10 })).await;
    expect_event(&mut read_tab1, "joined").await;

    send_action(
        &mut write_tab1,
        json!({ "type": "message", "conversation_id": 10, "content": "two tabs" }),
    )
    .await;

    let m1 = expect_event(&mut read_tab1, "message").await;
    let m2 = expect_event(&mut read_tab2, "message").await;
    assert_eq!(m1["message"]["content"], "two tabs");
    assert_eq!(m2["message"]["content"], "two tabs");
}

#[tokio::test]
async fn typing_reaches_durable_participants_without_runtime_join() {
    let (base_url, addr) = start_test_server().await;
    seed_conversation(&base_url, 20, &[1, 2]).await;

    let (mut write_a, mut read_a) = connect_user(&base_url, addr, 1).await;
    let (_write_b, mut read_b) = connect_user(&base_url, addr, 2).await;
    expect_event(&mut read_a, "connected_users").await;
    expect_event(&mut read_b, "connected_users").await;

    send_action(
        &mut write_a,
        json!({ "type": "typing", "conversation_id": 20, "is_typing": true }),
    )
    .await;

    let typing = expect_event(&mut read_b, "typing").await;
    assert_eq!(typing["user_id"], 1);
    assert_eq!(typing["is_typing"], true);
}

#[tokio::test]
async fn ingested_message_is_delivered_once_despite_double_post() {
    let (base_url, addr) = start_test_server().await;
    seed_conversation(&base_url, 30, &[1]).await;

    let (mut write, mut read) = connect_user(&base_url, addr, 1).await;
    send_action(&mut write, json!({ "type": "join", "conversation_id": 30 })).await;
    expect_event(&mut read, "joined").await;

    let stored = json!({
        "id": 555,
        "conversation_id": 30,
        "sender_id": 2,
        "content": "from the store",
        "sent_at": "2026-08-29T12:00:00Z",
    });
    let client = reqwest::Client::new();
    for _ in 0..2 {
        let resp = client
            .post(format!("{}/api/ingest/message", base_url))
            .json(&stored)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
    }

    let received = expect_event(&mut read, "message").await;
    assert_eq!(received["message"]["id"], 555);
    expect_no_event(&mut read, "message", Duration::from_millis(400)).await;
}

#[tokio::test]
async fn presence_transitions_are_broadcast_once() {
    let (base_url, addr) = start_test_server().await;

    let (_write_a, mut read_a) = connect_user(&base_url, addr, 1).await;
    expect_event(&mut read_a, "connected_users").await;

    // User 2 comes online: user 1 sees exactly one transition.
    let (mut write_b, _read_b) = connect_user(&base_url, addr, 2).await;
    let online = expect_event(&mut read_a, "presence").await;
    assert_eq!(online["user_id"], 2);
    assert_eq!(online["status"], "online");

    // User 2 hangs up: offline arrives after the grace delay, once.
    write_b.send(Message::Close(None)).await.unwrap();
    let offline = expect_event(&mut read_a, "presence").await;
    assert_eq!(offline["user_id"], 2);
    assert_eq!(offline["status"], "offline");
    expect_no_event(&mut read_a, "presence", Duration::from_millis(400)).await;
}

#[tokio::test]
async fn reconnect_within_grace_suppresses_offline_broadcast() {
    let (base_url, addr) = start_test_server().await;

    let (_write_a, mut read_a) = connect_user(&base_url, addr, 1).await;
    expect_event(&mut read_a, "connected_users").await;

    let (mut write_b, _read_b) = connect_user(&base_url, addr, 2).await;
    expect_event(&mut read_a, "presence").await;

    // Flicker: drop and come right back inside the grace window.
    write_b.send(Message::Close(None)).await.unwrap();
    let (_write_b2, _read_b2) = connect_user(&base_url, addr, 2).await;

    expect_no_event(&mut read_a, "presence", Duration::from_millis(500)).await;
}

#[tokio::test]
async fn presence_endpoint_reflects_connections() {
    let (base_url, addr) = start_test_server().await;
    let client = reqwest::Client::new();

    let (_write, mut read) = connect_user(&base_url, addr, 7).await;
    expect_event(&mut read, "connected_users").await;

    let body: serde_json::Value = client
        .get(format!("{}/api/presence", base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["user_ids"], json!([7]));
}

#[tokio::test]
async fn malformed_frame_does_not_kill_the_session() {
    let (base_url, addr) = start_test_server().await;
    seed_conversation(&base_url, 40, &[1]).await;

    let (mut write, mut read) = connect_user(&base_url, addr, 1).await;
    expect_event(&mut read, "connected_users").await;

    send_action(&mut write, json!({ "type": "teleport", "x": 1 })).await;
    write
        .send(Message::Text("not json at all".into()))
        .await
        .unwrap();

    // Session still works after two garbage frames.
    send_action(&mut write, json!({ "type": "join", "conversation_id": 40 })).await;
    expect_event(&mut read, "joined").await;
}
