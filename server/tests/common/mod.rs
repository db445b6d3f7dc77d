//! Shared harness: a real server on an ephemeral port and a small JSON
//! WebSocket client.
#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use pairchat_server::config::{ChatConfig, RateLimitConfig};
use pairchat_server::db::DbPool;
use pairchat_server::dm::crypto::MessageCipher;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub db: DbPool,
}

/// Start the server on a random port with default chat settings and no rate limit.
pub async fn start_test_server() -> TestServer {
    start_test_server_with(
        ChatConfig::default(),
        RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
    )
    .await
}

pub async fn start_test_server_with(chat: ChatConfig, rate_limit: RateLimitConfig) -> TestServer {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = pairchat_server::db::init_db(&data_dir).expect("Failed to init DB");
    let cipher = MessageCipher::new(&[7u8; 32]);
    let state = pairchat_server::state::AppState::new(db.clone(), cipher, chat);

    let app = pairchat_server::routes::build_router(state, &rate_limit);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    TestServer { addr, db }
}

/// Connect as `username` and return the stream plus the `initial_data` payload.
pub async fn connect(addr: SocketAddr, username: &str) -> (WsStream, Value) {
    let ws_url = format!("ws://{}/ws?username={}", addr, username);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .expect("Failed to connect");
    let initial = expect_event(&mut ws, "initial_data").await;
    (ws, initial)
}

pub async fn send_event(ws: &mut WsStream, kind: &str, payload: Value) {
    let frame = json!({"type": kind, "payload": payload}).to_string();
    ws.send(Message::Text(frame.into()))
        .await
        .expect("Failed to send event");
}

/// Next JSON event, skipping control frames.
pub async fn next_event(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Expected an event within timeout");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(text.as_str()).expect("Event is not JSON")
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("Expected text event, got: {:?}", other),
        }
    }
}

/// Next event, asserting its type; returns the payload.
pub async fn expect_event(ws: &mut WsStream, kind: &str) -> Value {
    let event = next_event(ws).await;
    assert_eq!(event["type"], kind, "unexpected event: {}", event);
    event["payload"].clone()
}

/// Assert that no text event arrives for a short while.
pub async fn expect_silence(ws: &mut WsStream) {
    loop {
        match tokio::time::timeout(Duration::from_millis(300), ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => continue,
            Ok(other) => panic!("Expected silence, got: {:?}", other),
        }
    }
}

/// Read frames until the server closes; returns the close frame.
pub async fn expect_close(ws: &mut WsStream) -> Option<CloseFrame> {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("Expected close within timeout");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            other => panic!("Expected close frame, got: {:?}", other),
        }
    }
}

/// Make `a` and `b` friends through the protocol, consuming every event it produces.
pub async fn befriend(a_ws: &mut WsStream, a: &str, b_ws: &mut WsStream, b: &str) {
    send_event(a_ws, "add_friend", json!({"friendUsername": b})).await;
    expect_event(a_ws, "info").await;
    let request = expect_event(b_ws, "new_friend_request").await;
    assert_eq!(request["username"], a);

    send_event(b_ws, "accept_friend", json!({"friendUsername": a})).await;
    assert_eq!(expect_event(b_ws, "friend_added").await["username"], a);
    assert_eq!(expect_event(a_ws, "friend_added").await["username"], b);
}
