//! Integration tests for WebSocket connection lifecycle, protocol errors,
//! keepalive and rate limiting.

mod common;

use common::*;
use futures_util::{SinkExt, StreamExt};
use pairchat_server::config::{ChatConfig, RateLimitConfig};
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn test_health_check() {
    let server = start_test_server().await;
    let body = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}

#[tokio::test]
async fn test_connect_sends_initial_data() {
    let server = start_test_server().await;
    let (_ws, initial) = connect(server.addr, "alice").await;
    assert_eq!(initial, json!({"friends": [], "requests": []}));
}

#[tokio::test]
async fn test_invalid_username_closes_with_4000() {
    let server = start_test_server().await;
    for bad in ["", "a-b", "has%20space"] {
        let ws_url = format!("ws://{}/ws?username={}", server.addr, bad);
        let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
            .await
            .expect("Upgrade should succeed before the close");
        let frame = expect_close(&mut ws).await.expect("close frame");
        assert_eq!(u16::from(frame.code), 4000, "username {:?}", bad);
    }

    let ws_url = format!("ws://{}/ws", server.addr);
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let frame = expect_close(&mut ws).await.expect("close frame");
    assert_eq!(u16::from(frame.code), 4000);
}

#[tokio::test]
async fn test_ping_event_gets_pong() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(server.addr, "alice").await;

    send_event(&mut ws, "ping", json!({})).await;
    assert_eq!(expect_event(&mut ws, "pong").await, json!({}));

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    expect_event(&mut ws, "pong").await;
}

#[tokio::test]
async fn test_ws_ping_frame_gets_pong_frame() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(server.addr, "alice").await;

    ws.send(Message::Ping(vec![42, 43, 44].into())).await.unwrap();
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("Expected pong within timeout");
    match msg {
        Some(Ok(Message::Pong(data))) => assert_eq!(data.as_ref(), &[42, 43, 44]),
        other => panic!("Expected Pong message, got: {:?}", other),
    }
}

#[tokio::test]
async fn test_unknown_type_and_malformed_frames_get_errors() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(server.addr, "alice").await;

    send_event(&mut ws, "typing", json!({})).await;
    assert_eq!(
        expect_event(&mut ws, "error").await["message"],
        "unknown event type: typing"
    );

    ws.send(Message::Text("not json".into())).await.unwrap();
    expect_event(&mut ws, "error").await;

    ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
    expect_event(&mut ws, "error").await;

    // The connection is still usable afterwards
    send_event(&mut ws, "ping", json!({})).await;
    expect_event(&mut ws, "pong").await;
}

#[tokio::test]
async fn test_events_are_processed_in_order() {
    let server = start_test_server().await;
    let (mut ws, _) = connect(server.addr, "alice").await;

    for _ in 0..5 {
        send_event(&mut ws, "ping", json!({})).await;
        send_event(&mut ws, "add_friend", json!({"friendUsername": "ghost"})).await;
    }
    for _ in 0..5 {
        expect_event(&mut ws, "pong").await;
        expect_event(&mut ws, "error").await;
    }
}

#[tokio::test]
async fn test_multi_device_fanout_and_presence() {
    let server = start_test_server().await;
    let (mut alice1, _) = connect(server.addr, "alice").await;
    let (mut alice2, _) = connect(server.addr, "alice").await;
    let (mut bob, _) = connect(server.addr, "bob").await;

    send_event(&mut bob, "add_friend", json!({"friendUsername": "alice"})).await;
    expect_event(&mut bob, "info").await;
    for device in [&mut alice1, &mut alice2] {
        assert_eq!(
            expect_event(device, "new_friend_request").await["username"],
            "bob"
        );
    }

    // A device that connects later sees the pending request in its snapshot
    let (_alice3, initial) = connect(server.addr, "alice").await;
    assert_eq!(initial["requests"], json!(["bob"]));
}

#[tokio::test]
async fn test_disconnect_of_one_device_keeps_user_reachable() {
    let server = start_test_server().await;
    let (alice1, _) = connect(server.addr, "alice").await;
    let (mut alice2, _) = connect(server.addr, "alice").await;
    let (mut bob, _) = connect(server.addr, "bob").await;

    drop(alice1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_event(&mut bob, "add_friend", json!({"friendUsername": "alice"})).await;
    expect_event(&mut bob, "info").await;
    expect_event(&mut alice2, "new_friend_request").await;
}

#[tokio::test]
async fn test_silent_client_is_closed_after_pong_timeout() {
    let server = start_test_server_with(
        ChatConfig {
            ping_interval_secs: 1,
            pong_timeout_secs: 1,
            ..ChatConfig::default()
        },
        RateLimitConfig {
            enabled: false,
            ..RateLimitConfig::default()
        },
    )
    .await;

    let (mut ws, _) = connect(server.addr, "alice").await;

    // The client only answers pings while reading, so stay idle past the deadline
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let mut saw_close = false;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        if let Message::Close(Some(frame)) = msg {
            assert_eq!(u16::from(frame.code), 1001);
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "server should close an unresponsive connection");
}

#[tokio::test]
async fn test_rate_limit_rejects_burst() {
    let server = start_test_server_with(
        ChatConfig::default(),
        RateLimitConfig {
            enabled: true,
            per_second: 60,
            burst_size: 2,
        },
    )
    .await;

    let ws_url = format!("ws://{}/ws?username=alice", server.addr);
    let _first = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let _second = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    assert!(tokio_tungstenite::connect_async(&ws_url).await.is_err());
}
