use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::dispatch::{self, Flow};
use crate::ws::protocol::ServerEvent;
use crate::ws::registry::Connection;

/// How long queued frames may take to flush once the connection is closing.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the actor-per-connection pattern for one device of `username`.
///
/// - Writer task: owns the sink, drains the bounded outbound queue
/// - Processor task: handles client events one at a time, in arrival order
/// - Ping task: keepalive, closes the connection when pongs stop arriving
/// - Reader loop (this task): feeds text frames to the processor
pub async fn run_connection(socket: WebSocket, state: AppState, username: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Register before the online write so a concurrent last-device
    // disconnect sees this device and leaves the flag alone
    let (tx, rx) = mpsc::channel::<Message>(state.chat.outbound_queue.max(1));
    let (conn, first_device) = state.connections.register(&username, tx.clone());

    let graph = state.friends.clone();
    let user = username.clone();
    let initial = match tokio::task::spawn_blocking(move || graph.connect(&user)).await {
        Ok(Ok(initial)) => initial,
        Ok(Err(e)) => {
            tracing::error!(username = %username, error = %e, "Failed to load user on connect");
            disconnect(&state, &username, &conn).await;
            close_with(&mut ws_sender, 1011, "server error").await;
            return;
        }
        Err(e) => {
            tracing::error!(username = %username, error = %e, "Connect task failed");
            disconnect(&state, &username, &conn).await;
            close_with(&mut ws_sender, 1011, "server error").await;
            return;
        }
    };
    conn.send(&ServerEvent::InitialData(initial));

    tracing::info!(
        username = %username,
        connection_id = %conn.id(),
        first_device,
        devices = state.connections.connection_count(&username),
        "WebSocket actor started"
    );

    let mut writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Inbound events are processed sequentially by a dedicated task
    let (in_tx, mut in_rx) = mpsc::channel::<String>(state.chat.inbound_queue.max(1));
    let mut processor_handle = {
        let state = state.clone();
        let conn = conn.clone();
        let username = username.clone();
        tokio::spawn(async move {
            while let Some(text) = in_rx.recv().await {
                if dispatch::handle_text_message(&text, &conn, &username, &state).await == Flow::Stop {
                    break;
                }
            }
        })
    };

    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();
    let ping_interval = Duration::from_secs(state.chat.ping_interval_secs.max(1));
    let pong_timeout = Duration::from_secs(state.chat.pong_timeout_secs.max(1));
    let ping_tx = tx.clone();
    let mut ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).await.is_err() {
                // Writer task has died, connection is gone
                break;
            }

            match timeout(pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {}
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: 1001,
                            reason: "Pong timeout".into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(text.as_str().to_owned()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    conn.send(&ServerEvent::error("binary frames are not supported"));
                }
                Some(Ok(Message::Pong(_))) => {
                    let _ = pong_tx.send(());
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.try_send(Message::Pong(data));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(
                        username = %username,
                        reason = ?frame,
                        "Client initiated close"
                    );
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!(
                        username = %username,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    tracing::info!(username = %username, "WebSocket stream ended");
                    break;
                }
            },
            _ = &mut processor_handle => {
                // Account deleted; the close frame is already queued
                break;
            }
            _ = &mut ping_handle => {
                break;
            }
        }
    }

    // Cleanup: events already queued still run, their replies go nowhere
    ping_handle.abort();
    drop(in_tx);
    drop(tx);

    let connection_id = conn.id();
    let offline = disconnect(&state, &username, &conn).await;
    drop(conn);

    // The writer exits once every sender is gone and the queue is flushed
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer_handle).await.is_err() {
        writer_handle.abort();
    }

    tracing::info!(
        username = %username,
        connection_id = %connection_id,
        last_device = offline,
        "WebSocket actor stopped"
    );
}

/// Unregister one device and, when it was the last one, clear the online
/// flag unless another device has registered in the meantime. Returns true
/// when the user had no devices left.
async fn disconnect(state: &AppState, username: &str, conn: &Connection) -> bool {
    let offline = state.connections.unregister(username, conn.id());
    if !offline {
        return false;
    }

    let graph = state.friends.clone();
    let registry = state.connections.clone();
    let user = username.to_string();
    let result = tokio::task::spawn_blocking(move || {
        graph.set_offline(&user, || !registry.is_online(&user))
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(username = %username, error = %e, "Failed to mark user offline")
        }
        Err(e) => tracing::error!(username = %username, error = %e, "Offline task failed"),
    }
    true
}

async fn close_with(
    ws_sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &'static str,
) {
    let _ = ws_sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Writer task: forwards queued frames to the WebSocket sink. Stops after a
/// close frame or when the sink fails.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
        if closing {
            break;
        }
    }
}
