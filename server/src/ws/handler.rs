use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::friends::validate_username;
use crate::state::AppState;
use crate::ws::{actor, CLOSE_INVALID_USERNAME};

/// Query parameters for WebSocket connection. The username is the identity.
#[derive(Debug, Deserialize)]
pub struct WsConnectQuery {
    #[serde(default)]
    pub username: String,
}

/// GET /ws?username=NAME
/// On an invalid username, upgrades then immediately closes with 4000.
/// Otherwise spawns an actor for the connection.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsConnectQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !validate_username(&params.username) {
        tracing::warn!(
            username = %params.username,
            close_code = CLOSE_INVALID_USERNAME,
            "WebSocket connection rejected"
        );
        return ws.on_upgrade(|mut socket| async move {
            let close_frame = CloseFrame {
                code: CLOSE_INVALID_USERNAME,
                reason: "Invalid username".into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
        });
    }

    tracing::info!(username = %params.username, "WebSocket connection accepted");
    ws.on_upgrade(move |socket| handle_connection(socket, state, params.username))
}

async fn handle_connection(socket: WebSocket, state: AppState, username: String) {
    actor::run_connection(socket, state, username).await;
}
