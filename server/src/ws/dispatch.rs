//! Routes parsed client events to the friend graph and conversation store,
//! then fans the results out through the connection registry.

use crate::dm::conversations::ConversationId;
use crate::dm::messages::{MessageError, RecallOutcome};
use crate::friends::{validate_username, FriendError};
use crate::state::AppState;
use crate::ws::protocol::{ClientEvent, NewMessage, ServerEvent};
use crate::ws::registry::Connection;
use crate::ws::CLOSE_ACCOUNT_DELETED;

/// Shown to the client for failures that are not its fault.
pub const GENERIC_FAILURE: &str = "operation failed, please retry";

/// Whether the connection should keep processing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Friend(#[from] FriendError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DispatchError {
    pub fn is_validation(&self) -> bool {
        match self {
            Self::Friend(e) => e.is_validation(),
            Self::Message(e) => e.is_validation(),
            Self::Join(_) => false,
        }
    }

    /// Text for the `error` event sent back to the originating connection.
    pub fn client_message(&self) -> String {
        if self.is_validation() {
            self.to_string()
        } else {
            GENERIC_FAILURE.to_string()
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, DispatchError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, DispatchError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

/// Handle one text frame from `conn`. Every failure ends up as a single
/// `error` event on the originating connection.
pub async fn handle_text_message(
    text: &str,
    conn: &Connection,
    username: &str,
    state: &AppState,
) -> Flow {
    let event = match ClientEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(username = %username, error = %e, "Rejected client event");
            conn.send(&ServerEvent::error(e.to_string()));
            return Flow::Continue;
        }
    };

    let kind = event.kind();
    match dispatch_event(event, conn, username, state).await {
        Ok(flow) => flow,
        Err(e) => {
            if e.is_validation() {
                tracing::debug!(username = %username, event = kind, error = %e, "Event rejected");
            } else if matches!(e, DispatchError::Friend(FriendError::TransactionConflict)) {
                tracing::warn!(username = %username, event = kind, error = %e, "Event failed");
            } else {
                tracing::error!(username = %username, event = kind, error = %e, "Event failed");
            }
            conn.send(&ServerEvent::error(e.client_message()));
            Flow::Continue
        }
    }
}

pub async fn dispatch_event(
    event: ClientEvent,
    conn: &Connection,
    username: &str,
    state: &AppState,
) -> Result<Flow, DispatchError> {
    match event {
        ClientEvent::GetHistory { conversation_id } => {
            get_history(conversation_id, conn, username, state).await?
        }
        ClientEvent::SendMessage {
            conversation_id,
            content,
        } => send_message(conversation_id, content, username, state).await?,
        ClientEvent::RecallMessage {
            conversation_id,
            message_id,
        } => recall_message(conversation_id, message_id, username, state).await?,
        ClientEvent::AddFriend { friend_username } => {
            add_friend(friend_username, conn, username, state).await?
        }
        ClientEvent::AcceptFriend { friend_username } => {
            accept_friend(friend_username, username, state).await?
        }
        ClientEvent::DeleteFriend { friend_username } => {
            delete_friend(friend_username, username, state).await?
        }
        ClientEvent::DeleteAccount => {
            delete_account(username, state).await?;
            return Ok(Flow::Stop);
        }
        ClientEvent::Ping => {
            conn.send(&ServerEvent::Pong {});
        }
    }
    Ok(Flow::Continue)
}

fn require_participant(conversation: &ConversationId, username: &str) -> Result<(), DispatchError> {
    if conversation.includes(username) {
        Ok(())
    } else {
        Err(MessageError::NotParticipant.into())
    }
}

fn require_username(name: &str) -> Result<(), DispatchError> {
    if validate_username(name) {
        Ok(())
    } else {
        Err(FriendError::InvalidUsername.into())
    }
}

async fn get_history(
    conversation: ConversationId,
    conn: &Connection,
    username: &str,
    state: &AppState,
) -> Result<(), DispatchError> {
    require_participant(&conversation, username)?;

    let store = state.conversations.clone();
    let limit = state.chat.history_limit;
    let conv = conversation.clone();
    let messages = blocking(move || Ok(store.history(&conv, limit)?)).await?;

    conn.send(&ServerEvent::History {
        conversation_id: conversation,
        messages,
    });
    Ok(())
}

async fn send_message(
    conversation: ConversationId,
    content: String,
    username: &str,
    state: &AppState,
) -> Result<(), DispatchError> {
    require_participant(&conversation, username)?;
    let peer = conversation
        .peer_of(username)
        .ok_or(MessageError::NotParticipant)?
        .to_string();

    let friends = state.friends.clone();
    let store = state.conversations.clone();
    let sender = username.to_string();
    let recipient = peer.clone();
    let (record, plaintext) = blocking(move || {
        if !friends.are_friends(&sender, &recipient)? {
            return Err(MessageError::NotFriends.into());
        }
        Ok(store.append(&conversation, &sender, &content)?)
    })
    .await?;

    state
        .connections
        .fanout(&peer, &ServerEvent::NewMessage(NewMessage::new(&record, &plaintext, false)));
    state.connections.fanout(
        username,
        &ServerEvent::NewMessage(NewMessage::new(&record, &plaintext, true)),
    );
    Ok(())
}

async fn recall_message(
    conversation: ConversationId,
    message_id: String,
    username: &str,
    state: &AppState,
) -> Result<(), DispatchError> {
    require_participant(&conversation, username)?;

    let store = state.conversations.clone();
    let window = state.chat.recall_window_ms;
    let acting = username.to_string();
    let conv = conversation.clone();
    let outcome =
        blocking(move || Ok(store.recall(&conv, &message_id, &acting, window)?)).await?;

    match outcome {
        RecallOutcome::Recalled(notice) => {
            let (a, b) = conversation.participants();
            let event = ServerEvent::RecalledMessage(notice);
            state.connections.fanout(a, &event);
            state.connections.fanout(b, &event);
        }
        RecallOutcome::NotFoundOrExpired => {
            tracing::debug!(username = %username, conversation = %conversation, "Recall ignored");
        }
    }
    Ok(())
}

async fn add_friend(
    friend: String,
    conn: &Connection,
    username: &str,
    state: &AppState,
) -> Result<(), DispatchError> {
    require_username(&friend)?;

    let graph = state.friends.clone();
    let from = username.to_string();
    let to = friend.clone();
    let created = blocking(move || Ok(graph.add_request(&from, &to)?)).await?;

    if created {
        state.connections.fanout(
            &friend,
            &ServerEvent::NewFriendRequest {
                username: username.to_string(),
            },
        );
    }
    conn.send(&ServerEvent::info("friend request sent"));
    Ok(())
}

async fn accept_friend(friend: String, username: &str, state: &AppState) -> Result<(), DispatchError> {
    require_username(&friend)?;

    let graph = state.friends.clone();
    let accepter = username.to_string();
    let requester = friend.clone();
    blocking(move || Ok(graph.accept_request(&accepter, &requester)?)).await?;

    state.connections.fanout(
        username,
        &ServerEvent::FriendAdded {
            username: friend.clone(),
        },
    );
    state.connections.fanout(
        &friend,
        &ServerEvent::FriendAdded {
            username: username.to_string(),
        },
    );
    Ok(())
}

async fn delete_friend(friend: String, username: &str, state: &AppState) -> Result<(), DispatchError> {
    require_username(&friend)?;

    let graph = state.friends.clone();
    let user = username.to_string();
    let other = friend.clone();
    blocking(move || Ok(graph.delete_friend(&user, &other)?)).await?;

    state.connections.fanout(
        username,
        &ServerEvent::FriendDeleted {
            username: friend.clone(),
        },
    );
    state.connections.fanout(
        &friend,
        &ServerEvent::FriendDeleted {
            username: username.to_string(),
        },
    );
    Ok(())
}

async fn delete_account(username: &str, state: &AppState) -> Result<(), DispatchError> {
    let graph = state.friends.clone();
    let user = username.to_string();
    let former_friends = blocking(move || Ok(graph.delete_account(&user)?)).await?;

    let notice = ServerEvent::FriendDeleted {
        username: username.to_string(),
    };
    for friend in &former_friends {
        state.connections.fanout(friend, &notice);
    }
    state
        .connections
        .fanout(username, &ServerEvent::AccountDeleted {});
    state
        .connections
        .close_user(username, CLOSE_ACCOUNT_DELETED, "account deleted");
    Ok(())
}
