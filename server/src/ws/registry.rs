use axum::extract::ws::{CloseFrame, Message};
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::ws::protocol::ServerEvent;

/// Sender half of a connection's bounded outbound queue. The writer task owns
/// the receiver.
pub type ConnectionSender = mpsc::Sender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize server event");
            None
        }
    }
}

/// One live device connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: ConnectionSender,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue an event for this connection only. Never waits.
    pub fn send(&self, event: &ServerEvent) -> bool {
        match encode(event) {
            Some(msg) => matches!(self.deliver(msg), Delivery::Sent),
            None => false,
        }
    }

    fn deliver(&self, msg: Message) -> Delivery {
        match self.sender.try_send(msg) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %self.id, "Outbound queue full, dropping event");
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Live connections per username. A user can have several devices online at
/// once; every fanout reaches all of them.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Vec<Connection>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device connection. The flag is true when this is the user's only
    /// connection, i.e. the user just came online.
    pub fn register(&self, username: &str, sender: ConnectionSender) -> (Connection, bool) {
        let connection = Connection {
            id: ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            sender,
        };
        let mut devices = self.connections.entry(username.to_string()).or_default();
        devices.push(connection.clone());
        let first = devices.len() == 1;

        tracing::debug!(
            username = %username,
            connection_id = %connection.id,
            connections = devices.len(),
            "Connection registered"
        );
        (connection, first)
    }

    /// Remove a device connection. Returns true when the user has no live
    /// connections left.
    pub fn unregister(&self, username: &str, id: ConnectionId) -> bool {
        let mut offline = true;
        self.connections.remove_if_mut(username, |_, devices| {
            devices.retain(|c| c.id != id);
            offline = devices.is_empty();
            offline
        });

        tracing::debug!(
            username = %username,
            connection_id = %id,
            offline,
            "Connection unregistered"
        );
        offline
    }

    /// Deliver to every connection of `username`; returns how many accepted it.
    pub fn fanout(&self, username: &str, event: &ServerEvent) -> usize {
        match encode(event) {
            Some(msg) => self.deliver(username, msg),
            None => 0,
        }
    }

    /// Queue a close frame on every connection of `username`.
    pub fn close_user(&self, username: &str, code: u16, reason: &str) -> usize {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        self.deliver(username, Message::Close(Some(frame)))
    }

    fn deliver(&self, username: &str, msg: Message) -> usize {
        let mut delivered = 0;
        let mut pruned = false;

        if let Some(mut devices) = self.connections.get_mut(username) {
            devices.retain(|c| match c.deliver(msg.clone()) {
                Delivery::Sent => {
                    delivered += 1;
                    true
                }
                Delivery::Full => true,
                Delivery::Closed => {
                    tracing::debug!(
                        username = %username,
                        connection_id = %c.id,
                        "Pruning closed connection"
                    );
                    pruned = true;
                    false
                }
            });
        }

        if pruned {
            self.connections.remove_if(username, |_, devices| devices.is_empty());
        }
        delivered
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.connection_count(username) > 0
    }

    pub fn connection_count(&self, username: &str) -> usize {
        self.connections
            .get(username)
            .map(|devices| devices.len())
            .unwrap_or(0)
    }
}
