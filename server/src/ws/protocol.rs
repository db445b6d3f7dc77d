//! JSON wire protocol: every frame is `{"type": ..., "payload": ...}`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::dm::conversations::ConversationId;
use crate::dm::messages::{DeliveredMessage, MessageRecord, RecallNotice};
use crate::friends::InitialData;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationPayload {
    conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessagePayload {
    conversation_id: ConversationId,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecallPayload {
    conversation_id: ConversationId,
    message_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FriendPayload {
    friend_username: String,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    GetHistory {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
    },
    RecallMessage {
        conversation_id: ConversationId,
        message_id: String,
    },
    AddFriend {
        friend_username: String,
    },
    AcceptFriend {
        friend_username: String,
    },
    DeleteFriend {
        friend_username: String,
    },
    DeleteAccount,
    Ping,
}

fn payload<T: DeserializeOwned>(kind: &'static str, value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        kind,
        reason: e.to_string(),
    })
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let event = match raw.kind.as_str() {
            "get_history" => {
                let p: ConversationPayload = payload("get_history", raw.payload)?;
                Self::GetHistory {
                    conversation_id: p.conversation_id,
                }
            }
            "send_message" => {
                let p: SendMessagePayload = payload("send_message", raw.payload)?;
                Self::SendMessage {
                    conversation_id: p.conversation_id,
                    content: p.content,
                }
            }
            "recall_message" => {
                let p: RecallPayload = payload("recall_message", raw.payload)?;
                Self::RecallMessage {
                    conversation_id: p.conversation_id,
                    message_id: p.message_id,
                }
            }
            "add_friend" => Self::AddFriend {
                friend_username: payload::<FriendPayload>("add_friend", raw.payload)?
                    .friend_username,
            },
            "accept_friend" => Self::AcceptFriend {
                friend_username: payload::<FriendPayload>("accept_friend", raw.payload)?
                    .friend_username,
            },
            "delete_friend" => Self::DeleteFriend {
                friend_username: payload::<FriendPayload>("delete_friend", raw.payload)?
                    .friend_username,
            },
            "delete_account" => Self::DeleteAccount,
            "ping" => Self::Ping,
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(event)
    }

    /// Wire name of the event, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetHistory { .. } => "get_history",
            Self::SendMessage { .. } => "send_message",
            Self::RecallMessage { .. } => "recall_message",
            Self::AddFriend { .. } => "add_friend",
            Self::AcceptFriend { .. } => "accept_friend",
            Self::DeleteFriend { .. } => "delete_friend",
            Self::DeleteAccount => "delete_account",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub content: String,
    pub timestamp: u64,
    pub is_echo: bool,
}

impl NewMessage {
    pub fn new(record: &MessageRecord, plaintext: &str, is_echo: bool) -> Self {
        Self {
            id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender: record.sender.clone(),
            content: plaintext.to_string(),
            timestamp: record.timestamp,
            is_echo,
        }
    }
}

/// Events the server pushes to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    InitialData(InitialData),
    #[serde(rename_all = "camelCase")]
    History {
        conversation_id: ConversationId,
        messages: Vec<DeliveredMessage>,
    },
    NewMessage(NewMessage),
    RecalledMessage(RecallNotice),
    NewFriendRequest {
        username: String,
    },
    FriendAdded {
        username: String,
    },
    FriendDeleted {
        username: String,
    },
    AccountDeleted {},
    Error {
        message: String,
    },
    Info {
        message: String,
    },
    Pong {},
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dm::messages::DeliveredContent;
    use serde_json::json;

    #[test]
    fn test_parse_every_client_event() {
        let conv = ConversationId::between("alice", "bob").unwrap();
        let cases = vec![
            (
                json!({"type": "get_history", "payload": {"conversationId": "alice-bob"}}),
                ClientEvent::GetHistory {
                    conversation_id: conv.clone(),
                },
            ),
            (
                json!({"type": "send_message", "payload": {"conversationId": "alice-bob", "content": "hi"}}),
                ClientEvent::SendMessage {
                    conversation_id: conv.clone(),
                    content: "hi".into(),
                },
            ),
            (
                json!({"type": "recall_message", "payload": {"conversationId": "alice-bob", "messageId": "m1"}}),
                ClientEvent::RecallMessage {
                    conversation_id: conv.clone(),
                    message_id: "m1".into(),
                },
            ),
            (
                json!({"type": "add_friend", "payload": {"friendUsername": "bob"}}),
                ClientEvent::AddFriend {
                    friend_username: "bob".into(),
                },
            ),
            (
                json!({"type": "accept_friend", "payload": {"friendUsername": "bob"}}),
                ClientEvent::AcceptFriend {
                    friend_username: "bob".into(),
                },
            ),
            (
                json!({"type": "delete_friend", "payload": {"friendUsername": "bob"}}),
                ClientEvent::DeleteFriend {
                    friend_username: "bob".into(),
                },
            ),
            (
                json!({"type": "delete_account", "payload": {}}),
                ClientEvent::DeleteAccount,
            ),
            (json!({"type": "ping"}), ClientEvent::Ping),
        ];

        for (raw, expected) in cases {
            let parsed = ClientEvent::parse(&raw.to_string()).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(parsed.kind(), raw["type"].as_str().unwrap());
        }
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = ClientEvent::parse(r#"{"type":"typing","payload":{}}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownType("typing".into()));
        assert_eq!(err.to_string(), "unknown event type: typing");
    }

    #[test]
    fn test_malformed_and_invalid_payloads() {
        assert!(matches!(
            ClientEvent::parse("not json"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"payload":{}}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"type":"send_message","payload":{"conversationId":"alice-bob"}}"#),
            Err(ProtocolError::InvalidPayload { kind: "send_message", .. })
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"type":"get_history","payload":{"conversationId":"bob-alice"}}"#),
            Err(ProtocolError::InvalidPayload { kind: "get_history", .. })
        ));
        assert!(matches!(
            ClientEvent::parse(r#"{"type":"add_friend"}"#),
            Err(ProtocolError::InvalidPayload { kind: "add_friend", .. })
        ));
    }

    #[test]
    fn test_server_event_wire_shapes() {
        let conv = ConversationId::between("alice", "bob").unwrap();

        let event = ServerEvent::NewMessage(NewMessage {
            id: "m1".into(),
            conversation_id: conv.clone(),
            sender: "alice".into(),
            content: "hi".into(),
            timestamp: 42,
            is_echo: true,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "new_message",
                "payload": {
                    "id": "m1",
                    "conversationId": "alice-bob",
                    "sender": "alice",
                    "content": "hi",
                    "timestamp": 42,
                    "isEcho": true
                }
            })
        );

        let history = ServerEvent::History {
            conversation_id: conv.clone(),
            messages: vec![DeliveredMessage {
                id: "m1".into(),
                conversation_id: conv.clone(),
                sender: "alice".into(),
                timestamp: 42,
                content: DeliveredContent::Recalled,
            }],
        };
        let value = serde_json::to_value(&history).unwrap();
        assert_eq!(value["type"], "history");
        assert_eq!(value["payload"]["conversationId"], "alice-bob");
        assert_eq!(value["payload"]["messages"][0]["contentType"], "recalled");

        let recalled = ServerEvent::RecalledMessage(RecallNotice {
            id: "m1".into(),
            conversation_id: conv,
            original_sender: "alice".into(),
        });
        assert_eq!(
            serde_json::to_value(&recalled).unwrap()["payload"]["originalSender"],
            "alice"
        );

        assert_eq!(
            serde_json::to_value(ServerEvent::AccountDeleted {}).unwrap(),
            json!({"type": "account_deleted", "payload": {}})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::Pong {}).unwrap(),
            json!({"type": "pong", "payload": {}})
        );
        assert_eq!(
            serde_json::to_value(ServerEvent::InitialData(InitialData {
                friends: vec!["bob".into()],
                requests: vec![],
            }))
            .unwrap(),
            json!({"type": "initial_data", "payload": {"friends": ["bob"], "requests": []}})
        );
    }
}
