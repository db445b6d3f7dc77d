//! Persisted, encrypted message history per conversation.
//!
//! Messages live under `messages/{conversationId}/{timestamp:020}/{messageId}`,
//! so a prefix scan returns a conversation in `(timestamp, messageId)` order.
//! Bodies are stored encrypted; a recalled message keeps its identity fields
//! and loses its ciphertext.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{AtomicOp, Commit, Entry, KvStore, ListOptions, StoreError};
use crate::dm::conversations::ConversationId;
use crate::dm::crypto::{EncryptionFailure, MessageCipher};
use crate::dm::now_millis;

/// Default and maximum page size for message history.
pub const MAX_HISTORY_LIMIT: usize = 100;
/// Maximum message content length (chars).
pub const MAX_CONTENT_LENGTH: usize = 4000;
/// Shown in place of a body that failed to decrypt.
pub const UNREADABLE_PLACEHOLDER: &str = "[message could not be decrypted]";

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("you are not a participant in this conversation")]
    NotParticipant,
    #[error("you can only message your friends")]
    NotFriends,
    #[error("message content is empty")]
    EmptyContent,
    #[error("message content exceeds {MAX_CONTENT_LENGTH} characters")]
    ContentTooLong,
    #[error(transparent)]
    Encryption(#[from] EncryptionFailure),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MessageError {
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotParticipant | Self::NotFriends | Self::EmptyContent | Self::ContentTooLong
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StoredContent {
    EncryptedText { ciphertext: String },
    Recalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub timestamp: u64,
    pub content: StoredContent,
}

/// Message body as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "contentType", content = "content", rename_all = "lowercase")]
pub enum DeliveredContent {
    Text(String),
    Recalled,
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveredMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub content: DeliveredContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallNotice {
    pub id: String,
    pub conversation_id: ConversationId,
    pub original_sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecallOutcome {
    Recalled(RecallNotice),
    /// Missing, already recalled, not the caller's message, or past the window.
    NotFoundOrExpired,
}

fn conversation_prefix(conversation: &ConversationId) -> String {
    format!("messages/{}/", conversation)
}

fn message_key(conversation: &ConversationId, timestamp: u64, message_id: &str) -> String {
    format!("messages/{}/{:020}/{}", conversation, timestamp, message_id)
}

/// Placeholder for a record that no longer decodes. Identity comes from the
/// key (`.../{timestamp}/{messageId}`) and whatever sender survives in the value.
fn unreadable_entry(conversation: &ConversationId, entry: &Entry) -> DeliveredMessage {
    let mut segments = entry.key.rsplit('/');
    let id = segments.next().unwrap_or_default().to_string();
    let timestamp = segments.next().and_then(|t| t.parse().ok()).unwrap_or(0);
    let sender = entry
        .value
        .get("sender")
        .and_then(|s| s.as_str())
        .unwrap_or_default()
        .to_string();
    DeliveredMessage {
        id,
        conversation_id: conversation.clone(),
        sender,
        timestamp,
        content: DeliveredContent::Unreadable(UNREADABLE_PLACEHOLDER.to_string()),
    }
}

#[derive(Clone)]
pub struct ConversationStore {
    store: Arc<dyn KvStore>,
    cipher: Arc<MessageCipher>,
}

impl ConversationStore {
    pub fn new(store: Arc<dyn KvStore>, cipher: Arc<MessageCipher>) -> Self {
        Self { store, cipher }
    }

    /// Encrypt and persist a new message; returns the record and the
    /// plaintext so callers can fan out without decrypting again.
    pub fn append(
        &self,
        conversation: &ConversationId,
        sender: &str,
        plaintext: &str,
    ) -> Result<(MessageRecord, String), MessageError> {
        self.append_at(conversation, sender, plaintext, now_millis())
    }

    pub fn append_at(
        &self,
        conversation: &ConversationId,
        sender: &str,
        plaintext: &str,
        timestamp: u64,
    ) -> Result<(MessageRecord, String), MessageError> {
        if !conversation.includes(sender) {
            return Err(MessageError::NotParticipant);
        }
        if plaintext.trim().is_empty() {
            return Err(MessageError::EmptyContent);
        }
        if plaintext.chars().count() > MAX_CONTENT_LENGTH {
            return Err(MessageError::ContentTooLong);
        }

        let record = MessageRecord {
            id: uuid::Uuid::now_v7().to_string(),
            conversation_id: conversation.clone(),
            sender: sender.to_string(),
            timestamp,
            content: StoredContent::EncryptedText {
                ciphertext: self.cipher.encrypt(plaintext)?,
            },
        };

        let mut op = AtomicOp::new();
        op.set(message_key(conversation, timestamp, &record.id), &record)?;
        self.store.commit(op)?;

        tracing::debug!(
            conversation = %conversation,
            message_id = %record.id,
            sender = %sender,
            "Message stored"
        );
        Ok((record, plaintext.to_string()))
    }

    /// The most recent `limit` messages, oldest first.
    pub fn history(
        &self,
        conversation: &ConversationId,
        limit: usize,
    ) -> Result<Vec<DeliveredMessage>, MessageError> {
        let limit = limit.min(MAX_HISTORY_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let entries = self.store.list_prefix(
            &conversation_prefix(conversation),
            ListOptions {
                reverse: true,
                limit: Some(limit),
            },
        )?;

        let mut messages = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().rev() {
            match entry.decode::<MessageRecord>() {
                Ok(record) => messages.push(self.deliver(record)),
                Err(e) => {
                    tracing::warn!(key = %entry.key, error = %e, "Message record could not be decoded");
                    messages.push(unreadable_entry(conversation, &entry));
                }
            }
        }
        Ok(messages)
    }

    fn deliver(&self, record: MessageRecord) -> DeliveredMessage {
        let content = match &record.content {
            StoredContent::EncryptedText { ciphertext } => match self.cipher.decrypt(ciphertext) {
                Ok(text) => DeliveredContent::Text(text),
                Err(e) => {
                    tracing::warn!(
                        conversation = %record.conversation_id,
                        message_id = %record.id,
                        error = %e,
                        "Message decryption failed"
                    );
                    DeliveredContent::Unreadable(UNREADABLE_PLACEHOLDER.to_string())
                }
            },
            StoredContent::Recalled => DeliveredContent::Recalled,
        };
        DeliveredMessage {
            id: record.id,
            conversation_id: record.conversation_id,
            sender: record.sender,
            timestamp: record.timestamp,
            content,
        }
    }

    pub fn recall(
        &self,
        conversation: &ConversationId,
        message_id: &str,
        acting_user: &str,
        window_ms: u64,
    ) -> Result<RecallOutcome, MessageError> {
        self.recall_at(conversation, message_id, acting_user, window_ms, now_millis())
    }

    /// Recall succeeds while `now - timestamp < window_ms`; a request landing
    /// exactly on the boundary is already expired.
    pub fn recall_at(
        &self,
        conversation: &ConversationId,
        message_id: &str,
        acting_user: &str,
        window_ms: u64,
        now: u64,
    ) -> Result<RecallOutcome, MessageError> {
        let suffix = format!("/{}", message_id);

        // A lost race means another recall got there first; the retry then
        // sees the recalled state and reports a no-op.
        for _ in 0..2 {
            let entries = self
                .store
                .list_prefix(&conversation_prefix(conversation), ListOptions::default())?;
            let Some(entry) = entries.into_iter().find(|e| e.key.ends_with(&suffix)) else {
                return Ok(RecallOutcome::NotFoundOrExpired);
            };

            let mut record: MessageRecord = entry.decode()?;
            if record.id != message_id
                || record.sender != acting_user
                || record.content == StoredContent::Recalled
                || now.saturating_sub(record.timestamp) >= window_ms
            {
                return Ok(RecallOutcome::NotFoundOrExpired);
            }

            record.content = StoredContent::Recalled;
            let mut op = AtomicOp::new();
            op.check(entry.key.clone(), Some(entry.version));
            op.set(entry.key, &record)?;

            if let Commit::Applied { .. } = self.store.commit(op)? {
                return Ok(RecallOutcome::Recalled(RecallNotice {
                    id: record.id,
                    conversation_id: record.conversation_id,
                    original_sender: record.sender,
                }));
            }
        }
        Ok(RecallOutcome::NotFoundOrExpired)
    }

    /// Delete the whole conversation history.
    pub fn purge(&self, conversation: &ConversationId) -> Result<(), MessageError> {
        let mut op = AtomicOp::new();
        Self::stage_purge(&mut op, conversation);
        self.store.commit(op)?;
        Ok(())
    }

    /// Add the purge to a larger transaction (friend or account deletion).
    pub fn stage_purge(op: &mut AtomicOp, conversation: &ConversationId) {
        op.delete_prefix(conversation_prefix(conversation));
    }
}
