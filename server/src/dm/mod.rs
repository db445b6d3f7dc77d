//! Direct messages: conversation ids, the encrypted message store, and the
//! at-rest cipher it uses.

pub mod conversations;
pub mod crypto;
pub mod keys;
pub mod messages;

pub use conversations::ConversationId;
pub use messages::{ConversationStore, DeliveredMessage, MessageError, RecallNotice, RecallOutcome};

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}
