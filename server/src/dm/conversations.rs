//! Canonical two-party conversation ids.
//!
//! Participant order is normalized (the username that sorts first by UTF-16
//! code units comes first, matching how browser clients sort strings) so both
//! sides derive the same id: `id(a, b) == id(b, a)`.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::friends::validate_username;

pub const SEPARATOR: char = '-';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationIdError {
    #[error("conversation id must be two usernames joined by '-'")]
    Malformed,
    #[error("conversation id contains an invalid username")]
    InvalidUsername,
    #[error("a conversation needs two different users")]
    SameUser,
    #[error("conversation id is not in canonical order")]
    NotCanonical,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId {
    id: String,
    split: usize,
}

fn utf16_lt(a: &str, b: &str) -> bool {
    a.encode_utf16().lt(b.encode_utf16())
}

impl ConversationId {
    pub fn between(a: &str, b: &str) -> Result<Self, ConversationIdError> {
        if !validate_username(a) || !validate_username(b) {
            return Err(ConversationIdError::InvalidUsername);
        }
        if a == b {
            return Err(ConversationIdError::SameUser);
        }
        let (first, second) = if utf16_lt(a, b) { (a, b) } else { (b, a) };
        Ok(Self {
            id: format!("{}{}{}", first, SEPARATOR, second),
            split: first.len(),
        })
    }

    /// Parse a client-supplied id, accepting only the canonical form.
    pub fn parse(raw: &str) -> Result<Self, ConversationIdError> {
        let (a, b) = raw
            .split_once(SEPARATOR)
            .ok_or(ConversationIdError::Malformed)?;
        let id = Self::between(a, b)?;
        if id.id != raw {
            return Err(ConversationIdError::NotCanonical);
        }
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.id
    }

    pub fn participants(&self) -> (&str, &str) {
        (&self.id[..self.split], &self.id[self.split + 1..])
    }

    pub fn includes(&self, username: &str) -> bool {
        let (a, b) = self.participants();
        a == username || b == username
    }

    /// The other participant, if `username` is one of the two.
    pub fn peer_of(&self, username: &str) -> Option<&str> {
        match self.participants() {
            (a, b) if a == username => Some(b),
            (a, b) if b == username => Some(a),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = ConversationIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(value: ConversationId) -> Self {
        value.id
    }
}
