//! Friend graph: per-user friend lists and pending requests.
//!
//! Layout in the keyed store:
//!   users/{username}    -> { username, online }
//!   friends/{username}  -> [usernames]
//!   requests/{username} -> [usernames that asked to befriend {username}]

pub mod graph;

use serde::{Deserialize, Serialize};

use crate::db::StoreError;

pub use graph::{FriendGraph, InitialData};

/// Maximum username length (chars).
pub const MAX_USERNAME_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum FriendError {
    #[error("you cannot send a friend request to yourself")]
    SelfRequest,
    #[error("user does not exist")]
    UnknownUser,
    #[error("you are already friends")]
    AlreadyFriends,
    #[error("no pending friend request from this user")]
    NoPendingRequest,
    #[error("you are not friends with this user")]
    NotFriends,
    #[error("invalid username")]
    InvalidUsername,
    #[error("friend graph commit kept conflicting")]
    TransactionConflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FriendError {
    /// Whether the error describes a bad request rather than a server fault.
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::TransactionConflict | Self::Store(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub online: bool,
}

/// Usernames double as key-path segments and conversation-id halves, so the
/// two separators (`/` and `-`) are not allowed.
pub fn validate_username(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_USERNAME_LEN).contains(&len)
        && name
            .chars()
            .all(|c| c != '/' && c != '-' && !c.is_whitespace() && !c.is_control())
}

pub(crate) fn user_key(username: &str) -> String {
    format!("users/{}", username)
}

pub(crate) fn friends_key(username: &str) -> String {
    format!("friends/{}", username)
}

pub(crate) fn requests_key(username: &str) -> String {
    format!("requests/{}", username)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_usernames() {
        for name in ["alice", "Bob_99", "李雷", "a.b"] {
            assert!(validate_username(name), "{} should be valid", name);
        }
    }

    #[test]
    fn test_rejects_separators_and_whitespace() {
        for name in ["", "a-b", "a/b", "has space", "tab\t", &"x".repeat(33)] {
            assert!(!validate_username(name), "{:?} should be invalid", name);
        }
    }
}
