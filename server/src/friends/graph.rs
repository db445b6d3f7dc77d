//! Friend graph state machine.
//!
//! Every operation reads the records it depends on, builds one [`AtomicOp`]
//! that checks each of them is unchanged, and commits. A conflict means a
//! concurrent writer got there first, so the whole operation re-runs against
//! fresh state. Friend edges are therefore always symmetric and requests are
//! never half-accepted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{AtomicOp, Commit, KvStore, KvStoreExt, ListOptions};
use crate::dm::conversations::ConversationId;
use crate::dm::messages::ConversationStore;
use crate::friends::{
    friends_key, requests_key, user_key, validate_username, FriendError, UserRecord,
};

/// Commit attempts before giving up with [`FriendError::TransactionConflict`].
pub const MAX_COMMIT_ATTEMPTS: usize = 8;

/// Snapshot sent to a device right after it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialData {
    pub friends: Vec<String>,
    pub requests: Vec<String>,
}

#[derive(Clone)]
pub struct FriendGraph {
    store: Arc<dyn KvStore>,
}

fn require_valid(username: &str) -> Result<(), FriendError> {
    if validate_username(username) {
        Ok(())
    } else {
        Err(FriendError::InvalidUsername)
    }
}

fn without(list: &[String], name: &str) -> Vec<String> {
    list.iter().filter(|n| *n != name).cloned().collect()
}

fn with(list: &[String], name: &str) -> Vec<String> {
    let mut out = list.to_vec();
    if !out.iter().any(|n| n == name) {
        out.push(name.to_string());
    }
    out
}

impl FriendGraph {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Run `attempt` until its op commits. An op with no mutations is a
    /// successful no-op and is not committed.
    fn transact<T>(
        &self,
        label: &str,
        mut attempt: impl FnMut(&dyn KvStore) -> Result<(AtomicOp, T), FriendError>,
    ) -> Result<T, FriendError> {
        for n in 1..=MAX_COMMIT_ATTEMPTS {
            let (op, value) = attempt(self.store.as_ref())?;
            if op.is_empty() {
                return Ok(value);
            }
            match self.store.commit(op)? {
                Commit::Applied { .. } => return Ok(value),
                Commit::Conflict => {
                    tracing::debug!(operation = label, attempt = n, "Friend graph commit conflicted")
                }
            }
        }
        tracing::warn!(
            operation = label,
            attempts = MAX_COMMIT_ATTEMPTS,
            "Friend graph commit gave up after repeated conflicts"
        );
        Err(FriendError::TransactionConflict)
    }

    /// Create or refresh the user record with `online = true` and return the
    /// user's friends and pending requests.
    pub fn connect(&self, username: &str) -> Result<InitialData, FriendError> {
        require_valid(username)?;
        let (user_k, friends_k, requests_k) =
            (user_key(username), friends_key(username), requests_key(username));

        self.transact("connect", |store| {
            let user = store.get(&user_k)?;
            let (friends, friends_entry) = store.get_list(&friends_k)?;
            let (requests, requests_entry) = store.get_list(&requests_k)?;

            let mut op = AtomicOp::new();
            op.check_read(user_k.as_str(), user.as_ref())
                .check_read(friends_k.as_str(), friends_entry.as_ref())
                .check_read(requests_k.as_str(), requests_entry.as_ref());
            op.set(
                user_k.as_str(),
                &UserRecord {
                    username: username.to_string(),
                    online: true,
                },
            )?;
            Ok((op, InitialData { friends, requests }))
        })
    }

    /// Mark the user offline. A missing record (deleted account) stays missing.
    ///
    /// `no_live_devices` is consulted after the record is read and before the
    /// write is staged. A device that registers afterwards bumps the record
    /// in its own [`FriendGraph::connect`], so this commit conflicts and the
    /// retry sees the new device.
    pub fn set_offline(
        &self,
        username: &str,
        no_live_devices: impl Fn() -> bool,
    ) -> Result<(), FriendError> {
        let key = user_key(username);
        self.transact("set_offline", |store| {
            let mut op = AtomicOp::new();
            let Some(entry) = store.get(&key)? else {
                return Ok((op, ()));
            };
            let mut record: UserRecord = entry.decode()?;
            if !record.online || !no_live_devices() {
                return Ok((op, ()));
            }
            record.online = false;
            op.check(key.as_str(), Some(entry.version));
            op.set(key.as_str(), &record)?;
            Ok((op, ()))
        })
    }

    pub fn are_friends(&self, a: &str, b: &str) -> Result<bool, FriendError> {
        let (friends, _) = self.store.get_list(&friends_key(a))?;
        Ok(friends.iter().any(|f| f == b))
    }

    /// Record a pending request from `from` to `to`. Returns `false` when the
    /// same request was already pending.
    pub fn add_request(&self, from: &str, to: &str) -> Result<bool, FriendError> {
        require_valid(from)?;
        require_valid(to)?;
        if from == to {
            return Err(FriendError::SelfRequest);
        }
        let (sender_k, target_k, friends_k, requests_k) =
            (user_key(from), user_key(to), friends_key(from), requests_key(to));

        let created = self.transact("add_request", |store| {
            // A deleted account may still have events queued on another device
            let Some(sender) = store.get(&sender_k)? else {
                return Err(FriendError::UnknownUser);
            };
            let Some(target) = store.get(&target_k)? else {
                return Err(FriendError::UnknownUser);
            };
            let (friends, friends_entry) = store.get_list(&friends_k)?;
            if friends.iter().any(|f| f == to) {
                return Err(FriendError::AlreadyFriends);
            }
            let (requests, requests_entry) = store.get_list(&requests_k)?;
            let mut op = AtomicOp::new();
            if requests.iter().any(|r| r == from) {
                return Ok((op, false));
            }

            op.check(sender_k.as_str(), Some(sender.version))
                .check(target_k.as_str(), Some(target.version))
                .check_read(friends_k.as_str(), friends_entry.as_ref())
                .check_read(requests_k.as_str(), requests_entry.as_ref());
            op.set(requests_k.as_str(), &with(&requests, from))?;
            Ok((op, true))
        })?;

        if created {
            tracing::debug!(from = %from, to = %to, "Friend request recorded");
        }
        Ok(created)
    }

    /// Turn a pending request from `requester` into a mutual friendship.
    pub fn accept_request(&self, accepter: &str, requester: &str) -> Result<(), FriendError> {
        require_valid(accepter)?;
        require_valid(requester)?;
        let requester_user_k = user_key(requester);
        let accepter_requests_k = requests_key(accepter);
        let requester_requests_k = requests_key(requester);
        let accepter_friends_k = friends_key(accepter);
        let requester_friends_k = friends_key(requester);

        self.transact("accept_request", |store| {
            let (pending, pending_entry) = store.get_list(&accepter_requests_k)?;
            if !pending.iter().any(|r| r == requester) {
                return Err(FriendError::NoPendingRequest);
            }
            let Some(requester_user) = store.get(&requester_user_k)? else {
                return Err(FriendError::UnknownUser);
            };
            let (accepter_friends, accepter_friends_entry) =
                store.get_list(&accepter_friends_k)?;
            let (requester_friends, requester_friends_entry) =
                store.get_list(&requester_friends_k)?;
            let (reverse, reverse_entry) = store.get_list(&requester_requests_k)?;

            let mut op = AtomicOp::new();
            op.check(requester_user_k.as_str(), Some(requester_user.version))
                .check_read(accepter_requests_k.as_str(), pending_entry.as_ref())
                .check_read(accepter_friends_k.as_str(), accepter_friends_entry.as_ref())
                .check_read(requester_friends_k.as_str(), requester_friends_entry.as_ref())
                .check_read(requester_requests_k.as_str(), reverse_entry.as_ref());

            op.set(accepter_friends_k.as_str(), &with(&accepter_friends, requester))?;
            op.set(requester_friends_k.as_str(), &with(&requester_friends, accepter))?;
            op.set(accepter_requests_k.as_str(), &without(&pending, requester))?;
            // Both sides may have asked each other
            if reverse.iter().any(|r| r == accepter) {
                op.set(requester_requests_k.as_str(), &without(&reverse, accepter))?;
            }
            Ok((op, ()))
        })?;

        tracing::debug!(accepter = %accepter, requester = %requester, "Friend request accepted");
        Ok(())
    }

    /// Remove the friendship in both directions and purge the shared conversation.
    pub fn delete_friend(&self, username: &str, friend: &str) -> Result<(), FriendError> {
        require_valid(username)?;
        require_valid(friend)?;
        let conversation =
            ConversationId::between(username, friend).map_err(|_| FriendError::NotFriends)?;
        let own_k = friends_key(username);
        let their_k = friends_key(friend);

        self.transact("delete_friend", |store| {
            let (own, own_entry) = store.get_list(&own_k)?;
            if !own.iter().any(|f| f == friend) {
                return Err(FriendError::NotFriends);
            }
            let (theirs, their_entry) = store.get_list(&their_k)?;

            let mut op = AtomicOp::new();
            op.check_read(own_k.as_str(), own_entry.as_ref())
                .check_read(their_k.as_str(), their_entry.as_ref());
            op.set(own_k.as_str(), &without(&own, friend))?;
            op.set(their_k.as_str(), &without(&theirs, username))?;
            ConversationStore::stage_purge(&mut op, &conversation);
            Ok((op, ()))
        })?;

        tracing::debug!(username = %username, friend = %friend, "Friendship removed");
        Ok(())
    }

    /// Delete the account and everything hanging off it. Returns the former
    /// friends so they can be notified.
    pub fn delete_account(&self, username: &str) -> Result<Vec<String>, FriendError> {
        require_valid(username)?;
        let user_k = user_key(username);
        let friends_k = friends_key(username);
        let requests_k = requests_key(username);

        let friends = self.transact("delete_account", |store| {
            let user = store.get(&user_k)?;
            let (friends, friends_entry) = store.get_list(&friends_k)?;
            let requests_entry = store.get(&requests_k)?;

            let mut op = AtomicOp::new();
            op.check_read(user_k.as_str(), user.as_ref())
                .check_read(friends_k.as_str(), friends_entry.as_ref())
                .check_read(requests_k.as_str(), requests_entry.as_ref());

            for friend in &friends {
                let key = friends_key(friend);
                let (theirs, their_entry) = store.get_list(&key)?;
                op.check_read(key.as_str(), their_entry.as_ref());
                if their_entry.is_some() {
                    op.set(key.as_str(), &without(&theirs, username))?;
                }
                if let Ok(conversation) = ConversationId::between(username, friend) {
                    ConversationStore::stage_purge(&mut op, &conversation);
                }
            }

            // Requests this user sent to others
            for entry in store.list_prefix("requests/", ListOptions::default())? {
                if entry.key == requests_k {
                    continue;
                }
                let pending: Vec<String> = entry.decode()?;
                if pending.iter().any(|r| r == username) {
                    op.check(entry.key.as_str(), Some(entry.version));
                    op.set(entry.key.as_str(), &without(&pending, username))?;
                }
            }

            op.delete(user_k.as_str())
                .delete(friends_k.as_str())
                .delete(requests_k.as_str());
            Ok((op, friends))
        })?;

        tracing::info!(username = %username, friends = friends.len(), "Account deleted");
        Ok(friends)
    }
}
