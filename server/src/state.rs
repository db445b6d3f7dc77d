use std::sync::Arc;

use crate::config::ChatConfig;
use crate::db::{DbPool, KvStore, SqliteKv};
use crate::dm::crypto::MessageCipher;
use crate::dm::messages::ConversationStore;
use crate::friends::FriendGraph;
use crate::ws::ConnectionRegistry;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Friend lists, pending requests and user records
    pub friends: FriendGraph,
    /// Encrypted message history per conversation
    pub conversations: ConversationStore,
    /// Active WebSocket connections per user
    pub connections: ConnectionRegistry,
    /// Messaging and connection tuning
    pub chat: Arc<ChatConfig>,
}

impl AppState {
    pub fn new(db: DbPool, cipher: MessageCipher, chat: ChatConfig) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(SqliteKv::new(db));
        Self {
            friends: FriendGraph::new(store.clone()),
            conversations: ConversationStore::new(store, Arc::new(cipher)),
            connections: ConnectionRegistry::new(),
            chat: Arc::new(chat),
        }
    }
}
