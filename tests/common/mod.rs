#![allow(dead_code)]

use portal_sync_lib::application::ports::DocumentKey;
use portal_sync_lib::{
    AppConfig, ConversationId, ConversationKey, LifecycleBroadcaster, MemoryAuthState,
    MemoryStatusStore, MessageAuthor, PresenceRole, SessionContext, SessionPorts,
    VirtualTimerScheduler,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const OPERATOR: &str = "admin-1";
pub const MINUTE: Duration = Duration::from_secs(60);

/// One signed-in device: session plus the in-memory ports behind it.
pub struct Device {
    pub session: SessionContext,
    pub store: Arc<MemoryStatusStore>,
    pub auth: Arc<MemoryAuthState>,
    pub lifecycle: Arc<LifecycleBroadcaster>,
    pub timers: Arc<VirtualTimerScheduler>,
    pub config: AppConfig,
}

impl Device {
    pub fn signed_in(user_id: &str) -> Self {
        Self::with_config(user_id, AppConfig::default())
    }

    pub fn with_config(user_id: &str, config: AppConfig) -> Self {
        let timers = Arc::new(VirtualTimerScheduler::new());
        let store = Arc::new(MemoryStatusStore::new(timers.clone()));
        Self::sharing(user_id, config, store, timers)
    }

    /// A second device on the same store and clock.
    pub fn sharing(
        user_id: &str,
        config: AppConfig,
        store: Arc<MemoryStatusStore>,
        timers: Arc<VirtualTimerScheduler>,
    ) -> Self {
        let auth = Arc::new(MemoryAuthState::signed_in(user_id));
        let lifecycle = Arc::new(LifecycleBroadcaster::new());
        let session = SessionContext::new(
            config.clone(),
            SessionPorts {
                store: store.clone(),
                auth: auth.clone(),
                lifecycle: lifecycle.clone(),
                timers: timers.clone(),
                clock: timers.clone(),
            },
        )
        .expect("default config is valid");
        Self {
            session,
            store,
            auth,
            lifecycle,
            timers,
            config,
        }
    }

    pub async fn advance(&self, by: Duration) {
        self.timers.advance(by).await;
        settle().await;
    }

    pub fn presence_key(&self, owner_id: &str, role: PresenceRole) -> DocumentKey {
        let collection = match role {
            PresenceRole::Operator => &self.config.store.operator_presence_collection,
            PresenceRole::Member => &self.config.store.member_presence_collection,
        };
        DocumentKey::new(collection.clone(), owner_id)
    }

    pub fn stored_online(&self, owner_id: &str, role: PresenceRole) -> Option<bool> {
        self.store
            .document(&self.presence_key(owner_id, role))
            .and_then(|doc| doc.get("isOnline").and_then(Value::as_bool))
    }

    pub fn messages(&self) -> Vec<portal_sync_lib::application::ports::StoredDocument> {
        self.store.documents(&self.config.store.messages_collection)
    }
}

pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

pub fn conversation_id(member_id: &str) -> ConversationId {
    ConversationId::new(member_id).unwrap()
}

/// Conversations are keyed by the member; the operator is the other participant.
pub fn thread(member_id: &str) -> ConversationKey {
    ConversationKey::new(conversation_id(member_id), [OPERATOR, member_id])
}

pub fn operator() -> MessageAuthor {
    MessageAuthor::new(OPERATOR, PresenceRole::Operator).with_display_name("Front desk")
}

pub fn member(member_id: &str, name: &str) -> MessageAuthor {
    MessageAuthor::new(member_id, PresenceRole::Member).with_display_name(name)
}
