use super::message::Message;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Derived, non-authoritative view of one counterpart's thread on the operator side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationSummary {
    pub counterpart_id: String,
    pub counterpart_name: String,
    pub last_message: Message,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u64,
}
