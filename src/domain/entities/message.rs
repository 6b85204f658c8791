use crate::domain::value_objects::{ConversationId, MessageId, PresenceRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (DeliveryStatus::Pending, DeliveryStatus::Delivered)
                | (DeliveryStatus::Pending, DeliveryStatus::Failed)
                | (DeliveryStatus::Failed, DeliveryStatus::Pending)
        )
    }
}

impl FromStr for DeliveryStatus {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(DeliveryStatus::Pending),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAuthor {
    pub id: String,
    pub role: PresenceRole,
    pub display_name: Option<String>,
}

impl MessageAuthor {
    pub fn new(id: impl Into<String>, role: PresenceRole) -> Self {
        Self {
            id: id.into(),
            role,
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// A conversation addressed by id together with everyone who may read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationKey {
    pub id: ConversationId,
    pub participants: BTreeSet<String>,
}

impl ConversationKey {
    pub fn new<I, S>(id: ConversationId, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id,
            participants: participants.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub client_id: String,
    pub conversation_id: ConversationId,
    pub sender_id: String,
    pub sender_role: PresenceRole,
    pub sender_name: Option<String>,
    pub content: String,
    pub created_at: Option<DateTime<Utc>>,
    pub client_timestamp: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub read: bool,
    pub participants: BTreeSet<String>,
    #[serde(skip)]
    pub last_error: Option<String>,
}

impl Message {
    pub fn new_pending(
        conversation: &ConversationKey,
        author: &MessageAuthor,
        content: String,
        client_timestamp: DateTime<Utc>,
    ) -> Self {
        let mut participants = conversation.participants.clone();
        participants.insert(author.id.clone());
        let client_id = uuid::Uuid::new_v4().to_string();
        Self {
            id: MessageId::provisional(&client_id),
            client_id,
            conversation_id: conversation.id.clone(),
            sender_id: author.id.clone(),
            sender_role: author.role,
            sender_name: author.display_name.clone(),
            content,
            created_at: None,
            client_timestamp,
            status: DeliveryStatus::Pending,
            read: false,
            participants,
            last_error: None,
        }
    }

    /// Matches the current id, the client id, or the provisional id handed out at send time.
    pub fn matches_id(&self, id: &MessageId) -> bool {
        &self.id == id
            || self.client_id == id.as_str()
            || id.provisional_client_id() == Some(self.client_id.as_str())
    }

    pub fn transition(&mut self, next: DeliveryStatus) -> Result<(), String> {
        if !self.status.can_transition_to(next) {
            return Err(format!(
                "Message {} cannot move from {} to {}",
                self.id,
                self.status.as_str(),
                next.as_str()
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_delivered(
        &mut self,
        remote_id: MessageId,
        created_at: DateTime<Utc>,
    ) -> Result<(), String> {
        self.transition(DeliveryStatus::Delivered)?;
        self.id = remote_id;
        self.created_at = Some(created_at);
        self.last_error = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) -> Result<(), String> {
        self.transition(DeliveryStatus::Failed)?;
        self.last_error = Some(reason.into());
        Ok(())
    }

    /// Server timestamp when known, otherwise the local estimate.
    pub fn effective_timestamp(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(self.client_timestamp)
    }

    pub fn is_unread_for(&self, reader_id: &str) -> bool {
        !self.read && self.sender_id != reader_id && self.participants.contains(reader_id)
    }

    pub fn counterpart_of(&self, viewer_id: &str) -> Option<&str> {
        if self.sender_id != viewer_id {
            return Some(self.sender_id.as_str());
        }
        self.participants
            .iter()
            .map(String::as_str)
            .find(|participant| *participant != viewer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conversation() -> ConversationKey {
        ConversationKey::new(ConversationId::new("student-1").unwrap(), ["admin-1"])
    }

    fn pending() -> Message {
        Message::new_pending(
            &conversation(),
            &MessageAuthor::new("student-1", PresenceRole::Member),
            "hello".to_string(),
            Utc.timestamp_millis_opt(1_000).unwrap(),
        )
    }

    #[test]
    fn delivered_never_reverts() {
        let mut message = pending();
        message
            .mark_delivered(MessageId::remote("m1"), Utc.timestamp_millis_opt(2_000).unwrap())
            .unwrap();
        assert!(message.mark_failed("late failure").is_err());
        assert!(message.transition(DeliveryStatus::Pending).is_err());
        assert_eq!(message.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn failed_can_go_back_to_pending() {
        let mut message = pending();
        message.mark_failed("network").unwrap();
        assert_eq!(message.last_error.as_deref(), Some("network"));
        message.transition(DeliveryStatus::Pending).unwrap();
        assert_eq!(message.status, DeliveryStatus::Pending);
    }

    #[test]
    fn participants_include_sender() {
        let message = pending();
        assert!(message.participants.contains("student-1"));
        assert!(message.participants.contains("admin-1"));
        assert!(message.is_unread_for("admin-1"));
        assert!(!message.is_unread_for("student-1"));
        assert_eq!(message.counterpart_of("admin-1"), Some("student-1"));
        assert_eq!(message.counterpart_of("student-1"), Some("admin-1"));
    }

    #[test]
    fn send_time_ids_keep_resolving_after_delivery() {
        let mut message = pending();
        let provisional = message.id.clone();
        let client = MessageId::from(message.client_id.clone());
        message
            .mark_delivered(MessageId::remote("m9"), Utc.timestamp_millis_opt(5_000).unwrap())
            .unwrap();
        assert!(provisional.is_local());
        assert!(message.matches_id(&provisional));
        assert!(message.matches_id(&client));
        assert!(!message.matches_id(&MessageId::provisional("someone-else")));
        assert!(message.matches_id(&MessageId::remote("m9")));
    }
}
