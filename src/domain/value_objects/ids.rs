use serde::{Deserialize, Serialize};
use std::fmt;

const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err("Conversation ID cannot be empty".to_string());
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

/// Message identifier. Provisional ids carry the `local-` prefix until the store assigns one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Provisional id for a message that has not reached the store yet.
    pub fn provisional(client_id: &str) -> Self {
        Self(format!("{LOCAL_ID_PREFIX}{client_id}"))
    }

    pub fn remote(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_ID_PREFIX)
    }

    /// The client id a provisional id was derived from.
    pub fn provisional_client_id(&self) -> Option<&str> {
        self.0.strip_prefix(LOCAL_ID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_unique_and_flagged() {
        let a = MessageId::provisional("c-1");
        let b = MessageId::provisional("c-2");
        assert_ne!(a, b);
        assert!(a.is_local());
        assert_eq!(a.provisional_client_id(), Some("c-1"));
        assert!(!MessageId::remote("abc123").is_local());
        assert_eq!(MessageId::remote("abc123").provisional_client_id(), None);
    }

    #[test]
    fn blank_conversation_id_is_rejected() {
        assert!(ConversationId::new("  ").is_err());
        assert_eq!(ConversationId::new("student-1").unwrap().as_str(), "student-1");
    }
}
