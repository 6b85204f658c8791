use super::{datetime_to_millis, millis_to_datetime, read_millis};
use crate::application::ports::{Document, StoreQuery, StoredDocument};
use crate::domain::entities::{DeliveryStatus, Message};
use crate::domain::value_objects::{ConversationId, MessageId, PresenceRole};
use crate::shared::error::AppError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

pub(crate) fn message_to_document(message: &Message) -> Document {
    let mut doc = Document::new();
    doc.insert("clientId".into(), Value::from(message.client_id.clone()));
    doc.insert(
        "conversationId".into(),
        Value::from(message.conversation_id.as_str()),
    );
    doc.insert("senderId".into(), Value::from(message.sender_id.clone()));
    doc.insert("senderRole".into(), Value::from(message.sender_role.as_str()));
    if let Some(name) = &message.sender_name {
        doc.insert("senderName".into(), Value::from(name.clone()));
    }
    doc.insert("content".into(), Value::from(message.content.clone()));
    doc.insert(
        "clientTimestamp".into(),
        Value::from(datetime_to_millis(message.client_timestamp)),
    );
    doc.insert("read".into(), Value::Bool(message.read));
    doc.insert(
        "participants".into(),
        Value::Array(
            message
                .participants
                .iter()
                .cloned()
                .map(Value::from)
                .collect(),
        ),
    );
    doc
}

/// Anything read back from the store has been persisted, so it is delivered.
pub(crate) fn document_to_message(stored: &StoredDocument) -> Result<Message, AppError> {
    let data = &stored.data;
    let conversation_id = ConversationId::new(required_str(data, "conversationId", stored)?)
        .map_err(AppError::SerializationError)?;
    let sender_role: PresenceRole = required_str(data, "senderRole", stored)?
        .parse()
        .map_err(AppError::SerializationError)?;
    let created_at = read_millis(data, "createdAt").and_then(millis_to_datetime);
    let client_timestamp = read_millis(data, "clientTimestamp")
        .and_then(millis_to_datetime)
        .or(created_at)
        .unwrap_or_default();
    let participants: BTreeSet<String> = data
        .get("participants")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(Message {
        id: MessageId::remote(stored.key.id.clone()),
        client_id: data
            .get("clientId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| stored.key.id.clone()),
        conversation_id,
        sender_id: required_str(data, "senderId", stored)?.to_string(),
        sender_role,
        sender_name: data
            .get("senderName")
            .and_then(Value::as_str)
            .map(str::to_string),
        content: data
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        created_at,
        client_timestamp,
        status: DeliveryStatus::Delivered,
        read: data.get("read").and_then(Value::as_bool).unwrap_or(false),
        participants,
        last_error: None,
    })
}

pub(crate) fn read_patch(read_at: DateTime<Utc>) -> Document {
    let mut doc = Document::new();
    doc.insert("read".into(), Value::Bool(true));
    doc.insert("readAt".into(), Value::from(datetime_to_millis(read_at)));
    doc
}

pub(crate) fn conversation_query(collection: &str, conversation_id: &ConversationId) -> StoreQuery {
    StoreQuery::new(collection).where_eq("conversationId", conversation_id.as_str())
}

pub(crate) fn unread_for_reader_query(
    collection: &str,
    conversation_id: &ConversationId,
    reader_id: &str,
) -> StoreQuery {
    conversation_query(collection, conversation_id)
        .where_array_contains("participants", reader_id)
        .where_eq("read", false)
}

pub(crate) fn participant_query(collection: &str, participant_id: &str) -> StoreQuery {
    StoreQuery::new(collection).where_array_contains("participants", participant_id)
}

pub(crate) fn created_at_of(stored: &StoredDocument) -> Option<DateTime<Utc>> {
    read_millis(&stored.data, "createdAt").and_then(millis_to_datetime)
}

fn required_str<'a>(
    data: &'a Document,
    field: &str,
    stored: &StoredDocument,
) -> Result<&'a str, AppError> {
    data.get(field).and_then(Value::as_str).ok_or_else(|| {
        AppError::SerializationError(format!(
            "Message document {} is missing `{field}`",
            stored.key.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::DocumentKey;
    use crate::domain::entities::{ConversationKey, MessageAuthor};
    use chrono::TimeZone;

    #[test]
    fn stored_document_maps_to_delivered_message() {
        let conversation = ConversationKey::new(ConversationId::new("c1").unwrap(), ["admin-1"]);
        let author =
            MessageAuthor::new("student-1", PresenceRole::Member).with_display_name("Aiko");
        let local = Message::new_pending(
            &conversation,
            &author,
            "hi".to_string(),
            Utc.timestamp_millis_opt(1_000).unwrap(),
        );

        let mut data = message_to_document(&local);
        data.insert("createdAt".into(), Value::from(2_000_i64));
        let stored = StoredDocument {
            key: DocumentKey::new("messages", "remote-1"),
            data,
        };

        let message = document_to_message(&stored).unwrap();
        assert_eq!(message.id, MessageId::remote("remote-1"));
        assert_eq!(message.client_id, local.client_id);
        assert_eq!(message.status, DeliveryStatus::Delivered);
        assert_eq!(message.sender_name.as_deref(), Some("Aiko"));
        assert_eq!(message.created_at, Some(Utc.timestamp_millis_opt(2_000).unwrap()));
        assert_eq!(message.participants, local.participants);
    }

    #[test]
    fn missing_sender_is_a_serialization_error() {
        let stored = StoredDocument {
            key: DocumentKey::new("messages", "broken"),
            data: Document::new(),
        };
        assert!(matches!(
            document_to_message(&stored),
            Err(AppError::SerializationError(_))
        ));
    }
}
