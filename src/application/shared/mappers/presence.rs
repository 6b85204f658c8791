use super::{datetime_to_millis, millis_to_datetime, read_millis};
use crate::application::ports::{Document, DocumentKey};
use crate::domain::entities::PresenceRecord;
use crate::domain::value_objects::PresenceRole;
use crate::shared::config::StoreConfig;
use crate::shared::error::AppError;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

pub(crate) fn presence_key(
    config: &StoreConfig,
    owner_id: &str,
    role: PresenceRole,
) -> DocumentKey {
    let collection = match role {
        PresenceRole::Operator => &config.operator_presence_collection,
        PresenceRole::Member => &config.member_presence_collection,
    };
    DocumentKey::new(collection.clone(), owner_id)
}

/// Full online patch. Heartbeats write the same shape so a tick can recreate a lost record.
pub(crate) fn online_patch(owner_id: &str, role: PresenceRole, now: DateTime<Utc>) -> Document {
    to_document(json!({
        "ownerId": owner_id,
        "role": role.as_str(),
        "isOnline": true,
        "lastActiveAt": datetime_to_millis(now),
        "updatedAt": datetime_to_millis(now),
    }))
}

pub(crate) fn offline_patch(now: DateTime<Utc>) -> Document {
    to_document(json!({
        "isOnline": false,
        "lastActiveAt": datetime_to_millis(now),
        "updatedAt": datetime_to_millis(now),
    }))
}

pub(crate) fn last_seen_patch(seen_at: DateTime<Utc>) -> Document {
    to_document(json!({ "lastSeenAt": datetime_to_millis(seen_at) }))
}

pub(crate) fn document_to_presence(
    owner_id: &str,
    role: PresenceRole,
    document: &Document,
) -> Result<PresenceRecord, AppError> {
    if let Some(stored_role) = document.get("role").and_then(Value::as_str) {
        let parsed: PresenceRole = stored_role.parse().map_err(AppError::SerializationError)?;
        if parsed != role {
            return Err(AppError::SerializationError(format!(
                "Presence record for {owner_id} has role {parsed}, expected {role}"
            )));
        }
    }

    let is_online = document
        .get("isOnline")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let last_seen_at = read_millis(document, "lastSeenAt").and_then(millis_to_datetime);
    let updated_at = read_millis(document, "updatedAt").and_then(millis_to_datetime);
    let last_active_at = read_millis(document, "lastActiveAt")
        .and_then(millis_to_datetime)
        .or(updated_at)
        .or(last_seen_at)
        .unwrap_or_default();

    Ok(PresenceRecord {
        owner_id: owner_id.to_string(),
        role,
        is_online,
        last_active_at,
        updated_at: updated_at.unwrap_or(last_active_at),
        last_seen_at,
    })
}

fn to_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
