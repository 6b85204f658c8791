pub(crate) mod messages;
pub(crate) mod presence;

use crate::application::ports::Document;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

pub(crate) use messages::{
    conversation_query, created_at_of, document_to_message, message_to_document,
    participant_query, read_patch, unread_for_reader_query,
};
pub(crate) use presence::{
    document_to_presence, last_seen_patch, offline_patch, online_patch, presence_key,
};

pub(crate) fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) fn datetime_to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub(crate) fn read_millis(document: &Document, field: &str) -> Option<i64> {
    match document.get(field)? {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        _ => None,
    }
}
