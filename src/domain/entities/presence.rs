use crate::domain::value_objects::PresenceRole;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub owner_id: String,
    pub role: PresenceRole,
    pub is_online: bool,
    pub last_active_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    pub fn online(owner_id: impl Into<String>, role: PresenceRole, now: DateTime<Utc>) -> Self {
        Self {
            owner_id: owner_id.into(),
            role,
            is_online: true,
            last_active_at: now,
            updated_at: now,
            last_seen_at: None,
        }
    }

    pub fn offline(owner_id: impl Into<String>, role: PresenceRole, now: DateTime<Utc>) -> Self {
        Self {
            is_online: false,
            ..Self::online(owner_id, role, now)
        }
    }

    /// `is_online` as stored, discounted when the last heartbeat is older than `stale_after`.
    pub fn is_live(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if !self.is_online {
            return false;
        }
        let age = now.signed_duration_since(self.last_active_at);
        match age.to_std() {
            Ok(age) => age <= stale_after,
            // heartbeat from the future (clock skew) counts as fresh
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceView {
    pub owner_id: String,
    pub role: PresenceRole,
    pub status: PresenceStatus,
    pub last_active_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl PresenceView {
    pub fn unknown(owner_id: impl Into<String>, role: PresenceRole) -> Self {
        Self {
            owner_id: owner_id.into(),
            role,
            status: PresenceStatus::Unknown,
            last_active_at: None,
            last_seen_at: None,
        }
    }

    pub fn from_record(
        owner_id: &str,
        role: PresenceRole,
        record: Option<&PresenceRecord>,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Self {
        match record {
            None => Self {
                owner_id: owner_id.to_string(),
                role,
                status: PresenceStatus::Offline,
                last_active_at: None,
                last_seen_at: None,
            },
            Some(record) => Self {
                owner_id: owner_id.to_string(),
                role,
                status: if record.is_live(now, stale_after) {
                    PresenceStatus::Online
                } else {
                    PresenceStatus::Offline
                },
                last_active_at: Some(record.last_active_at),
                last_seen_at: record.last_seen_at,
            },
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == PresenceStatus::Online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn stale_heartbeat_renders_offline() {
        let record = PresenceRecord::online("s1", PresenceRole::Member, at(0));
        let window = Duration::from_secs(90);

        let fresh = PresenceView::from_record("s1", PresenceRole::Member, Some(&record), at(60), window);
        assert_eq!(fresh.status, PresenceStatus::Online);

        let stale =
            PresenceView::from_record("s1", PresenceRole::Member, Some(&record), at(91), window);
        assert_eq!(stale.status, PresenceStatus::Offline);
        assert_eq!(stale.last_active_at, Some(at(0)));
    }

    #[test]
    fn missing_record_is_offline_not_unknown() {
        let view =
            PresenceView::from_record("a1", PresenceRole::Operator, None, at(0), Duration::from_secs(90));
        assert_eq!(view.status, PresenceStatus::Offline);
        assert_eq!(PresenceView::unknown("a1", PresenceRole::Operator).status, PresenceStatus::Unknown);
    }
}
