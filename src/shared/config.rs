use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    pub presence: PresenceConfig,
    pub messaging: MessagingConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub heartbeat_interval_secs: u64,
    pub background_timeout_secs: u64,
    /// 0 の場合は heartbeat 間隔の 3 倍を使う
    #[serde(default)]
    pub stale_after_secs: u64,
    pub delete_operator_record_on_offline: bool,
    pub delete_member_record_on_offline: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    pub send_timeout_secs: u64,
    pub max_content_length: usize,
    pub read_batch_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub operator_presence_collection: String,
    pub member_presence_collection: String,
    pub messages_collection: String,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            background_timeout_secs: 3600, // 1 hour
            stale_after_secs: 0,
            delete_operator_record_on_offline: true,
            delete_member_record_on_offline: false,
        }
    }
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 15,
            max_content_length: 4000,
            read_batch_limit: 500,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            operator_presence_collection: "operator_status".to_string(),
            member_presence_collection: "member_status".to_string(),
            messages_collection: "messages".to_string(),
        }
    }
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }

    pub fn stale_after(&self) -> Duration {
        if self.stale_after_secs == 0 {
            Duration::from_secs(self.heartbeat_interval_secs.saturating_mul(3))
        } else {
            Duration::from_secs(self.stale_after_secs)
        }
    }
}

impl MessagingConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(value) = env_u64("PORTAL_HEARTBEAT_INTERVAL_SECS") {
            cfg.presence.heartbeat_interval_secs = value.max(1);
        }
        if let Some(value) = env_u64("PORTAL_BACKGROUND_TIMEOUT_SECS") {
            cfg.presence.background_timeout_secs = value.max(1);
        }
        if let Some(value) = env_u64("PORTAL_PRESENCE_STALE_AFTER_SECS") {
            cfg.presence.stale_after_secs = value;
        }
        if let Ok(v) = std::env::var("PORTAL_DELETE_OPERATOR_PRESENCE") {
            cfg.presence.delete_operator_record_on_offline =
                parse_bool(&v, cfg.presence.delete_operator_record_on_offline);
        }
        if let Ok(v) = std::env::var("PORTAL_DELETE_MEMBER_PRESENCE") {
            cfg.presence.delete_member_record_on_offline =
                parse_bool(&v, cfg.presence.delete_member_record_on_offline);
        }

        if let Some(value) = env_u64("PORTAL_SEND_TIMEOUT_SECS") {
            cfg.messaging.send_timeout_secs = value.max(1);
        }
        if let Some(value) = env_u64("PORTAL_MAX_CONTENT_LENGTH") {
            cfg.messaging.max_content_length = value as usize;
        }
        if let Some(value) = env_u64("PORTAL_READ_BATCH_LIMIT") {
            cfg.messaging.read_batch_limit = value as usize;
        }

        if let Some(value) = env_string("PORTAL_OPERATOR_PRESENCE_COLLECTION") {
            cfg.store.operator_presence_collection = value;
        }
        if let Some(value) = env_string("PORTAL_MEMBER_PRESENCE_COLLECTION") {
            cfg.store.member_presence_collection = value;
        }
        if let Some(value) = env_string("PORTAL_MESSAGES_COLLECTION") {
            cfg.store.messages_collection = value;
        }

        cfg
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.presence.heartbeat_interval_secs == 0 {
            return Err("Presence heartbeat_interval_secs must be greater than 0".to_string());
        }
        if self.presence.background_timeout_secs == 0 {
            return Err("Presence background_timeout_secs must be greater than 0".to_string());
        }
        if self.presence.stale_after() < self.presence.heartbeat_interval() {
            return Err(
                "Presence stale_after_secs must not be shorter than the heartbeat interval"
                    .to_string(),
            );
        }
        if self.messaging.send_timeout_secs == 0 {
            return Err("Messaging send_timeout_secs must be greater than 0".to_string());
        }
        if self.messaging.max_content_length == 0 {
            return Err("Messaging max_content_length must be greater than 0".to_string());
        }
        if self.messaging.read_batch_limit == 0 {
            return Err("Messaging read_batch_limit must be greater than 0".to_string());
        }
        if self.store.operator_presence_collection == self.store.member_presence_collection {
            return Err("Operator and member presence collections must differ".to_string());
        }
        Ok(())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| parse_u64(&v))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_bool(s: &str, default: bool) -> bool {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn parse_u64(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.presence.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.presence.background_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.presence.stale_after(), Duration::from_secs(90));
    }

    #[test]
    fn stale_window_shorter_than_heartbeat_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.presence.stale_after_secs = 10;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn shared_presence_collection_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.store.member_presence_collection = cfg.store.operator_presence_collection.clone();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn parse_bool_falls_back_to_default() {
        assert!(parse_bool("YES", false));
        assert!(!parse_bool("off", true));
        assert!(parse_bool("maybe", true));
    }
}
