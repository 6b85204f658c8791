use super::subscription::Subscription;
use crate::domain::value_objects::AppLifecycleState;

/// Authenticated-user source. The stream yields the new user id (or `None` on sign-out).
pub trait AuthState: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
    fn subscribe(&self) -> Subscription<Option<String>>;
}

pub trait AppLifecycleSource: Send + Sync {
    fn subscribe(&self) -> Subscription<AppLifecycleState>;
}
