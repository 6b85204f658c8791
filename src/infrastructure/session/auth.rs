use super::hub::BroadcastHub;
use crate::application::ports::{AuthState, Subscription};
use std::sync::Mutex;
use tracing::info;

/// Auth state held in memory; the harness and tests drive sign-in and sign-out directly.
#[derive(Default)]
pub struct MemoryAuthState {
    current: Mutex<Option<String>>,
    hub: BroadcastHub<Option<String>>,
}

impl MemoryAuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<String>) -> Self {
        let auth = Self::new();
        auth.set_current(Some(user_id.into()));
        auth
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        info!(user_id = %user_id, "user signed in");
        self.set_current(Some(user_id.clone()));
        self.hub.publish(Some(user_id));
    }

    pub fn sign_out(&self) {
        info!("user signed out");
        self.set_current(None);
        self.hub.publish(None);
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }

    fn set_current(&self, value: Option<String>) {
        match self.current.lock() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

impl AuthState for MemoryAuthState {
    fn current_user_id(&self) -> Option<String> {
        match self.current.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn subscribe(&self) -> Subscription<Option<String>> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sign_out_clears_user_and_notifies() {
        let auth = MemoryAuthState::signed_in("admin-1");
        let mut sub = auth.subscribe();
        assert_eq!(auth.current_user_id().as_deref(), Some("admin-1"));

        auth.sign_out();
        assert_eq!(auth.current_user_id(), None);
        assert_eq!(sub.updates.recv().await, Some(None));
    }
}
