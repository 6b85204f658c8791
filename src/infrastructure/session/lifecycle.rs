use super::hub::BroadcastHub;
use crate::application::ports::{AppLifecycleSource, Subscription};
use crate::domain::value_objects::AppLifecycleState;
use tracing::debug;

#[derive(Default)]
pub struct LifecycleBroadcaster {
    hub: BroadcastHub<AppLifecycleState>,
}

impl LifecycleBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, state: AppLifecycleState) {
        let listeners = self.hub.publish(state);
        debug!(state = ?state, listeners, "app lifecycle changed");
    }

    pub fn listener_count(&self) -> usize {
        self.hub.listener_count()
    }
}

impl AppLifecycleSource for LifecycleBroadcaster {
    fn subscribe(&self) -> Subscription<AppLifecycleState> {
        self.hub.subscribe()
    }
}
