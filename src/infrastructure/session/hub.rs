use crate::application::ports::{Subscription, SubscriptionHandle};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;

struct Listener<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct HubState<T> {
    next_id: u64,
    listeners: Vec<Listener<T>>,
}

/// Fan-out of in-process events to every live subscription. Late subscribers see no replay.
pub struct BroadcastHub<T> {
    state: Arc<Mutex<HubState<T>>>,
}

impl<T> Default for BroadcastHub<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            state.listeners.push(Listener { id, tx });
            id
        };
        let weak: Weak<Mutex<HubState<T>>> = Arc::downgrade(&self.state);
        let handle = SubscriptionHandle::new(move || {
            if let Some(state) = weak.upgrade() {
                lock(&state).listeners.retain(|listener| listener.id != id);
            }
        });
        Subscription::new(handle, rx)
    }

    pub fn publish(&self, value: T) -> usize {
        let mut state = lock(&self.state);
        state
            .listeners
            .retain(|listener| listener.tx.send(value.clone()).is_ok());
        state.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.state).listeners.len()
    }
}

fn lock<T>(state: &Mutex<HubState<T>>) -> MutexGuard<'_, HubState<T>> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelled_listener_is_removed() {
        let hub = BroadcastHub::<u32>::new();
        let mut first = hub.subscribe();
        let second = hub.subscribe();

        assert_eq!(hub.publish(1), 2);
        second.handle.cancel();
        assert_eq!(hub.publish(2), 1);

        assert_eq!(first.updates.recv().await, Some(1));
        assert_eq!(first.updates.recv().await, Some(2));
    }
}
