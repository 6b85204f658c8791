use crate::application::ports::SubscriptionHandle;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

struct ActiveSubscription {
    label: String,
    handle: SubscriptionHandle,
    pump: Option<JoinHandle<()>>,
}

/// Live streams owned by one component, disposed together.
#[derive(Default)]
pub struct SubscriptionRegistry {
    active: Mutex<Vec<ActiveSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        label: impl Into<String>,
        handle: SubscriptionHandle,
        pump: Option<JoinHandle<()>>,
    ) {
        let mut active = self.lock();
        active.retain(|entry| !entry.handle.is_cancelled());
        active.push(ActiveSubscription {
            label: label.into(),
            handle,
            pump,
        });
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dispose_all(&self) -> usize {
        let drained: Vec<ActiveSubscription> = self.lock().drain(..).collect();
        let count = drained.len();
        for entry in drained {
            entry.handle.cancel();
            if let Some(pump) = entry.pump {
                pump.abort();
            }
            debug!(label = %entry.label, "subscription disposed");
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ActiveSubscription>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for SubscriptionRegistry {
    fn drop(&mut self) {
        self.dispose_all();
    }
}
