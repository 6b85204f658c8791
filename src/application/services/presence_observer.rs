use crate::application::ports::{
    ChangeKind, Clock, DocumentKey, RemoteStatusStore, StoreSnapshot, TimerCallback, TimerHandle,
    TimerScheduler, WatchTarget,
};
use crate::application::shared::SubscriptionRegistry;
use crate::application::shared::mappers::{document_to_presence, presence_key};
use crate::domain::entities::{PresenceRecord, PresenceView};
use crate::domain::value_objects::PresenceRole;
use crate::shared::config::{AppConfig, StoreConfig};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

struct WatchedPresence {
    owner_id: String,
    role: PresenceRole,
    record: Option<PresenceRecord>,
    unreadable: bool,
    tx: watch::Sender<PresenceView>,
}

impl WatchedPresence {
    fn render(&self, now: DateTime<Utc>, stale_after: Duration) -> PresenceView {
        if self.unreadable {
            return PresenceView::unknown(self.owner_id.clone(), self.role);
        }
        PresenceView::from_record(
            &self.owner_id,
            self.role,
            self.record.as_ref(),
            now,
            stale_after,
        )
    }

    fn publish(&self, now: DateTime<Utc>, stale_after: Duration) {
        let next = self.render(now, stale_after);
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn apply(&mut self, snapshot: &StoreSnapshot) {
        for change in &snapshot.changes {
            match change.kind {
                ChangeKind::Removed => {
                    self.record = None;
                    self.unreadable = false;
                }
                ChangeKind::Added | ChangeKind::Modified => {
                    match document_to_presence(&self.owner_id, self.role, &change.document.data) {
                        Ok(record) => {
                            self.record = Some(record);
                            self.unreadable = false;
                        }
                        Err(err) => {
                            warn!(owner_id = %self.owner_id, role = %self.role, error = %err, "unreadable presence record");
                            self.unreadable = true;
                        }
                    }
                }
            }
        }
    }
}

struct ObserverInner {
    store: Arc<dyn RemoteStatusStore>,
    timers: Arc<dyn TimerScheduler>,
    clock: Arc<dyn Clock>,
    store_config: StoreConfig,
    stale_after: Duration,
    recheck_every: Duration,
    watched: Mutex<HashMap<DocumentKey, WatchedPresence>>,
    recheck: Mutex<Option<TimerHandle>>,
    subscriptions: SubscriptionRegistry,
}

/// Read-only presence feed for other users. A record whose heartbeat is older than the
/// staleness window renders offline even while it still claims `isOnline`.
pub struct PresenceObserver {
    inner: Arc<ObserverInner>,
}

impl PresenceObserver {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn RemoteStatusStore>,
        timers: Arc<dyn TimerScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                store,
                timers,
                clock,
                store_config: config.store.clone(),
                stale_after: config.presence.stale_after(),
                recheck_every: config.presence.heartbeat_interval(),
                watched: Mutex::new(HashMap::new()),
                recheck: Mutex::new(None),
                subscriptions: SubscriptionRegistry::new(),
            }),
        }
    }

    pub async fn presence_of(
        &self,
        owner_id: &str,
        role: PresenceRole,
    ) -> watch::Receiver<PresenceView> {
        let key = presence_key(&self.inner.store_config, owner_id, role);
        if let Some(existing) = self.inner.lock_watched().get(&key) {
            return existing.tx.subscribe();
        }

        let (tx, rx) = watch::channel(PresenceView::unknown(owner_id, role));
        let subscription = match self
            .inner
            .store
            .subscribe(WatchTarget::Document(key.clone()))
            .await
        {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(owner_id = %owner_id, role = %role, error = %err, "presence subscribe failed");
                return rx;
            }
        };

        {
            let mut watched = self.inner.lock_watched();
            if let Some(existing) = watched.get(&key) {
                subscription.handle.cancel();
                return existing.tx.subscribe();
            }
            watched.insert(
                key.clone(),
                WatchedPresence {
                    owner_id: owner_id.to_string(),
                    role,
                    record: None,
                    unreadable: false,
                    tx,
                },
            );
        }

        let (handle, mut updates) = subscription.into_parts();
        let weak = Arc::downgrade(&self.inner);
        let pump_key = key.clone();
        let pump = tokio::spawn(async move {
            while let Some(snapshot) = updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.apply_snapshot(&pump_key, &snapshot);
            }
        });
        self.inner
            .subscriptions
            .register(format!("presence:{}/{}", key.collection, key.id), handle, Some(pump));
        self.inner.ensure_recheck();
        debug!(owner_id = %owner_id, role = %role, "watching presence");
        rx
    }

    /// Re-renders every watched record against the current time.
    pub fn reevaluate(&self) {
        self.inner.reevaluate();
    }

    pub fn watched_count(&self) -> usize {
        self.inner.lock_watched().len()
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Drop for PresenceObserver {
    fn drop(&mut self) {
        self.inner.dispose();
    }
}

impl ObserverInner {
    fn lock_watched(&self) -> MutexGuard<'_, HashMap<DocumentKey, WatchedPresence>> {
        match self.watched.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_recheck(&self) -> MutexGuard<'_, Option<TimerHandle>> {
        match self.recheck.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn apply_snapshot(&self, key: &DocumentKey, snapshot: &StoreSnapshot) {
        let now = self.clock.now();
        let mut watched = self.lock_watched();
        if let Some(entry) = watched.get_mut(key) {
            entry.apply(snapshot);
            entry.publish(now, self.stale_after);
        }
    }

    fn reevaluate(&self) {
        let now = self.clock.now();
        for entry in self.lock_watched().values() {
            entry.publish(now, self.stale_after);
        }
    }

    fn ensure_recheck(self: &Arc<Self>) {
        let mut recheck = self.lock_recheck();
        if recheck.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let callback: TimerCallback = Arc::new(move || {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.reevaluate();
                }
            }
            .boxed()
        });
        *recheck = Some(self.timers.schedule_repeating(self.recheck_every, callback));
    }

    fn dispose(&self) {
        if let Some(handle) = self.lock_recheck().take() {
            self.timers.cancel(handle);
        }
        self.subscriptions.dispose_all();
        self.lock_watched().clear();
    }
}
