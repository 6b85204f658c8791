use super::message_pipeline::LocalMessageEvent;
use crate::application::ports::{
    ChangeKind, RemoteStatusStore, StoreSnapshot, SubscriptionHandle, WatchTarget,
};
use crate::application::shared::SubscriptionRegistry;
use crate::application::shared::mappers::{
    document_to_message, last_seen_patch, participant_query, presence_key,
};
use crate::domain::entities::{ConversationSummary, DeliveryStatus, Message};
use crate::domain::value_objects::PresenceRole;
use crate::shared::config::{AppConfig, StoreConfig};
use crate::shared::error::AppError;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct FoldedMessage {
    message: Message,
    arrival: u64,
    counterpart: Option<String>,
}

/// A counterpart whose message was seen for the first time during a fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterpartSighting {
    pub counterpart_id: String,
    pub role: PresenceRole,
    pub seen_at: DateTime<Utc>,
}

/// Incremental fold of a message stream into per-counterpart summaries.
///
/// Entries are keyed by client id, so redelivered snapshots and the delivered copy of a
/// locally folded pending message replace rather than duplicate. Only the counterparts a
/// change touches are re-summarized.
#[derive(Debug)]
pub struct ConversationFold {
    viewer_id: String,
    messages: HashMap<String, FoldedMessage>,
    by_counterpart: HashMap<String, HashSet<String>>,
    summaries: HashMap<String, ConversationSummary>,
    dirty: HashSet<String>,
    next_arrival: u64,
}

impl ConversationFold {
    pub fn new(viewer_id: impl Into<String>) -> Self {
        Self {
            viewer_id: viewer_id.into(),
            messages: HashMap::new(),
            by_counterpart: HashMap::new(),
            summaries: HashMap::new(),
            dirty: HashSet::new(),
            next_arrival: 0,
        }
    }

    /// Folds one message; returns a sighting when it is new and authored by a counterpart.
    pub fn upsert(&mut self, message: Message) -> Option<CounterpartSighting> {
        let sighting = self.fold_message(message);
        self.refresh_dirty();
        sighting
    }

    /// Folds a message from the local log. A delivered entry never goes back to
    /// pending or failed because of a late local copy.
    pub fn upsert_local(&mut self, message: Message) -> bool {
        let downgrade = self
            .messages
            .get(&message.client_id)
            .map(|existing| {
                existing.message.status == DeliveryStatus::Delivered
                    && message.status != DeliveryStatus::Delivered
            })
            .unwrap_or(false);
        if downgrade {
            return false;
        }
        self.fold_message(message);
        self.refresh_dirty();
        true
    }

    pub fn remove(&mut self, client_id: &str) -> bool {
        let removed = self.unfold(client_id);
        self.refresh_dirty();
        removed
    }

    /// Applies a store snapshot and returns the newest sighting per counterpart.
    pub fn apply_snapshot(&mut self, snapshot: &StoreSnapshot) -> Vec<CounterpartSighting> {
        let mut newest: HashMap<String, CounterpartSighting> = HashMap::new();
        for change in &snapshot.changes {
            let message = match document_to_message(&change.document) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "skipping malformed message in conversation feed");
                    continue;
                }
            };
            match change.kind {
                ChangeKind::Removed => {
                    self.unfold(&message.client_id);
                }
                ChangeKind::Added | ChangeKind::Modified => {
                    if let Some(sighting) = self.fold_message(message) {
                        let replace = newest
                            .get(&sighting.counterpart_id)
                            .map(|current| sighting.seen_at > current.seen_at)
                            .unwrap_or(true);
                        if replace {
                            newest.insert(sighting.counterpart_id.clone(), sighting);
                        }
                    }
                }
            }
        }
        self.refresh_dirty();
        newest.into_values().collect()
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut summaries: Vec<ConversationSummary> = self.summaries.values().cloned().collect();
        summaries.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.counterpart_id.cmp(&b.counterpart_id))
        });
        summaries
    }

    pub fn summary_for(&self, counterpart_id: &str) -> Option<ConversationSummary> {
        self.summaries.get(counterpart_id).cloned()
    }

    fn fold_message(&mut self, message: Message) -> Option<CounterpartSighting> {
        let counterpart = message.counterpart_of(&self.viewer_id).map(str::to_string);
        let sighting = (message.sender_id != self.viewer_id).then(|| CounterpartSighting {
            counterpart_id: message.sender_id.clone(),
            role: message.sender_role,
            seen_at: message.effective_timestamp(),
        });
        let client_id = message.client_id.clone();

        let existing = self
            .messages
            .get(&client_id)
            .map(|entry| (entry.arrival, entry.counterpart.clone()));
        let arrival = match &existing {
            Some((arrival, previous)) => {
                if *previous != counterpart {
                    self.unindex(&client_id, previous.as_deref());
                }
                *arrival
            }
            None => {
                self.next_arrival += 1;
                self.next_arrival
            }
        };

        if let Some(counterpart) = &counterpart {
            self.by_counterpart
                .entry(counterpart.clone())
                .or_default()
                .insert(client_id.clone());
            self.dirty.insert(counterpart.clone());
        }
        self.messages.insert(
            client_id,
            FoldedMessage {
                message,
                arrival,
                counterpart,
            },
        );
        if existing.is_some() { None } else { sighting }
    }

    fn unfold(&mut self, client_id: &str) -> bool {
        match self.messages.remove(client_id) {
            Some(entry) => {
                self.unindex(client_id, entry.counterpart.as_deref());
                true
            }
            None => false,
        }
    }

    fn unindex(&mut self, client_id: &str, counterpart: Option<&str>) {
        let Some(counterpart) = counterpart else {
            return;
        };
        if let Some(ids) = self.by_counterpart.get_mut(counterpart) {
            ids.remove(client_id);
            if ids.is_empty() {
                self.by_counterpart.remove(counterpart);
            }
        }
        self.dirty.insert(counterpart.to_string());
    }

    fn refresh_dirty(&mut self) {
        for counterpart in std::mem::take(&mut self.dirty) {
            let summary = self.by_counterpart.get(&counterpart).and_then(|ids| {
                let folded: Vec<&FoldedMessage> =
                    ids.iter().filter_map(|id| self.messages.get(id)).collect();
                summarize(&self.viewer_id, &counterpart, &folded)
            });
            match summary {
                Some(summary) => {
                    self.summaries.insert(counterpart, summary);
                }
                None => {
                    self.summaries.remove(&counterpart);
                }
            }
        }
    }
}

fn summarize(
    viewer_id: &str,
    counterpart_id: &str,
    folded: &[&FoldedMessage],
) -> Option<ConversationSummary> {
    let last = folded
        .iter()
        .max_by_key(|entry| (entry.message.effective_timestamp(), entry.arrival))?;
    let unread_count = folded
        .iter()
        .filter(|entry| {
            entry.message.sender_id == counterpart_id && entry.message.is_unread_for(viewer_id)
        })
        .count() as u64;
    let counterpart_name = folded
        .iter()
        .filter(|entry| entry.message.sender_id == counterpart_id)
        .filter_map(|entry| {
            entry
                .message
                .sender_name
                .as_ref()
                .map(|name| ((entry.message.effective_timestamp(), entry.arrival), name))
        })
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| counterpart_id.to_string());

    Some(ConversationSummary {
        counterpart_id: counterpart_id.to_string(),
        counterpart_name,
        last_message_at: last.message.effective_timestamp(),
        last_message: last.message.clone(),
        unread_count,
    })
}

struct AggregatorInner {
    viewer_id: String,
    store: Arc<dyn RemoteStatusStore>,
    store_config: StoreConfig,
    fold: Mutex<ConversationFold>,
    last_touched: Mutex<HashMap<String, DateTime<Utc>>>,
    tx: watch::Sender<Vec<ConversationSummary>>,
    feed_started: AtomicBool,
    subscriptions: SubscriptionRegistry,
}

/// Live conversation list for one viewer, built from every message that names them as a
/// participant. Seeing a new message from a counterpart also touches that counterpart's
/// presence `lastSeenAt` when the counterpart has a presence record.
pub struct ConversationAggregator {
    inner: Arc<AggregatorInner>,
}

impl ConversationAggregator {
    pub fn new(
        viewer_id: impl Into<String>,
        config: &AppConfig,
        store: Arc<dyn RemoteStatusStore>,
    ) -> Self {
        let viewer_id = viewer_id.into();
        let (tx, _rx) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(AggregatorInner {
                fold: Mutex::new(ConversationFold::new(viewer_id.clone())),
                viewer_id,
                store,
                store_config: config.store.clone(),
                last_touched: Mutex::new(HashMap::new()),
                tx,
                feed_started: AtomicBool::new(false),
                subscriptions: SubscriptionRegistry::new(),
            }),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.inner.viewer_id
    }

    pub async fn start(&self) -> Result<(), AppError> {
        if self.inner.feed_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let query = participant_query(
            &self.inner.store_config.messages_collection,
            &self.inner.viewer_id,
        );
        let subscription = match self.inner.store.subscribe(WatchTarget::Query(query)).await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.inner.feed_started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        let (handle, mut updates) = subscription.into_parts();

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(snapshot) = updates.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.apply_snapshot(&snapshot);
            }
        });
        self.inner
            .subscriptions
            .register(format!("conversations:{}", self.inner.viewer_id), handle, Some(pump));
        debug!(viewer_id = %self.inner.viewer_id, "conversation aggregator started");
        Ok(())
    }

    /// Folds local sends, failures, retries and deletes as the pipeline reports them.
    pub fn follow_local(&self, mut events: broadcast::Receiver<LocalMessageEvent>) {
        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.apply_local(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "local message events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.inner.subscriptions.register(
            format!("local-messages:{}", self.inner.viewer_id),
            SubscriptionHandle::noop(),
            Some(pump),
        );
    }

    /// Folds a local message (typically still pending) ahead of the store echo.
    pub fn note_local(&self, message: &Message) {
        self.inner
            .apply_local(LocalMessageEvent::Upserted(message.clone()));
    }

    pub fn apply_snapshot(&self, snapshot: &StoreSnapshot) {
        self.inner.apply_snapshot(snapshot);
    }

    pub fn conversation_list(&self) -> watch::Receiver<Vec<ConversationSummary>> {
        self.inner.tx.subscribe()
    }

    pub fn current(&self) -> Vec<ConversationSummary> {
        self.inner.tx.borrow().clone()
    }

    pub fn summary_for(&self, counterpart_id: &str) -> Option<ConversationSummary> {
        self.inner.lock_fold().summary_for(counterpart_id)
    }

    pub fn stop(&self) {
        let disposed = self.inner.subscriptions.dispose_all();
        self.inner.feed_started.store(false, Ordering::SeqCst);
        debug!(viewer_id = %self.inner.viewer_id, disposed, "conversation aggregator stopped");
    }
}

impl Drop for ConversationAggregator {
    fn drop(&mut self) {
        self.inner.subscriptions.dispose_all();
    }
}

impl AggregatorInner {
    fn lock_fold(&self) -> MutexGuard<'_, ConversationFold> {
        match self.fold.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self) {
        let summaries = self.lock_fold().summaries();
        self.tx.send_replace(summaries);
    }

    fn apply_snapshot(&self, snapshot: &StoreSnapshot) {
        let sightings = self.lock_fold().apply_snapshot(snapshot);
        self.publish();
        for sighting in sightings {
            self.touch_last_seen(sighting);
        }
    }

    fn apply_local(&self, event: LocalMessageEvent) {
        let changed = match event {
            LocalMessageEvent::Upserted(message) => self.lock_fold().upsert_local(message),
            LocalMessageEvent::Removed { client_id } => self.lock_fold().remove(&client_id),
        };
        if changed {
            self.publish();
        }
    }

    fn touch_last_seen(&self, sighting: CounterpartSighting) {
        {
            let mut touched = match self.last_touched.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let newer = touched
                .get(&sighting.counterpart_id)
                .map(|previous| sighting.seen_at > *previous)
                .unwrap_or(true);
            if !newer {
                return;
            }
            touched.insert(sighting.counterpart_id.clone(), sighting.seen_at);
        }

        let store = self.store.clone();
        let key = presence_key(&self.store_config, &sighting.counterpart_id, sighting.role);
        tokio::spawn(async move {
            // presence records are created by their owner's tracker, never here
            match store.get(&key).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(
                        counterpart_id = %sighting.counterpart_id,
                        "no presence record to touch"
                    );
                    return;
                }
                Err(err) => {
                    warn!(
                        counterpart_id = %sighting.counterpart_id,
                        error = %err,
                        "lastSeenAt lookup failed"
                    );
                    return;
                }
            }
            if let Err(err) = store.set(&key, last_seen_patch(sighting.seen_at), true).await {
                warn!(
                    counterpart_id = %sighting.counterpart_id,
                    error = %err,
                    "lastSeenAt update failed"
                );
            }
        });
    }
}
